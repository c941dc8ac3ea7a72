use anyhow::{Context, Result};
use aya::maps::HashMap;
use aya::Ebpf;
use h2probe_common::TraceStats;

/// Read the kernel-side counters under key 0 of `TRACE_STATS`
///
/// # Errors
/// Returns an error if the map cannot be accessed
pub fn read_trace_stats(bpf: &Ebpf) -> Result<TraceStats> {
    let stats: HashMap<_, u32, TraceStats> =
        HashMap::try_from(bpf.map("TRACE_STATS").context("TRACE_STATS map not found")?)?;
    Ok(stats.get(&0u32, 0).unwrap_or_default())
}

/// Print the kernel-side counters
///
/// - connections that were handed a fresh identity
/// - records written to and refused by the ring buffer
/// - probe hits abandoned before emission
///
/// # Errors
/// Returns an error if the eBPF diagnostic map cannot be accessed
pub fn print_trace_diagnostics(bpf: &Ebpf) -> Result<()> {
    let stats = read_trace_stats(bpf)?;
    eprintln!("{}", format_trace_stats(&stats));
    Ok(())
}

fn format_trace_stats(stats: &TraceStats) -> String {
    let mut text = format!(
        "kernel: {} connections, {} records emitted, {} dropped, {} abandoned",
        stats.socket_map_count,
        stats.emitted_events,
        stats.dropped_events,
        stats.abandoned_events
    );
    if stats.dropped_events > 0 {
        text.push_str("\nwarning: records were dropped (ring buffer full or oversized fields)");
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_trace_stats() {
        let stats = TraceStats {
            socket_map_count: 2,
            emitted_events: 30,
            dropped_events: 0,
            abandoned_events: 4,
        };
        assert_eq!(
            format_trace_stats(&stats),
            "kernel: 2 connections, 30 records emitted, 0 dropped, 4 abandoned"
        );
    }

    #[test]
    fn test_drops_are_flagged() {
        let stats = TraceStats { dropped_events: 1, ..TraceStats::default() };
        assert!(format_trace_stats(&stats).contains("warning: records were dropped"));
    }
}
