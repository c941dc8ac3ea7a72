//! # h2probe - Main Entry Point
//!
//! Resolves the target, publishes its layout into the eBPF maps, attaches the
//! header probes and prints header blocks until interrupted, the duration
//! limit is reached, or the target exits.

#![allow(clippy::too_many_lines)]

use anyhow::{Context, Result};
use aya::maps::RingBuf;
use clap::Parser;
use log::{info, warn};
use std::time::{Duration, Instant};

use h2probe::cli::Args;
use h2probe::config::{parse_go_version, LayoutConfig};
use h2probe::domain::Pid;
use h2probe::preflight::{check_proc_access, check_process_exists, run_preflight_checks};
use h2probe::process_lookup::{find_process_by_name, resolve_exe_path};
use h2probe::probing::{
    attach_header_uprobes, attach_read_tracepoints, display_summary, init_ebpf_logger,
    load_ebpf_program, print_trace_diagnostics, publish_layout, EventProcessor, OutputFormat,
};

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_NOPERM: i32 = 77;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let msg = err.to_string().to_lowercase();
    if msg.contains("permission denied") || msg.contains("requires root") {
        EXIT_NOPERM
    } else if msg.contains("missing required argument") {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

/// Resolve PID and binary path from CLI arguments.
///
/// Supports three modes:
/// - `h2probe my-svc` - find process by name, auto-detect binary
/// - `h2probe --pid 1234` - explicit PID, auto-detect binary from /proc
/// - `h2probe --pid 1234 --target ./svc` - explicit PID and binary
fn resolve_pid_and_target(args: &Args) -> Result<(Pid, String)> {
    // Mode A: Process name provided - auto-detect both
    if let Some(ref name) = args.process {
        if args.pid.is_some() || args.target.is_some() {
            anyhow::bail!(
                "Cannot use PROCESS argument with --pid or --target.\n\n\
                 Use either:\n  \
                 h2probe my-svc --layout l.json          (auto-detect)\n  \
                 h2probe --pid 1234 --layout l.json      (explicit PID)"
            );
        }
        let found = find_process_by_name(name)?;
        let target = found.exe_path.to_string_lossy().into_owned();
        return Ok((found.pid, target));
    }

    // Mode B: Explicit PID provided
    if let Some(pid) = args.pid {
        let pid = Pid(pid);
        let target = if let Some(ref t) = args.target {
            std::fs::canonicalize(t)
                .with_context(|| format!("Failed to resolve path: {t}"))?
                .to_string_lossy()
                .into_owned()
        } else {
            resolve_exe_path(pid)?.to_string_lossy().into_owned()
        };
        return Ok((pid, target));
    }

    anyhow::bail!(
        "Missing required argument: PROCESS or --pid\n\n\
         Usage:\n  \
         h2probe my-svc --layout l.json          Auto-detect PID and binary\n  \
         h2probe --pid 1234 --layout l.json      Explicit PID, auto-detect binary\n\n\
         Run 'h2probe --help' for more options"
    )
}

/// Warn when the layout was produced for a different compiler than the one
/// recorded in the binary
fn check_layout_version(layout: &LayoutConfig, binary_version: Option<&str>) {
    let Some(binary_version) = binary_version else {
        return;
    };
    match (parse_go_version(&layout.go.version), parse_go_version(binary_version)) {
        (Ok(expected), Ok(actual)) if expected != actual => warn!(
            "Layout is for {} but the binary was built with {binary_version}; \
             offsets may not match",
            layout.go.version
        ),
        _ => {}
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();
    let quiet = args.quiet;

    let (pid, target_path) = resolve_pid_and_target(&args)?;

    // Run pre-flight checks before anything else
    let binary_version = run_preflight_checks(&target_path)?;
    check_process_exists(pid.0)?;
    check_proc_access(pid.0)?;

    let layout = LayoutConfig::from_file(&args.layout)
        .with_context(|| format!("Failed to load layout {}", args.layout.display()))?;
    check_layout_version(&layout, binary_version.as_deref());
    let proc_info = layout.to_proc_info()?;
    let kernel_offsets = layout.to_kernel_offsets();

    if !quiet {
        eprintln!("h2probe v{}", env!("CARGO_PKG_VERSION"));
        eprintln!("target: {target_path}");
        eprintln!("pid: {}", pid.0);
        eprintln!("go: {}", binary_version.as_deref().unwrap_or(&layout.go.version));
    }

    // ── Load eBPF and publish tables ────────────────────────────────────
    let mut bpf = load_ebpf_program()?;
    init_ebpf_logger(&mut bpf);

    publish_layout(&mut bpf, pid, &proc_info, &kernel_offsets)?;

    // Sequence dedup for ingress headers needs the read hooks in place first
    attach_read_tracepoints(&mut bpf)?;
    let attached = attach_header_uprobes(&mut bpf, &target_path, pid)?;

    if !quiet {
        eprintln!("probes: {attached}");
    }

    let mut ring_buf = RingBuf::try_from(bpf.take_map("EVENTS").context("map not found")?)?;

    let format = if args.json { OutputFormat::Json } else { OutputFormat::Text };
    let mut processor = EventProcessor::new(format, std::io::stdout());

    let mut last_status_time = Instant::now();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let started = Instant::now();
    let duration_limit =
        if args.duration > 0 { Some(Duration::from_secs(args.duration)) } else { None };

    // Pre-compute proc path for process liveness check
    let proc_path = format!("/proc/{}", pid.0);

    let mut exit_reason = "interrupted";

    loop {
        if let Some(limit) = duration_limit {
            if started.elapsed() >= limit {
                exit_reason = "duration limit reached";
                break;
            }
        }

        if !std::path::Path::new(&proc_path).exists() {
            exit_reason = "process exited";
            break;
        }

        if processor.event_count == 0 && last_status_time.elapsed() > Duration::from_secs(10) {
            info!("Still waiting for events... (no HTTP/2 traffic seen yet)");
            last_status_time = Instant::now();
        }

        while let Some(item) = ring_buf.next() {
            processor.process_bytes(&item);
        }

        tokio::select! {
            () = tokio::time::sleep(Duration::from_millis(100)) => {}
            _ = &mut ctrl_c => {
                break;
            }
        }
    }

    // Drain whatever arrived between the last poll and the exit condition
    while let Some(item) = ring_buf.next() {
        processor.process_bytes(&item);
    }
    processor.flush();

    if !quiet {
        display_summary(
            exit_reason,
            started.elapsed().as_secs_f64(),
            processor.event_count,
            processor.block_count,
        );
        if processor.decode_errors > 0 || processor.evicted_blocks > 0 {
            eprintln!(
                "userspace: {} malformed records, {} blocks flushed without END",
                processor.decode_errors, processor.evicted_blocks
            );
        }
    }

    print_trace_diagnostics(&bpf)?;

    Ok(())
}
