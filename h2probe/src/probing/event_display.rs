use std::io::{self, Write};

use super::event_processor::HeaderBlock;
use crate::domain::{Direction, Transport};

/// Write a block as a header line followed by one indented line per field
///
/// ```text
/// [request ingress tls] pid=101 goid=7 socket:42 stream:1 fd=9 10.0.0.1:8443 <- 10.0.0.2:54321
///   :method: GET
/// ```
pub fn write_block_text<W: Write>(out: &mut W, block: &HeaderBlock) -> io::Result<()> {
    let tls = match block.transport {
        Transport::Tls => " tls",
        Transport::Plain => "",
    };
    write!(
        out,
        "[{} {}{tls}] pid={} goid={} {} {} fd={}",
        block.kind, block.direction, block.pid, block.goid, block.socket_id, block.stream_id, block.fd
    )?;
    if let (Some(local), Some(remote)) = (block.local, block.remote) {
        let arrow = match block.direction {
            Direction::Egress => "->",
            Direction::Ingress => "<-",
        };
        write!(out, " {local} {arrow} {remote}")?;
    }
    if !block.complete {
        write!(out, " (incomplete)")?;
    }
    writeln!(out)?;

    for (name, value) in &block.headers {
        writeln!(out, "  {name}: {value}")?;
    }
    Ok(())
}

/// Write a block as one line of JSON
pub fn write_block_json<W: Write>(out: &mut W, block: &HeaderBlock) -> io::Result<()> {
    serde_json::to_writer(&mut *out, block)?;
    writeln!(out)
}

/// Print the end-of-run summary line
pub fn display_summary(exit_reason: &str, elapsed_secs: f64, events: usize, blocks: usize) {
    eprintln!("\n{exit_reason}: {elapsed_secs:.1}s, {events} records, {blocks} header blocks");
}
