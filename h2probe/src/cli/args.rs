//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "h2probe",
    about = "Capture HTTP/2 and gRPC headers from running Go programs",
    after_help = "\
EXAMPLES:
    sudo h2probe my-service --layout layout.json                Auto-detect PID and binary
    sudo h2probe --pid 1234 --layout layout.json                Explicit PID, auto-detect binary
    sudo h2probe --pid 1234 --target ./svc --layout layout.json Explicit PID and binary
    sudo h2probe my-service --layout layout.json --json         NDJSON header blocks on stdout"
)]
pub struct Args {
    /// Process name to trace (auto-detects PID and binary)
    #[arg(value_name = "PROCESS")]
    pub process: Option<String>,

    /// Process ID to trace (binary path auto-detected from /proc)
    #[arg(short, long)]
    pub pid: Option<i32>,

    /// Path to the Go binary the probes attach to (auto-detected if omitted)
    #[arg(short, long)]
    pub target: Option<String>,

    /// Struct offsets and itab addresses of the target binary (JSON)
    #[arg(short, long, value_name = "FILE")]
    pub layout: PathBuf,

    /// Stop after N seconds (0 = unlimited)
    #[arg(long, default_value = "0")]
    pub duration: u64,

    /// Print one JSON object per header block instead of text
    #[arg(long)]
    pub json: bool,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}
