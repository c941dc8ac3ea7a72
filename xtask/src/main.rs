use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::Command;

const EBPF_PACKAGE: &str = "h2probe-ebpf";
const EBPF_BIN: &str = "h2probe";

#[derive(Parser)]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Parser)]
enum Cmd {
    /// Build the uprobe/tracepoint object embedded by the agent
    BuildEbpf {
        #[arg(long, default_value = "bpfel-unknown-none")]
        target: String,
        #[arg(long)]
        release: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Cmd::BuildEbpf { target, release } => build_ebpf(&target, release)?,
    }

    Ok(())
}

fn build_ebpf(target: &str, _release: bool) -> Result<()> {
    // Debug builds pull in formatting code the BPF linker rejects; release
    // with LTO strips it.
    let mut cmd = Command::new("cargo");
    cmd.arg("+nightly")
        .arg("build")
        .arg("--package")
        .arg(EBPF_PACKAGE)
        .arg("--bin")
        .arg(EBPF_BIN)
        .arg("--target")
        .arg(target)
        .arg("-Z")
        .arg("build-std=core")
        .arg("--release");

    let status = cmd.status().context("Failed to build eBPF program")?;

    if !status.success() {
        anyhow::bail!("Failed to build eBPF program");
    }

    let object = object_path(target);
    let size = std::fs::metadata(&object)
        .with_context(|| format!("eBPF object missing at {}", object.display()))?
        .len();

    println!("✓ eBPF program built successfully");
    println!("  Target: {target}");
    println!("  Object: {} ({size} bytes)", object.display());
    println!("  Profile: release (always)");

    Ok(())
}

/// Location `h2probe` embeds the object from
fn object_path(target: &str) -> PathBuf {
    PathBuf::from("target").join(target).join("release").join(EBPF_BIN)
}
