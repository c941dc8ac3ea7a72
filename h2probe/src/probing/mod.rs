//! Probe lifecycle and record consumption
//!
//! - eBPF program loading, layout publication and attachment
//! - Ring buffer record decoding
//! - Header block grouping and output
//! - Kernel-side counters

pub mod diagnostics;
pub mod ebpf_setup;
pub mod event_decoder;
pub mod event_display;
pub mod event_processor;

// Re-export common types
pub use diagnostics::{print_trace_diagnostics, read_trace_stats};
pub use ebpf_setup::{
    attach_header_uprobes, attach_read_tracepoints, init_ebpf_logger, load_ebpf_program,
    publish_layout,
};
pub use event_decoder::HeaderRecord;
pub use event_display::display_summary;
pub use event_processor::{EventProcessor, HeaderBlock, OutputFormat};
