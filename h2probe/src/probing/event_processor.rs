//! # Event Processing
//!
//! Consumes header records from the eBPF ring buffer and folds them into
//! header blocks.
//!
//! Each probe hit emits zero or more field records followed by one END record
//! (`base + 2`). Records of one block share the socket identity, the stream id
//! and the base message kind, so that triple keys an open block; the END
//! record closes it and hands it to the output.
//!
//! ## Output Modes
//!
//! - **Text**: one header line plus one indented line per field
//! - **JSON**: one object per block (NDJSON)

use log::{debug, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;

use super::event_display::{write_block_json, write_block_text};
use super::event_decoder::HeaderRecord;
use crate::domain::{Direction, MessageKind, SocketId, StreamId, Transport};

/// Blocks waiting for their END record before the oldest is flushed
pub const MAX_OPEN_BLOCKS: usize = 4096;

/// How blocks are written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct BlockKey {
    socket_id: SocketId,
    stream_id: StreamId,
    kind: MessageKind,
}

/// All fields of one HEADERS frame (or one response write) on one stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeaderBlock {
    pub tgid: u32,
    pub pid: u32,
    pub comm: String,
    pub goid: u64,
    pub socket_id: SocketId,
    pub fd: u32,
    pub stream_id: StreamId,
    pub direction: Direction,
    pub kind: MessageKind,
    pub transport: Transport,
    pub local: Option<SocketAddr>,
    pub remote: Option<SocketAddr>,
    pub tcp_seq: u32,
    pub timestamp_ns: u64,
    pub headers: Vec<(String, String)>,
    /// False when flushed without an END record (eviction or shutdown)
    pub complete: bool,
}

impl HeaderBlock {
    fn open(record: &HeaderRecord) -> Self {
        Self {
            tgid: record.tgid,
            pid: record.pid,
            comm: record.comm.clone(),
            goid: record.goid,
            socket_id: record.socket_id,
            fd: record.fd,
            stream_id: record.stream_id,
            direction: record.direction,
            kind: record.kind.base(),
            transport: record.transport,
            local: record.local,
            remote: record.remote,
            tcp_seq: record.tcp_seq,
            timestamp_ns: record.timestamp_ns,
            headers: Vec::new(),
            complete: false,
        }
    }
}

/// Encapsulates event processing logic and state
pub struct EventProcessor<W: Write> {
    // Configuration
    format: OutputFormat,
    out: W,

    open: HashMap<BlockKey, HeaderBlock>,

    // Counters
    pub event_count: usize,
    pub field_count: usize,
    pub block_count: usize,
    pub decode_errors: usize,
    pub evicted_blocks: usize,
}

impl<W: Write> EventProcessor<W> {
    /// Create a new event processor writing blocks to `out`
    #[must_use]
    pub fn new(format: OutputFormat, out: W) -> Self {
        Self {
            format,
            out,
            open: HashMap::new(),
            event_count: 0,
            field_count: 0,
            block_count: 0,
            decode_errors: 0,
            evicted_blocks: 0,
        }
    }

    /// Process a single ring buffer record
    pub fn process_bytes(&mut self, bytes: &[u8]) {
        self.event_count += 1;
        match HeaderRecord::decode(bytes) {
            Ok(record) => self.process_record(record),
            Err(e) => {
                self.decode_errors += 1;
                warn!("Dropping malformed record: {e}");
            }
        }
    }

    /// Fold a decoded record into its block
    pub fn process_record(&mut self, record: HeaderRecord) {
        let key = BlockKey {
            socket_id: record.socket_id,
            stream_id: record.stream_id,
            kind: record.kind.base(),
        };

        if record.kind.is_end() {
            let mut block = self.open.remove(&key).unwrap_or_else(|| HeaderBlock::open(&record));
            block.complete = true;
            self.write_block(&block);
            return;
        }

        self.field_count += 1;
        if !self.open.contains_key(&key) && self.open.len() >= MAX_OPEN_BLOCKS {
            self.evict_oldest();
        }
        let block = self.open.entry(key).or_insert_with(|| HeaderBlock::open(&record));
        block.headers.push((record.name_lossy(), record.value_lossy()));
    }

    /// Write out every block still waiting for an END record
    pub fn flush(&mut self) {
        let mut pending: Vec<HeaderBlock> = self.open.drain().map(|(_, block)| block).collect();
        pending.sort_by_key(|block| block.timestamp_ns);
        for block in &pending {
            self.write_block(block);
        }
    }

    /// Number of blocks waiting for an END record
    #[must_use]
    pub fn open_blocks(&self) -> usize {
        self.open.len()
    }

    /// Consume the processor and return the writer
    pub fn into_inner(mut self) -> W {
        self.flush();
        self.out
    }

    fn evict_oldest(&mut self) {
        let Some(key) =
            self.open.iter().min_by_key(|(_, block)| block.timestamp_ns).map(|(key, _)| *key)
        else {
            return;
        };
        if let Some(block) = self.open.remove(&key) {
            self.evicted_blocks += 1;
            debug!("Evicting open block {} {}", block.socket_id, block.stream_id);
            self.write_block(&block);
        }
    }

    fn write_block(&mut self, block: &HeaderBlock) {
        self.block_count += 1;
        let result = match self.format {
            OutputFormat::Text => write_block_text(&mut self.out, block),
            OutputFormat::Json => write_block_json(&mut self.out, block),
        };
        if let Err(e) = result {
            warn!("Failed to write header block: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(kind: MessageKind, stream: u32, name: &str, value: &str) -> HeaderRecord {
        HeaderRecord {
            direction: Direction::Ingress,
            kind,
            transport: Transport::Plain,
            tcp_seq: 1000,
            goid: 7,
            timestamp_ns: u64::from(stream),
            comm: "server".to_string(),
            socket_id: SocketId(42),
            tgid: 100,
            pid: 101,
            local: None,
            remote: None,
            fd: 9,
            stream_id: StreamId(stream),
            name: name.as_bytes().to_vec(),
            value: value.as_bytes().to_vec(),
        }
    }

    fn blocks(out: &[u8]) -> Vec<serde_json::Value> {
        std::str::from_utf8(out)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn test_fields_grouped_until_end() {
        let mut p = EventProcessor::new(OutputFormat::Json, Vec::new());
        p.process_record(record(MessageKind::Request, 1, ":method", "GET"));
        p.process_record(record(MessageKind::Request, 1, ":path", "/"));
        assert_eq!(p.open_blocks(), 1);
        p.process_record(record(MessageKind::RequestEnd, 1, "", ""));
        assert_eq!(p.open_blocks(), 0);

        let out = blocks(&p.into_inner());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["kind"], "request");
        assert_eq!(out[0]["stream_id"], 1);
        assert_eq!(out[0]["complete"], true);
        assert_eq!(out[0]["headers"][0][0], ":method");
        assert_eq!(out[0]["headers"][1][1], "/");
    }

    #[test]
    fn test_streams_are_kept_apart() {
        let mut p = EventProcessor::new(OutputFormat::Json, Vec::new());
        p.process_record(record(MessageKind::Request, 1, ":path", "/a"));
        p.process_record(record(MessageKind::Request, 3, ":path", "/b"));
        p.process_record(record(MessageKind::Response, 1, ":status", "200"));
        p.process_record(record(MessageKind::RequestEnd, 3, "", ""));
        p.process_record(record(MessageKind::RequestEnd, 1, "", ""));

        let out = blocks(&p.into_inner());
        // Two closed request blocks, then the response flushed as incomplete
        assert_eq!(out.len(), 3);
        assert_eq!(out[0]["headers"][0][1], "/b");
        assert_eq!(out[1]["headers"][0][1], "/a");
        assert_eq!(out[2]["kind"], "response");
        assert_eq!(out[2]["complete"], false);
    }

    #[test]
    fn test_end_without_fields_is_an_empty_block() {
        let mut p = EventProcessor::new(OutputFormat::Json, Vec::new());
        p.process_record(record(MessageKind::RequestEnd, 5, "", ""));

        assert_eq!(p.field_count, 0);
        assert_eq!(p.block_count, 1);
        let out = blocks(&p.into_inner());
        assert_eq!(out[0]["headers"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn test_malformed_bytes_are_counted() {
        let mut p = EventProcessor::new(OutputFormat::Text, Vec::new());
        p.process_bytes(&[0u8; 12]);
        assert_eq!(p.event_count, 1);
        assert_eq!(p.decode_errors, 1);
        assert!(p.into_inner().is_empty());
    }

    #[test]
    fn test_open_blocks_are_bounded() {
        let mut p = EventProcessor::new(OutputFormat::Json, Vec::new());
        for stream in 0..=MAX_OPEN_BLOCKS as u32 {
            p.process_record(record(MessageKind::Request, stream, "k", "v"));
        }
        assert_eq!(p.open_blocks(), MAX_OPEN_BLOCKS);
        assert_eq!(p.evicted_blocks, 1);

        let out = blocks(&p.into_inner());
        // Oldest (stream 0) went out first
        assert_eq!(out[0]["stream_id"], 0);
        assert_eq!(out[0]["complete"], false);
    }
}
