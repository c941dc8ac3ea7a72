//! In-memory host for exercising the probe pipeline off-kernel

#![allow(unsafe_code, clippy::cast_possible_truncation)]

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::mem::size_of;
use std::vec::Vec;

use crate::host::{
    CallContext, EventSink, KernelAccess, Register, TaskInfo, TraceTables, UserMemory,
};
use crate::proc_info::GoProcInfo;
use crate::record::{
    Http2EventHeader, AF_INET, EVENT_HEADER_SIZE, HTTP2_PAYLOAD_PREFIX_LEN, TASK_COMM_LEN,
};
use crate::tables::{
    KernelOffsets, PendingRead, SocketInfo, StatId, TcpSeqKey, TraceStats, TraceUid,
};

/// Sparse byte-addressed memory with all-or-nothing reads
#[derive(Default)]
pub struct MockMemory {
    bytes: BTreeMap<u64, u8>,
}

impl MockMemory {
    pub fn write_bytes(&mut self, addr: u64, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            self.bytes.insert(addr + i as u64, *b);
        }
    }

    pub fn write<T: Copy>(&mut self, addr: u64, value: &T) {
        let raw = unsafe {
            std::slice::from_raw_parts(std::ptr::from_ref(value).cast::<u8>(), size_of::<T>())
        };
        self.write_bytes(addr, raw);
    }

    pub fn write_u64(&mut self, addr: u64, value: u64) {
        self.write_bytes(addr, &value.to_le_bytes());
    }

    pub fn write_u32(&mut self, addr: u64, value: u32) {
        self.write_bytes(addr, &value.to_le_bytes());
    }

    fn copy_out(&self, addr: u64, dst: &mut [u8]) -> bool {
        let mut staged = vec![0u8; dst.len()];
        for (i, slot) in staged.iter_mut().enumerate() {
            match self.bytes.get(&(addr + i as u64)) {
                Some(b) => *slot = *b,
                None => return false,
            }
        }
        dst.copy_from_slice(&staged);
        true
    }

    fn read<T: Copy>(&self, addr: u64) -> Option<T> {
        let mut buf = vec![0u8; size_of::<T>()];
        if !self.copy_out(addr, &mut buf) {
            return None;
        }
        Some(unsafe { std::ptr::read_unaligned(buf.as_ptr().cast::<T>()) })
    }
}

/// Register snapshot of a uprobe hit
pub struct MockCall {
    sp: u64,
    regs: Vec<(Register, u64)>,
}

impl MockCall {
    pub fn new(sp: u64) -> Self {
        Self { sp, regs: Vec::new() }
    }

    pub fn with_register(mut self, reg: Register, value: u64) -> Self {
        self.regs.push((reg, value));
        self
    }
}

impl CallContext for MockCall {
    fn register(&self, reg: Register) -> u64 {
        self.regs.iter().rev().find(|(r, _)| *r == reg).map_or(0, |(_, v)| *v)
    }

    fn stack_pointer(&self) -> u64 {
        self.sp
    }
}

/// One record taken back out of [`MockHost::emitted`]
#[derive(Debug, Clone)]
pub struct EmittedRecord {
    pub header: Http2EventHeader,
    pub size: usize,
    pub fd: u32,
    pub stream_id: u32,
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

pub struct MockHost {
    pub memory: MockMemory,
    pub kernel: MockMemory,
    pub pid_tgid: u64,
    pub ktime: u64,
    pub comm: [u8; TASK_COMM_LEN],
    pub proc_infos: HashMap<u32, GoProcInfo>,
    pub kernel_offsets: Option<KernelOffsets>,
    /// fd -> `struct sock` address in [`MockHost::kernel`]
    pub sockets: HashMap<i32, u64>,
    pub tcp_seq: RefCell<HashMap<TcpSeqKey, u32>>,
    pub socket_infos: RefCell<HashMap<u64, SocketInfo>>,
    pub trace_uid: RefCell<Option<TraceUid>>,
    pub stats: RefCell<TraceStats>,
    pub pending_reads: RefCell<HashMap<u64, PendingRead>>,
    pub emitted: RefCell<Vec<Vec<u8>>>,
    /// Records accepted before the channel reports full
    pub channel_capacity: Option<usize>,
}

impl MockHost {
    pub fn new() -> Self {
        let mut comm = [0u8; TASK_COMM_LEN];
        comm[..6].copy_from_slice(b"server");
        Self {
            memory: MockMemory::default(),
            kernel: MockMemory::default(),
            pid_tgid: (100u64 << 32) | 101,
            ktime: 1_000_000,
            comm,
            proc_infos: HashMap::new(),
            kernel_offsets: None,
            sockets: HashMap::new(),
            tcp_seq: RefCell::new(HashMap::new()),
            socket_infos: RefCell::new(HashMap::new()),
            trace_uid: RefCell::new(Some(TraceUid::default())),
            stats: RefCell::new(TraceStats::default()),
            pending_reads: RefCell::new(HashMap::new()),
            emitted: RefCell::new(Vec::new()),
            channel_capacity: None,
        }
    }

    pub fn records(&self) -> Vec<EmittedRecord> {
        self.emitted.borrow().iter().map(|raw| decode(raw)).collect()
    }

    /// Install an IPv4 TCP socket for `fd` with the given sequence cursors
    pub fn install_socket(&mut self, fd: i32, sk: u64, write_seq: u32, copied_seq: u32) {
        let offsets = self.kernel_offsets.unwrap_or_else(ready_kernel_offsets);
        self.sockets.insert(fd, sk);
        self.kernel.write_u32(sk + u64::from(offsets.skc_daddr), u32::from_le_bytes([10, 0, 0, 2]));
        self.kernel
            .write_u32(sk + u64::from(offsets.skc_rcv_saddr), u32::from_le_bytes([10, 0, 0, 1]));
        self.kernel.write_bytes(sk + u64::from(offsets.skc_dport), &54321u16.to_be_bytes());
        self.kernel.write_bytes(sk + u64::from(offsets.skc_num), &8443u16.to_le_bytes());
        self.kernel.write_bytes(sk + u64::from(offsets.skc_family), &AF_INET.to_le_bytes());
        self.kernel.write_u32(sk + u64::from(offsets.tcp_write_seq), write_seq);
        self.kernel.write_u32(sk + u64::from(offsets.tcp_copied_seq), copied_seq);
    }
}

/// x86_64 offsets with `ready` set
pub fn ready_kernel_offsets() -> KernelOffsets {
    KernelOffsets {
        ready: 1,
        task_files: 0xb48,
        files_fdt: 0x20,
        fdtable_fd: 0x8,
        file_private_data: 0xc8,
        socket_sk: 0x18,
        tcp_write_seq: 0x6a8,
        tcp_copied_seq: 0x5c0,
        skc_daddr: 0,
        skc_rcv_saddr: 4,
        skc_dport: 12,
        skc_num: 14,
        skc_family: 16,
        skc_v6_daddr: 56,
        skc_v6_rcv_saddr: 72,
        _padding: 0,
    }
}

fn decode(raw: &[u8]) -> EmittedRecord {
    let header: Http2EventHeader =
        unsafe { std::ptr::read_unaligned(raw.as_ptr().cast::<Http2EventHeader>()) };
    let word = |i: usize| {
        let at = EVENT_HEADER_SIZE + i * 4;
        u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]])
    };
    let (fd, stream_id, header_len, value_len) = (word(0), word(1), word(2), word(3));
    let info = EVENT_HEADER_SIZE + HTTP2_PAYLOAD_PREFIX_LEN as usize;
    let name = raw[info..info + header_len as usize].to_vec();
    let value_at = info + header_len as usize;
    let value = raw[value_at..value_at + value_len as usize].to_vec();
    EmittedRecord { header, size: raw.len(), fd, stream_id, name, value }
}

impl UserMemory for MockHost {
    fn read_user<T: Copy>(&self, addr: u64) -> Option<T> {
        self.memory.read(addr)
    }

    fn read_user_bytes(&self, addr: u64, dst: &mut [u8]) -> bool {
        self.memory.copy_out(addr, dst)
    }
}

impl KernelAccess for MockHost {
    fn read_kernel<T: Copy>(&self, addr: u64) -> Option<T> {
        self.kernel.read(addr)
    }

    fn socket_from_fd(&self, fd: i32, _offsets: &KernelOffsets) -> u64 {
        self.sockets.get(&fd).copied().unwrap_or(0)
    }
}

impl TaskInfo for MockHost {
    fn pid_tgid(&self) -> u64 {
        self.pid_tgid
    }

    fn ktime_ns(&self) -> u64 {
        self.ktime
    }

    fn comm(&self) -> [u8; TASK_COMM_LEN] {
        self.comm
    }
}

impl TraceTables for MockHost {
    fn proc_info(&self, tgid: u32) -> Option<&GoProcInfo> {
        self.proc_infos.get(&tgid)
    }

    fn kernel_offsets(&self) -> Option<&KernelOffsets> {
        self.kernel_offsets.as_ref()
    }

    fn read_seq_begin(&self, key: &TcpSeqKey) -> Option<u32> {
        self.tcp_seq.borrow().get(key).copied()
    }

    fn record_read_seq(&self, key: &TcpSeqKey, seq_begin: u32) {
        self.tcp_seq.borrow_mut().insert(*key, seq_begin);
    }

    fn socket_info(&self, conn_key: u64) -> Option<SocketInfo> {
        self.socket_infos.borrow().get(&conn_key).copied()
    }

    fn store_socket_info(&self, conn_key: u64, info: &SocketInfo) {
        self.socket_infos.borrow_mut().insert(conn_key, *info);
    }

    fn next_socket_uid(&self) -> Option<u64> {
        let mut uid = self.trace_uid.borrow_mut();
        let uid = uid.as_mut()?;
        uid.socket_id += 1;
        Some(uid.socket_id)
    }

    fn bump_stat(&self, stat: StatId) {
        let mut stats = self.stats.borrow_mut();
        match stat {
            StatId::SocketMapCount => stats.socket_map_count += 1,
            StatId::EmittedEvents => stats.emitted_events += 1,
            StatId::DroppedEvents => stats.dropped_events += 1,
            StatId::AbandonedEvents => stats.abandoned_events += 1,
        }
    }

    fn pending_read(&self, pid_tgid: u64) -> Option<PendingRead> {
        self.pending_reads.borrow().get(&pid_tgid).copied()
    }

    fn store_pending_read(&self, pid_tgid: u64, pending: &PendingRead) {
        self.pending_reads.borrow_mut().insert(pid_tgid, *pending);
    }

    fn clear_pending_read(&self, pid_tgid: u64) {
        self.pending_reads.borrow_mut().remove(&pid_tgid);
    }
}

impl EventSink for MockHost {
    fn emit(&self, record: &[u8]) -> bool {
        let mut emitted = self.emitted.borrow_mut();
        if self.channel_capacity.is_some_and(|cap| emitted.len() >= cap) {
            return false;
        }
        emitted.push(record.to_vec());
        true
    }
}
