//! Typed transfer endpoints (§3 `XferPort`) and the two external
//! collaborator traits consumed through them (§6): the memory-type
//! registry and the dataflow runtime's address-batch source. Both are
//! out of scope to implement for real — this module only states the
//! surface the engine needs from them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::address::AddressListCursor;
use crate::gpu::Gpu;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryKind {
    Framebuffer { device: u32 },
    PinnedHost,
}

/// The memory-type registry (out of scope to implement): identifies
/// which memory instance lives on which GPU and hands back a flat
/// pointer for a byte range.
pub trait MemoryCapability: Send + Sync {
    fn get_direct_ptr(&self, offset: u64, size: u64) -> Option<u64>;
    fn kind(&self) -> MemoryKind;
}

/// The dataflow runtime's batch sizing and byte-progress reporting
/// surface (§6). `port` of `-1` means "no update for that side", used by
/// fill descriptors which have no read side.
pub trait AddressBatchSource: Send + Sync {
    fn get_addresses(&mut self, min_xfer_size: u64) -> u64;
    fn record_address_consumption(&mut self, in_bytes: u64, out_bytes: u64) -> bool;
    fn update_bytes_read(&mut self, port: i32, offset: u64, size: u64);
    fn update_bytes_write(&mut self, port: i32, offset: u64, size: u64);
}

/// A typed transfer endpoint: a flat base pointer (absent for ports with
/// no live addresses), an address-list cursor walking the range this
/// port must cover, a running byte total, and optionally a GPU identity
/// (present iff the backing memory is device-resident).
pub struct XferPort {
    pub base_ptr: Option<u64>,
    pub memory: Arc<dyn MemoryCapability>,
    pub gpu: Option<Arc<Gpu>>,
    pub cursor: AddressListCursor,
    local_bytes_total: AtomicU64,
}

impl XferPort {
    pub fn new(base_ptr: Option<u64>, memory: Arc<dyn MemoryCapability>, gpu: Option<Arc<Gpu>>, cursor: AddressListCursor) -> Self {
        XferPort { base_ptr, memory, gpu, cursor, local_bytes_total: AtomicU64::new(0) }
    }

    pub fn local_bytes_total(&self) -> u64 {
        self.local_bytes_total.load(Ordering::Relaxed)
    }

    /// Monotonically non-decreasing per the data model's invariant —
    /// this is the only way the counter is ever mutated.
    pub fn add_bytes(&self, n: u64) {
        self.local_bytes_total.fetch_add(n, Ordering::Relaxed);
    }
}
