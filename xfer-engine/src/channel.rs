//! Channel (§4.6): a capability-matrix entry (what memory kinds it moves
//! bytes between, its advertised bandwidth/latency/per-copy overhead,
//! and the widest dimensionality it can decompose a range into) plus the
//! single-queue dispatcher that owns the `XferDes`es it creates.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::descriptor::{XferDes, XferKind};
use crate::fill::ReducedFill;
use crate::port::{AddressBatchSource, XferPort};
use crate::{Deadline, EngineConfig};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelKind {
    ToFb,
    FromFb,
    InFb,
    PeerFb,
    Fill,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointKind {
    Framebuffer,
    PinnedHost,
}

/// Reduction-operator selector on a transfer. Only the identity
/// reduction (`id == 0`, "no reduction") is supported; anything else is
/// a programming error the channel refuses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct RedopInfo {
    pub id: u32,
}

pub struct Channel {
    pub kind: ChannelKind,
    pub src_set: Vec<EndpointKind>,
    pub dst_set: Vec<EndpointKind>,
    pub bandwidth_bytes_per_sec: u64,
    pub latency_ns: u64,
    pub frag_overhead_ns: u64,
    /// Widest dimensionality this channel's backing copy calls support:
    /// 2 for engines with no native 3D memcpy, 3 otherwise.
    pub max_dim: usize,
    config: EngineConfig,
    queue: Mutex<VecDeque<XferDes>>,
    ordered: AtomicBool,
}

pub struct ChannelBuilder {
    kind: ChannelKind,
    src_set: Vec<EndpointKind>,
    dst_set: Vec<EndpointKind>,
    bandwidth_bytes_per_sec: u64,
    latency_ns: u64,
    frag_overhead_ns: u64,
    max_dim: usize,
    config: EngineConfig,
}

impl ChannelBuilder {
    pub fn new(kind: ChannelKind) -> Self {
        ChannelBuilder {
            kind,
            src_set: Vec::new(),
            dst_set: Vec::new(),
            bandwidth_bytes_per_sec: 0,
            latency_ns: 0,
            frag_overhead_ns: 0,
            max_dim: 3,
            config: EngineConfig::default(),
        }
    }

    pub fn src(mut self, kind: EndpointKind) -> Self {
        self.src_set.push(kind);
        self
    }

    pub fn dst(mut self, kind: EndpointKind) -> Self {
        self.dst_set.push(kind);
        self
    }

    pub fn bandwidth_bytes_per_sec(mut self, bw: u64) -> Self {
        self.bandwidth_bytes_per_sec = bw;
        self
    }

    pub fn latency_ns(mut self, ns: u64) -> Self {
        self.latency_ns = ns;
        self
    }

    pub fn frag_overhead_ns(mut self, ns: u64) -> Self {
        self.frag_overhead_ns = ns;
        self
    }

    pub fn max_dim(mut self, dim: usize) -> Self {
        self.max_dim = dim.clamp(1, 3);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Channel {
        Channel {
            kind: self.kind,
            src_set: self.src_set,
            dst_set: self.dst_set,
            bandwidth_bytes_per_sec: self.bandwidth_bytes_per_sec,
            latency_ns: self.latency_ns,
            frag_overhead_ns: self.frag_overhead_ns,
            max_dim: self.max_dim,
            config: self.config,
            queue: Mutex::new(VecDeque::new()),
            ordered: AtomicBool::new(true),
        }
    }
}

impl Channel {
    /// Whether descriptors popped off this channel's queue must complete
    /// strictly in submission order, or may interleave by priority.
    pub fn set_ordered(&self, ordered: bool) {
        self.ordered.store(ordered, Ordering::Relaxed);
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Builds and enqueues a transfer descriptor for this channel.
    ///
    /// Fatal (panics) if `redop_info` names anything but the identity
    /// reduction, or if `fill_size` disagrees with whether this is a
    /// fill channel — both are programming errors in the caller, not
    /// data-dependent failures the engine can recover from.
    #[allow(clippy::too_many_arguments)]
    pub fn create_xfer_des(
        &self,
        dma_op: u32,
        launch_node: u32,
        guid: u64,
        inputs: Vec<XferPort>,
        outputs: Vec<XferPort>,
        priority: i32,
        redop_info: RedopInfo,
        fill_data: &[u8],
        fill_size: u64,
        batches: Arc<Mutex<dyn AddressBatchSource>>,
    ) -> XferDes {
        assert_eq!(redop_info.id, 0, "channel {:?} guid {guid}: reduction ops are not supported", self.kind);
        log::trace!("channel {:?}: xfer des guid={guid} dma_op={dma_op} launch_node={launch_node}", self.kind);

        let kind = if self.kind == ChannelKind::Fill {
            assert!(fill_size > 0, "fill channel guid {guid}: fill_size must be non-zero");
            let pattern = fill_data[..fill_size as usize].to_vec();
            let reduced = ReducedFill::compute(&pattern);
            XferKind::Fill { pattern, reduced }
        } else {
            assert_eq!(fill_size, 0, "copy channel guid {guid}: fill_size must be zero");
            XferKind::Copy
        };

        let xd = XferDes::new(kind, inputs, outputs, priority, self.config, batches);
        self.queue.lock().unwrap().push_back(xd.clone());
        xd
    }

    /// Advances one round of work on this channel's queue. In ordered
    /// mode only the head descriptor progresses, and is popped once its
    /// iteration completes; in unordered mode every pending descriptor
    /// gets a `progress` call this round, highest priority first, and
    /// completed ones are swept out afterward.
    pub fn pump(&self, work_until: Deadline) {
        if self.ordered.load(Ordering::Relaxed) {
            let front = self.queue.lock().unwrap().front().cloned();
            if let Some(xd) = front {
                xd.progress(work_until);
                if xd.is_iteration_completed() {
                    self.queue.lock().unwrap().pop_front();
                }
            }
        } else {
            let mut pending: Vec<XferDes> = self.queue.lock().unwrap().iter().cloned().collect();
            pending.sort_by_key(|xd| std::cmp::Reverse(xd.priority()));
            for xd in &pending {
                xd.progress(work_until);
            }
            self.queue.lock().unwrap().retain(|xd| !xd.is_iteration_completed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::sim::SimDriver;
    use crate::gpu::GpuBuilder;
    use crate::port::{MemoryCapability, MemoryKind};
    use crate::address::{AddressListCursor, Shape};
    use std::sync::Arc;

    struct DummyMemory(MemoryKind);
    impl MemoryCapability for DummyMemory {
        fn get_direct_ptr(&self, _offset: u64, _size: u64) -> Option<u64> {
            Some(0)
        }
        fn kind(&self) -> MemoryKind {
            self.0
        }
    }

    struct DummyBatches;
    impl AddressBatchSource for DummyBatches {
        fn get_addresses(&mut self, min_xfer_size: u64) -> u64 {
            min_xfer_size
        }
        fn record_address_consumption(&mut self, _in_bytes: u64, _out_bytes: u64) -> bool {
            true
        }
        fn update_bytes_read(&mut self, _port: i32, _offset: u64, _size: u64) {}
        fn update_bytes_write(&mut self, _port: i32, _offset: u64, _size: u64) {}
    }

    #[test]
    #[should_panic(expected = "reduction ops are not supported")]
    fn reduction_ops_are_fatal() {
        let driver: Arc<dyn crate::driver::Driver> = Arc::new(SimDriver::new());
        let gpu = Arc::new(GpuBuilder::new(0, driver).d2d_streams(1).build());
        let channel = ChannelBuilder::new(ChannelKind::Fill).build();
        let mem = Arc::new(DummyMemory(MemoryKind::Framebuffer { device: 0 }));
        let port = XferPort::new(Some(0), mem, Some(gpu), AddressListCursor::new(0, Shape::line(64)));
        channel.create_xfer_des(
            0,
            0,
            1,
            vec![],
            vec![port],
            0,
            RedopInfo { id: 7 },
            &[0xAA],
            1,
            Arc::new(Mutex::new(DummyBatches)),
        );
    }

    #[test]
    #[should_panic(expected = "fill_size must be zero")]
    fn copy_channel_rejects_fill_size() {
        let driver: Arc<dyn crate::driver::Driver> = Arc::new(SimDriver::new());
        let gpu = Arc::new(GpuBuilder::new(0, driver).d2d_streams(1).build());
        let channel = ChannelBuilder::new(ChannelKind::ToFb).build();
        let mem = Arc::new(DummyMemory(MemoryKind::Framebuffer { device: 0 }));
        let port = XferPort::new(Some(0), mem, Some(gpu), AddressListCursor::new(0, Shape::line(64)));
        channel.create_xfer_des(
            0,
            0,
            2,
            vec![],
            vec![port],
            0,
            RedopInfo::default(),
            &[0xAA],
            1,
            Arc::new(Mutex::new(DummyBatches)),
        );
    }
}
