//! XferDes — the transfer descriptor (§3, §9 "tagged-variant
//! descriptor"). One struct wraps an enum over the two kinds the
//! channel can construct; both share ports, priority, reference
//! counting and the `progress` entry point.

use std::sync::{Arc, Mutex};

use crate::fill::ReducedFill;
use crate::port::{AddressBatchSource, XferPort};
use crate::{Deadline, EngineConfig};

/// Per-direction bookkeeping: which port is currently active, how many
/// elements remain on it, and whether the upstream producer has
/// signalled end-of-stream.
#[derive(Default)]
pub struct PortControl {
    pub current_index: Option<usize>,
    pub remaining: u64,
    pub eos: bool,
}

pub enum XferKind {
    Copy,
    Fill { pattern: Vec<u8>, reduced: ReducedFill },
}

pub struct XferDesInner {
    pub kind: XferKind,
    pub inputs: Vec<XferPort>,
    pub outputs: Vec<XferPort>,
    pub priority: i32,
    pub input_ctrl: PortControl,
    pub output_ctrl: PortControl,
    pub iteration_completed: bool,
    pub config: EngineConfig,
    batches: Arc<Mutex<dyn AddressBatchSource>>,
}

impl XferDesInner {
    pub fn current_input(&self) -> Option<&XferPort> {
        self.input_ctrl.current_index.and_then(|i| self.inputs.get(i))
    }

    pub fn current_output(&self) -> Option<&XferPort> {
        self.output_ctrl.current_index.and_then(|i| self.outputs.get(i))
    }
}

/// Reference-counted handle to a descriptor. Cloning is the "extra
/// reference per outstanding completion fence" from the data model's
/// invariant; `Arc`'s strong count already enforces "destroyed only when
/// the count reaches zero", so `add_reference`/`remove_reference` are
/// thin wrappers over clone/drop rather than a hand-rolled counter.
#[derive(Clone)]
pub struct XferDes(pub(crate) Arc<Mutex<XferDesInner>>);

impl XferDes {
    pub fn new(
        kind: XferKind,
        inputs: Vec<XferPort>,
        outputs: Vec<XferPort>,
        priority: i32,
        config: EngineConfig,
        batches: Arc<Mutex<dyn AddressBatchSource>>,
    ) -> Self {
        let input_ctrl = PortControl { current_index: if inputs.is_empty() { None } else { Some(0) }, remaining: u64::MAX, eos: false };
        let output_ctrl = PortControl { current_index: if outputs.is_empty() { None } else { Some(0) }, remaining: u64::MAX, eos: false };
        XferDes(Arc::new(Mutex::new(XferDesInner {
            kind,
            inputs,
            outputs,
            priority,
            input_ctrl,
            output_ctrl,
            iteration_completed: false,
            config,
            batches,
        })))
    }

    pub fn add_reference(&self) -> XferDes {
        self.clone()
    }

    pub fn remove_reference(self) {
        drop(self)
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// A cheap, stable identifier for admission-control bookkeeping —
    /// the descriptor has no separate guid of its own, so its backing
    /// allocation's address stands in for one.
    pub(crate) fn id(&self) -> u64 {
        Arc::as_ptr(&self.0) as usize as u64
    }

    pub fn priority(&self) -> i32 {
        self.0.lock().unwrap().priority
    }

    pub fn is_iteration_completed(&self) -> bool {
        self.0.lock().unwrap().iteration_completed
    }

    pub(crate) fn set_iteration_completed(&self, completed: bool) {
        self.0.lock().unwrap().iteration_completed = completed;
    }

    pub(crate) fn config(&self) -> EngineConfig {
        self.0.lock().unwrap().config
    }

    pub fn lock(&self) -> std::sync::MutexGuard<'_, XferDesInner> {
        self.0.lock().unwrap()
    }

    /// Forwards to the address-batch source (§6). `port` of `-1` is a
    /// no-op, used by fill descriptors which have no read side.
    pub fn update_bytes_read(&self, port: i32, offset: u64, size: u64) {
        if port < 0 {
            return;
        }
        let guard = self.lock();
        if let Some(p) = guard.inputs.get(port as usize) {
            p.add_bytes(size);
        }
        guard.batches.lock().unwrap().update_bytes_read(port, offset, size);
    }

    pub fn update_bytes_write(&self, port: i32, offset: u64, size: u64) {
        if port < 0 {
            return;
        }
        let guard = self.lock();
        if let Some(p) = guard.outputs.get(port as usize) {
            p.add_bytes(size);
        }
        guard.batches.lock().unwrap().update_bytes_write(port, offset, size);
    }

    pub(crate) fn pull_batch(&self, min_xfer_size: u64) -> u64 {
        let batches = self.lock().batches.clone();
        let mut batches = batches.lock().unwrap();
        batches.get_addresses(min_xfer_size)
    }

    pub(crate) fn consumed(&self, in_bytes: u64, out_bytes: u64) -> bool {
        let batches = self.lock().batches.clone();
        let mut batches = batches.lock().unwrap();
        batches.record_address_consumption(in_bytes, out_bytes)
    }

    /// Dispatches to the copy or fill engine per the variant chosen at
    /// construction (§9: the channel decides the variant, every variant
    /// exposes the same `progress` contract).
    pub fn progress(&self, work_until: Deadline) -> bool {
        let is_fill = matches!(self.lock().kind, XferKind::Fill { .. });
        if is_fill {
            crate::fill::progress(self, work_until)
        } else {
            crate::copy::progress(self, work_until)
        }
    }
}

