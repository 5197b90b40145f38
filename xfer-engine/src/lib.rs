//! Asynchronous GPU DMA transfer engine.
//!
//! A channel owns a queue of transfer descriptors (`XferDes`); an
//! external scheduler repeatedly calls a descriptor's `progress` with a
//! deadline, and the descriptor pulls address ranges from its input and
//! output cursors, decomposes them into 1D/2D/3D GPU copies (or a fill
//! pattern) on an appropriate stream, and arranges completion
//! notifications that update byte-progress counters.
//!
//! The surrounding dataflow runtime, the memory-type registry, and the
//! GPU driver binding are all external collaborators (see [`driver`] and
//! [`port`] for the traits this crate consumes from them) — this crate
//! implements only the transfer engine itself.

pub mod address;
pub mod channel;
pub mod completion;
pub mod context;
pub mod copy;
pub mod descriptor;
pub mod driver;
pub mod error;
pub mod fill;
pub mod gpu;
pub mod port;
pub mod sequence;
pub mod stream;

pub use error::{Error, Result};

use std::time::{Duration, Instant};

/// An advisory deadline for cooperative scheduling. `progress` breaks
/// out of its submission loop once the deadline has passed, even with
/// work remaining; nothing submitted before that point is cancelled.
#[derive(Clone, Copy, Debug)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// A deadline that has already passed — `progress` does at most one
    /// unit of work before returning.
    pub fn immediate() -> Self {
        Deadline(Some(Instant::now()))
    }

    pub fn after(duration: Duration) -> Self {
        Deadline(Some(Instant::now() + duration))
    }

    /// No deadline: `progress` runs until it exhausts its batch.
    pub fn unbounded() -> Self {
        Deadline(None)
    }

    pub fn expired(&self) -> bool {
        match self.0 {
            Some(t) => Instant::now() >= t,
            None => false,
        }
    }
}

/// Tunables for the copy and fill engines (§4.4, §4.5). Threaded through
/// from channel construction to every descriptor it creates — a plain
/// struct handed to construction rather than parsed from a config file,
/// since there is no persisted configuration in this crate.
#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    /// Minimum batch size requested from the address-batch source per
    /// `progress` iteration.
    pub batch_min_bytes: u64,
    /// Per-sub-copy cap applied to host↔device transfers.
    pub host_device_cap_bytes: u64,
    /// Threshold above which a `progress` call is allowed to break out
    /// early once its deadline has expired.
    pub min_xfer_size: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            batch_min_bytes: 4 << 20,
            host_device_cap_bytes: 4 << 20,
            min_xfer_size: 4096,
        }
    }
}
