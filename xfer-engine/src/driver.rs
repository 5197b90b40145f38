//! The GPU driver binding is an external collaborator: this module only
//! declares the surface the engine consumes from it, as a trait, so the
//! engine stays agnostic of any concrete CUDA/HIP-style backend behind
//! one API. `sim` below is a minimal in-memory implementation used by
//! the unit and integration tests; it is not part of the engine's public
//! contract.

use std::fmt;

/// Direction the driver should lower an async memcpy to, mirroring the
/// kinds a real CUDA/HIP-style driver distinguishes for performance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopyKind {
    DeviceToDevice,
    DeviceToHost,
    HostToDevice,
    /// Cross-device peer copy; let the driver infer directionality.
    Default,
}

/// Opaque driver-side stream identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamId(pub u64);

/// Opaque driver-side fence identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FenceId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemsetWidth {
    W8,
    W16,
    W32,
}

/// A pitched 3D copy extent, as `cudaMemcpy3D`/`hipMemcpy3D` would take a
/// pitched pointer plus extent rather than three separate strides.
#[derive(Clone, Copy, Debug)]
pub struct Extent3D {
    pub width_bytes: u64,
    pub height_lines: u64,
    pub depth_planes: u64,
}

/// The driver calls consumed by the engine (§6). A real binding wraps a
/// CUDA/HIP-style API; any non-success return is fatal and is reported
/// as `Err(Error::Driver(..))` — the engine never retries.
pub trait Driver: Send + Sync {
    /// Push this GPU's context as current on the calling thread.
    fn push_context(&self, device: u32);
    /// Pop the previously pushed context.
    fn pop_context(&self, device: u32);

    fn create_stream(&self, device: u32) -> StreamId;

    fn memcpy_1d(
        &self,
        stream: StreamId,
        kind: CopyKind,
        src_offset: u64,
        dst_offset: u64,
        bytes: u64,
    ) -> crate::Result<()>;

    fn memcpy_2d(
        &self,
        stream: StreamId,
        kind: CopyKind,
        src_offset: u64,
        src_pitch: u64,
        dst_offset: u64,
        dst_pitch: u64,
        width_bytes: u64,
        height_lines: u64,
    ) -> crate::Result<()>;

    fn memcpy_3d(
        &self,
        stream: StreamId,
        kind: CopyKind,
        src_offset: u64,
        src_pitch: u64,
        src_plane_pitch: u64,
        dst_offset: u64,
        dst_pitch: u64,
        dst_plane_pitch: u64,
        extent: Extent3D,
    ) -> crate::Result<()>;

    fn memset_1d(
        &self,
        stream: StreamId,
        width: MemsetWidth,
        dst_offset: u64,
        pattern: u32,
        elems: u64,
    ) -> crate::Result<()>;

    fn memset_2d(
        &self,
        stream: StreamId,
        width: MemsetWidth,
        dst_offset: u64,
        dst_pitch: u64,
        pattern: u32,
        elems_per_line: u64,
        lines: u64,
    ) -> crate::Result<()>;

    /// Enqueue a fence on `stream` that fires after every command
    /// submitted on it so far has retired. The driver is responsible for
    /// eventually invoking `on_retire` from its polling thread.
    fn enqueue_fence(&self, stream: StreamId, on_retire: Box<dyn FnOnce() + Send>) -> FenceId;
}

impl fmt::Debug for dyn Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn Driver")
    }
}

/// A minimal, synchronous `Driver` used by tests. Every "async" op
/// resolves immediately and fences fire as soon as they are enqueued,
/// which is enough to exercise the engine's decomposition and
/// bookkeeping without a real GPU.
#[cfg(any(test, feature = "sim"))]
pub mod sim {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RecordedCopy {
        pub kind: CopyKind,
        pub bytes_per_call: u64,
        pub calls: u64,
    }

    #[derive(Default)]
    pub struct SimDriver {
        next_stream: AtomicU64,
        next_fence: AtomicU64,
        pub copies: Mutex<Vec<RecordedCopy>>,
        pub memsets: Mutex<Vec<(MemsetWidth, u64)>>,
        pub context_depth: Mutex<std::collections::HashMap<u32, u32>>,
    }

    impl SimDriver {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl Driver for SimDriver {
        fn push_context(&self, device: u32) {
            *self.context_depth.lock().unwrap().entry(device).or_insert(0) += 1;
        }

        fn pop_context(&self, device: u32) {
            let mut map = self.context_depth.lock().unwrap();
            let depth = map.entry(device).or_insert(0);
            assert!(*depth > 0, "context scope popped without a matching push");
            *depth -= 1;
        }

        fn create_stream(&self, _device: u32) -> StreamId {
            StreamId(self.next_stream.fetch_add(1, Ordering::Relaxed))
        }

        fn memcpy_1d(
            &self,
            _stream: StreamId,
            kind: CopyKind,
            _src_offset: u64,
            _dst_offset: u64,
            bytes: u64,
        ) -> crate::Result<()> {
            self.copies.lock().unwrap().push(RecordedCopy { kind, bytes_per_call: bytes, calls: 1 });
            Ok(())
        }

        fn memcpy_2d(
            &self,
            _stream: StreamId,
            kind: CopyKind,
            _src_offset: u64,
            _src_pitch: u64,
            _dst_offset: u64,
            _dst_pitch: u64,
            width_bytes: u64,
            height_lines: u64,
        ) -> crate::Result<()> {
            self.copies.lock().unwrap().push(RecordedCopy {
                kind,
                bytes_per_call: width_bytes,
                calls: height_lines,
            });
            Ok(())
        }

        fn memcpy_3d(
            &self,
            _stream: StreamId,
            kind: CopyKind,
            _src_offset: u64,
            _src_pitch: u64,
            _src_plane_pitch: u64,
            _dst_offset: u64,
            _dst_pitch: u64,
            _dst_plane_pitch: u64,
            extent: Extent3D,
        ) -> crate::Result<()> {
            self.copies.lock().unwrap().push(RecordedCopy {
                kind,
                bytes_per_call: extent.width_bytes,
                calls: extent.height_lines * extent.depth_planes,
            });
            Ok(())
        }

        fn memset_1d(
            &self,
            _stream: StreamId,
            width: MemsetWidth,
            _dst_offset: u64,
            _pattern: u32,
            elems: u64,
        ) -> crate::Result<()> {
            self.memsets.lock().unwrap().push((width, elems));
            Ok(())
        }

        fn memset_2d(
            &self,
            _stream: StreamId,
            width: MemsetWidth,
            _dst_offset: u64,
            _dst_pitch: u64,
            _pattern: u32,
            elems_per_line: u64,
            lines: u64,
        ) -> crate::Result<()> {
            self.memsets.lock().unwrap().push((width, elems_per_line * lines));
            Ok(())
        }

        fn enqueue_fence(&self, _stream: StreamId, on_retire: Box<dyn FnOnce() + Send>) -> FenceId {
            on_retire();
            FenceId(self.next_fence.fetch_add(1, Ordering::Relaxed))
        }
    }
}
