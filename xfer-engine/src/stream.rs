//! Stream Handle — an async GPU command queue with admission control and
//! FIFO completion fences (§4.3).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::driver::{CopyKind, Driver, Extent3D, FenceId, MemsetWidth, StreamId};
use crate::gpu::Gpu;
use crate::Error;

/// Default ceiling on bytes in flight per stream before `admit` starts
/// refusing new work. Chosen generously; real tuning happens per
/// deployment via `EngineConfig`, but a bound must exist or `admit`
/// could never meaningfully refuse anything.
pub const DEFAULT_MAX_IN_FLIGHT_BYTES: u64 = 256 << 20;

#[derive(Debug)]
pub struct StreamHandle {
    id: StreamId,
    device: u32,
    driver: Arc<dyn Driver>,
    in_flight_bytes: AtomicU64,
    max_in_flight_bytes: u64,
}

impl StreamHandle {
    pub fn new(driver: Arc<dyn Driver>, device: u32, max_in_flight_bytes: u64) -> Self {
        let id = driver.create_stream(device);
        StreamHandle { id, device, driver, in_flight_bytes: AtomicU64::new(0), max_in_flight_bytes }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn device(&self) -> u32 {
        self.device
    }

    /// Admit `bytes` of new work for descriptor `xd`. Returns `false`
    /// (refused) if the stream is saturated; the caller must break out
    /// of its submission loop and try again on a later `progress` call.
    pub fn admit(&self, bytes: u64, xd: u64) -> bool {
        let mut current = self.in_flight_bytes.load(Ordering::Relaxed);
        loop {
            if current.saturating_add(bytes) > self.max_in_flight_bytes {
                log::debug!(
                    "stream {:?} on device {} refuses admit of {bytes} bytes for xd {xd} (in flight {current})",
                    self.id, self.device
                );
                return false;
            }
            match self.in_flight_bytes.compare_exchange_weak(
                current,
                current + bytes,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    fn retire(&self, bytes: u64) {
        self.in_flight_bytes.fetch_sub(bytes, Ordering::Relaxed);
    }

    pub fn submit_copy_1d(&self, kind: CopyKind, src: u64, dst: u64, bytes: u64) -> crate::Result<()> {
        self.driver
            .memcpy_1d(self.id, kind, src, dst, bytes)
            .map_err(|e| Error::Driver(format!("memcpy_1d: {e}")))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn submit_copy_2d(
        &self,
        kind: CopyKind,
        src: u64,
        src_pitch: u64,
        dst: u64,
        dst_pitch: u64,
        width_bytes: u64,
        height_lines: u64,
    ) -> crate::Result<()> {
        self.driver
            .memcpy_2d(self.id, kind, src, src_pitch, dst, dst_pitch, width_bytes, height_lines)
            .map_err(|e| Error::Driver(format!("memcpy_2d: {e}")))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn submit_copy_3d(
        &self,
        kind: CopyKind,
        src: u64,
        src_pitch: u64,
        src_plane_pitch: u64,
        dst: u64,
        dst_pitch: u64,
        dst_plane_pitch: u64,
        extent: Extent3D,
    ) -> crate::Result<()> {
        self.driver
            .memcpy_3d(self.id, kind, src, src_pitch, src_plane_pitch, dst, dst_pitch, dst_plane_pitch, extent)
            .map_err(|e| Error::Driver(format!("memcpy_3d: {e}")))
    }

    pub fn submit_memset_8(&self, dst: u64, pattern: u8, elems: u64) -> crate::Result<()> {
        self.driver
            .memset_1d(self.id, MemsetWidth::W8, dst, pattern as u32, elems)
            .map_err(|e| Error::Driver(format!("memset_8: {e}")))
    }

    pub fn submit_memset_16(&self, dst: u64, pattern: u16, elems: u64) -> crate::Result<()> {
        self.driver
            .memset_1d(self.id, MemsetWidth::W16, dst, pattern as u32, elems)
            .map_err(|e| Error::Driver(format!("memset_16: {e}")))
    }

    pub fn submit_memset_32(&self, dst: u64, pattern: u32, elems: u64) -> crate::Result<()> {
        self.driver
            .memset_1d(self.id, MemsetWidth::W32, dst, pattern, elems)
            .map_err(|e| Error::Driver(format!("memset_32: {e}")))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn submit_memset_2d(
        &self,
        width: MemsetWidth,
        dst: u64,
        dst_pitch: u64,
        pattern: u32,
        elems_per_line: u64,
        lines: u64,
    ) -> crate::Result<()> {
        self.driver
            .memset_2d(self.id, width, dst, dst_pitch, pattern, elems_per_line, lines)
            .map_err(|e| Error::Driver(format!("memset_2d: {e}")))
    }

    /// Enqueue a fence; `bytes` is the aggregate span this fence covers,
    /// used only to release the matching admission budget on retirement.
    pub fn add_notification(self: &Arc<Self>, bytes: u64, on_retire: impl FnOnce() + Send + 'static) -> FenceId {
        let this = self.clone();
        self.driver.enqueue_fence(
            self.id,
            Box::new(move || {
                this.retire(bytes);
                on_retire();
            }),
        )
    }
}

/// Stream selection rules (§4.3). `in_gpu`/`out_gpu` are `None` for the
/// host-pinned side of a transfer.
pub fn select_stream(in_gpu: Option<&Gpu>, out_gpu: Option<&Gpu>) -> crate::Result<(Arc<StreamHandle>, CopyKind)> {
    match (in_gpu, out_gpu) {
        (Some(g), Some(h)) if g.index == h.index => Ok((g.next_d2d_stream(), CopyKind::DeviceToDevice)),
        (Some(g), None) => Ok((g.device_to_host_stream.clone(), CopyKind::DeviceToHost)),
        (None, Some(h)) => Ok((h.host_to_device_stream.clone(), CopyKind::HostToDevice)),
        (Some(g), Some(h)) => match g.peer_stream(h.index) {
            Some(stream) => Ok((stream, CopyKind::Default)),
            None => Err(Error::MissingStream { from: g.index, to: h.index }),
        },
        (None, None) => panic!("select_stream called with neither side on a GPU"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::sim::SimDriver;
    use crate::gpu::GpuBuilder;

    fn driver() -> Arc<dyn Driver> {
        Arc::new(SimDriver::new())
    }

    #[test]
    fn admit_refuses_past_the_limit() {
        let d = driver();
        let s = StreamHandle::new(d, 0, 100);
        assert!(s.admit(60, 1));
        assert!(!s.admit(60, 1));
        assert!(s.admit(40, 1));
    }

    #[test]
    fn selects_d2d_for_same_gpu() {
        let d = driver();
        let g = GpuBuilder::new(0, d).d2d_streams(2).build();
        let (stream, kind) = select_stream(Some(&g), Some(&g)).unwrap();
        assert_eq!(kind, CopyKind::DeviceToDevice);
        assert_eq!(stream.device(), 0);
    }

    #[test]
    fn missing_peer_link_is_fatal() {
        let d = driver();
        let a = GpuBuilder::new(0, d.clone()).d2d_streams(1).build();
        let c = GpuBuilder::new(2, d).d2d_streams(1).build();
        let err = select_stream(Some(&a), Some(&c)).unwrap_err();
        assert!(matches!(err, Error::MissingStream { from: 0, to: 2 }));
    }
}
