//! Fill Engine (§4.5): GPU-side memset. `ReducedFill` is computed once,
//! at descriptor construction, by finding the smallest power-of-two
//! period R ∈ {1, 2, 4} whose repetition reproduces the whole pattern.
//! R ∈ {1, 2, 4} takes the native W8/W16/W32 memset fast path; any other
//! pattern falls back to seeding one raw copy of the pattern and
//! replicating it across the line, then the lines, then the planes, by
//! doubling the filled prefix each round.

use std::sync::Arc;

use crate::address::AddressListCursor;
use crate::completion::TransferCompletion;
use crate::descriptor::{PortControl, XferDes, XferKind};
use crate::driver::{CopyKind, Extent3D, MemsetWidth};
use crate::sequence::SequenceCache;
use crate::stream::StreamHandle;
use crate::Deadline;

/// The fill pattern reduced to its shortest tiling period.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReducedFill {
    size: usize,
    word: u32,
}

impl ReducedFill {
    pub fn compute(pattern: &[u8]) -> Self {
        for r in [1usize, 2, 4] {
            if r <= pattern.len() && pattern.len() % r == 0 && tiles(pattern, r) {
                let mut word = 0u32;
                for (i, &b) in pattern[..r].iter().enumerate() {
                    word |= (b as u32) << (8 * i);
                }
                return ReducedFill { size: r, word };
            }
        }
        ReducedFill { size: pattern.len().max(1), word: 0 }
    }

    fn native_width(&self) -> Option<MemsetWidth> {
        match self.size {
            1 => Some(MemsetWidth::W8),
            2 => Some(MemsetWidth::W16),
            4 => Some(MemsetWidth::W32),
            _ => None,
        }
    }
}

fn tiles(pattern: &[u8], r: usize) -> bool {
    pattern.chunks(r).all(|chunk| chunk == &pattern[..r])
}

pub(crate) fn progress(descriptor: &XferDes, work_until: Deadline) -> bool {
    let config = descriptor.config();

    let (write_port_idx, write_offset) = {
        let guard = descriptor.lock();
        let idx = guard.output_ctrl.current_index.map(|i| i as i32).unwrap_or(-1);
        let offset = guard.current_output().map(|p| p.cursor.offset()).unwrap_or(0);
        (idx, offset)
    };

    let mut write_cache = SequenceCache::new();
    let mut last_stream: Option<Arc<StreamHandle>> = None;
    let mut total = 0u64;
    let mut progressed = false;
    let mut completed = false;

    loop {
        let max_bytes = descriptor.pull_batch(config.batch_min_bytes);
        if max_bytes == 0 {
            break;
        }

        let has_out = descriptor.lock().output_ctrl.current_index.is_some();
        let round_bytes = if has_out {
            fill_round(descriptor, &mut write_cache, &mut last_stream, &mut total, max_bytes, config.min_xfer_size, work_until)
        } else {
            0
        };

        if round_bytes > 0 {
            progressed = true;
        }

        completed = descriptor.consumed(0, write_cache.pending());
        if completed || work_until.expired() || round_bytes == 0 {
            break;
        }
    }

    descriptor.set_iteration_completed(completed);

    if progressed {
        let write_size = write_cache.flush();
        let completion =
            TransferCompletion::new(descriptor.add_reference(), -1, 0, 0, write_port_idx, write_offset, write_size);
        match last_stream {
            Some(stream) => {
                stream.add_notification(write_size, move || completion.complete());
            }
            None => completion.complete(),
        }
    }

    progressed
}

fn advance_ctrl_if_done(ctrl: &mut PortControl, done: bool, len: usize) {
    if !done {
        return;
    }
    if let Some(i) = ctrl.current_index {
        if i + 1 < len {
            ctrl.current_index = Some(i + 1);
        } else {
            ctrl.current_index = None;
            ctrl.eos = true;
        }
    }
}

/// Runs `fill_step` repeatedly until this round's `max_bytes` budget is
/// spent, the output cursor drains, a stream refuses admission, or the
/// deadline expires with at least `min_xfer_size` bytes already filled.
#[allow(clippy::too_many_arguments)]
fn fill_round(
    descriptor: &XferDes,
    write_cache: &mut SequenceCache,
    last_stream: &mut Option<Arc<StreamHandle>>,
    total: &mut u64,
    max_bytes: u64,
    min_xfer_size: u64,
    work_until: Deadline,
) -> u64 {
    let mut round_total = 0u64;

    while round_total < max_bytes {
        let has_out = descriptor.lock().output_ctrl.current_index.is_some();
        if !has_out {
            break;
        }

        let budget = max_bytes - round_total;
        let step = fill_step(descriptor, write_cache, budget);
        let (bytes, stream) = match step {
            Some(s) => s,
            None => break,
        };
        if bytes == 0 {
            break;
        }
        *last_stream = Some(stream);
        round_total += bytes;
        *total += bytes;

        if *total >= min_xfer_size && work_until.expired() {
            break;
        }
    }

    round_total
}

/// One sub-fill: picks the native fast path or the doubling fallback,
/// submits it on one of the destination GPU's own streams (a fill never
/// crosses a device boundary), and advances the output cursor. `budget`
/// caps how much of the output's current extent is covered this step,
/// leaving the rest for a subsequent round against a fresh batch.
fn fill_step(descriptor: &XferDes, write_cache: &mut SequenceCache, budget: u64) -> Option<(u64, Arc<StreamHandle>)> {
    let mut guard = descriptor.lock();
    let idx = guard.output_ctrl.current_index?;
    let gpu = guard.outputs[idx].gpu.clone()?;
    let stream = gpu.next_d2d_stream();

    let (pattern, reduced) = match &guard.kind {
        XferKind::Fill { pattern, reduced } => (pattern.clone(), *reduced),
        XferKind::Copy => unreachable!("fill engine invoked on a copy descriptor"),
    };

    let out_base = guard.outputs[idx].base_ptr?;
    let dim = guard.outputs[idx].cursor.dim();
    let id = descriptor.id();

    let bytes = if let Some(width) = reduced.native_width() {
        native_fill(&stream, &mut guard.outputs[idx].cursor, out_base, dim, width, reduced, id, budget)?
    } else {
        doubling_fill(&stream, &mut guard.outputs[idx].cursor, out_base, dim, &pattern, id, budget)?
    };

    write_cache.record(bytes);
    let len = guard.outputs.len();
    let done = guard.outputs[idx].cursor.is_done();
    advance_ctrl_if_done(&mut guard.output_ctrl, done, len);

    Some((bytes, stream))
}

#[allow(clippy::too_many_arguments)]
fn native_fill(
    stream: &Arc<StreamHandle>,
    cursor: &mut AddressListCursor,
    base: u64,
    dim: usize,
    width: MemsetWidth,
    reduced: ReducedFill,
    id: u64,
    budget: u64,
) -> Option<u64> {
    let r = reduced.size as u64;
    Some(match dim {
        1 => {
            let bytes = cursor.remaining(0).min(budget);
            if bytes == 0 {
                return None;
            }
            if !stream.admit(bytes, id) {
                return None;
            }
            let dst = base + cursor.offset();
            submit_memset(stream, width, dst, reduced.word, bytes / r);
            cursor.advance(0, bytes);
            bytes
        }
        2 => {
            let line_bytes = cursor.stride(0);
            let lines = cursor.remaining(1).min((budget / line_bytes.max(1)).max(1));
            if !stream.admit(line_bytes * lines, id) {
                return None;
            }
            let dst = base + cursor.offset();
            let dst_pitch = cursor.stride(1);
            submit_memset_2d(stream, width, dst, dst_pitch, reduced.word, line_bytes / r, lines);
            cursor.advance(1, lines);
            line_bytes * lines
        }
        _ => {
            let line_bytes = cursor.stride(0);
            let lines = cursor.remaining(1);
            let plane_bytes = line_bytes * lines;
            let planes = cursor.remaining(2).min((budget / plane_bytes.max(1)).max(1));
            if !stream.admit(plane_bytes * planes, id) {
                return None;
            }
            let dst_pitch = cursor.stride(1);
            let plane_stride = cursor.stride(2);
            let base_dst = base + cursor.offset();
            for p in 0..planes {
                submit_memset_2d(stream, width, base_dst + p * plane_stride, dst_pitch, reduced.word, line_bytes / r, lines);
            }
            cursor.advance(2, planes);
            plane_bytes * planes
        }
    })
}

fn submit_memset(stream: &Arc<StreamHandle>, width: MemsetWidth, dst: u64, word: u32, elems: u64) {
    let result = match width {
        MemsetWidth::W8 => stream.submit_memset_8(dst, word as u8, elems),
        MemsetWidth::W16 => stream.submit_memset_16(dst, word as u16, elems),
        MemsetWidth::W32 => stream.submit_memset_32(dst, word, elems),
    };
    result.unwrap_or_else(|e| panic!("fill engine: {e}"));
}

fn submit_memset_2d(
    stream: &Arc<StreamHandle>,
    width: MemsetWidth,
    dst: u64,
    dst_pitch: u64,
    word: u32,
    elems_per_line: u64,
    lines: u64,
) {
    stream
        .submit_memset_2d(width, dst, dst_pitch, word, elems_per_line, lines)
        .unwrap_or_else(|e| panic!("fill engine: {e}"));
}

#[allow(clippy::too_many_arguments)]
fn doubling_fill(
    stream: &Arc<StreamHandle>,
    cursor: &mut AddressListCursor,
    base: u64,
    dim: usize,
    pattern: &[u8],
    id: u64,
    budget: u64,
) -> Option<u64> {
    let period = pattern.len() as u64;
    Some(match dim {
        1 => {
            let bytes = cursor.remaining(0).min(budget);
            if bytes == 0 {
                return None;
            }
            if !stream.admit(bytes, id) {
                return None;
            }
            let dst = base + cursor.offset();
            seed(stream, dst, pattern);
            double_span(stream, dst, period.min(bytes), bytes);
            cursor.advance(0, bytes);
            bytes
        }
        2 => {
            let line_bytes = cursor.stride(0);
            let lines = cursor.remaining(1).min((budget / line_bytes.max(1)).max(1));
            if !stream.admit(line_bytes * lines, id) {
                return None;
            }
            let dst_pitch = cursor.stride(1);
            let dst = base + cursor.offset();
            seed(stream, dst, pattern);
            double_span(stream, dst, period.min(line_bytes), line_bytes);
            double_lines(stream, dst, dst_pitch, line_bytes, lines);
            cursor.advance(1, lines);
            line_bytes * lines
        }
        _ => {
            let line_bytes = cursor.stride(0);
            let lines = cursor.remaining(1);
            let plane_bytes = line_bytes * lines;
            let planes = cursor.remaining(2).min((budget / plane_bytes.max(1)).max(1));
            if !stream.admit(plane_bytes * planes, id) {
                return None;
            }
            let dst_pitch = cursor.stride(1);
            let plane_stride = cursor.stride(2);
            let dst = base + cursor.offset();
            seed(stream, dst, pattern);
            double_span(stream, dst, period.min(line_bytes), line_bytes);
            double_lines(stream, dst, dst_pitch, line_bytes, lines);
            double_planes(stream, dst, dst_pitch, plane_stride, line_bytes, lines, planes);
            cursor.advance(2, planes);
            plane_bytes * planes
        }
    })
}

/// Writes the raw pattern one byte at a time — the only point in the
/// fill engine that ever touches individual pattern bytes instead of a
/// reduced word or an existing filled span.
fn seed(stream: &Arc<StreamHandle>, dst: u64, pattern: &[u8]) {
    for (i, &byte) in pattern.iter().enumerate() {
        stream.submit_memset_8(dst + i as u64, byte, 1).unwrap_or_else(|e| panic!("fill engine: {e}"));
    }
}

/// Doubles the filled prefix of one line by copying it onto itself until
/// the whole line is covered.
fn double_span(stream: &Arc<StreamHandle>, base: u64, seeded: u64, target: u64) {
    let mut filled = seeded.max(1).min(target.max(1));
    while filled < target {
        let chunk = filled.min(target - filled);
        stream
            .submit_copy_1d(CopyKind::DeviceToDevice, base, base + filled, chunk)
            .unwrap_or_else(|e| panic!("fill engine: {e}"));
        filled += chunk;
    }
}

/// Doubles line count once the first line is fully seeded.
fn double_lines(stream: &Arc<StreamHandle>, base: u64, pitch: u64, line_bytes: u64, target_lines: u64) {
    let mut filled = 1u64.min(target_lines);
    while filled < target_lines {
        let chunk = filled.min(target_lines - filled);
        stream
            .submit_copy_2d(CopyKind::DeviceToDevice, base, pitch, base + filled * pitch, pitch, line_bytes, chunk)
            .unwrap_or_else(|e| panic!("fill engine: {e}"));
        filled += chunk;
    }
}

/// Doubles plane count once the first plane is fully filled.
#[allow(clippy::too_many_arguments)]
fn double_planes(
    stream: &Arc<StreamHandle>,
    base: u64,
    pitch: u64,
    plane_stride: u64,
    line_bytes: u64,
    lines: u64,
    target_planes: u64,
) {
    let mut filled = 1u64.min(target_planes);
    while filled < target_planes {
        let chunk = filled.min(target_planes - filled);
        let extent = Extent3D { width_bytes: line_bytes, height_lines: lines, depth_planes: chunk };
        stream
            .submit_copy_3d(
                CopyKind::DeviceToDevice,
                base,
                pitch,
                plane_stride,
                base + filled * plane_stride,
                pitch,
                plane_stride,
                extent,
            )
            .unwrap_or_else(|e| panic!("fill engine: {e}"));
        filled += chunk;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reduces_repeated_byte_to_width_one() {
        let r = ReducedFill::compute(&[0xAA, 0xAA, 0xAA, 0xAA]);
        assert_eq!(r.native_width(), Some(MemsetWidth::W8));
    }

    #[test]
    fn reduces_two_byte_period() {
        let r = ReducedFill::compute(&[0x01, 0x02, 0x01, 0x02]);
        assert_eq!(r.native_width(), Some(MemsetWidth::W16));
        assert_eq!(r.word & 0xFFFF, 0x0201);
    }

    #[test]
    fn non_periodic_pattern_has_no_native_width() {
        let pattern: Vec<u8> = (0..16).collect();
        let r = ReducedFill::compute(&pattern);
        assert_eq!(r.native_width(), None);
        assert_eq!(r.size, 16);
    }
}
