//! Copy Engine (§4.4). On every `progress` call: pull a batch from the
//! address-batch source, then repeatedly decompose whatever is left of
//! the current input/output ranges into the widest 1D/2D/3D copy both
//! cursors currently expose, submit it on the selected stream, and
//! advance. Once a batch is exhausted without the deadline expiring or
//! the address-batch source reporting completion, a fresh batch is
//! pulled and the process continues within the same `progress` call.
//! Exactly one aggregate completion fence is posted per `progress` call,
//! covering every sub-copy submitted during it.

use std::sync::Arc;

use crate::completion::TransferCompletion;
use crate::descriptor::{PortControl, XferDes};
use crate::driver::CopyKind;
use crate::sequence::SequenceCache;
use crate::stream::{select_stream, StreamHandle};
use crate::Deadline;

pub(crate) fn progress(descriptor: &XferDes, work_until: Deadline) -> bool {
    let config = descriptor.config();

    let (read_port_idx, read_offset, write_port_idx, write_offset) = {
        let guard = descriptor.lock();
        let read_port_idx = guard.input_ctrl.current_index.map(|i| i as i32).unwrap_or(-1);
        let read_offset = guard.current_input().map(|p| p.cursor.offset()).unwrap_or(0);
        let write_port_idx = guard.output_ctrl.current_index.map(|i| i as i32).unwrap_or(-1);
        let write_offset = guard.current_output().map(|p| p.cursor.offset()).unwrap_or(0);
        (read_port_idx, read_offset, write_port_idx, write_offset)
    };

    let mut read_cache = SequenceCache::new();
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

        let (has_in, has_out) = {
            let guard = descriptor.lock();
            (guard.input_ctrl.current_index.is_some(), guard.output_ctrl.current_index.is_some())
        };

        let round_bytes = match (has_in, has_out) {
            (true, true) => copy_both(
                descriptor,
                &mut read_cache,
                &mut write_cache,
                &mut last_stream,
                &mut total,
                config.host_device_cap_bytes,
                max_bytes,
                config.min_xfer_size,
                work_until,
            ),
            (true, false) => {
                let bytes = skip_input_only(descriptor, &mut read_cache, max_bytes);
                total += bytes;
                bytes
            }
            (false, true) => {
                let bytes = skip_output_only(descriptor, &mut write_cache, max_bytes);
                total += bytes;
                bytes
            }
            (false, false) => {
                // A gather/scatter hole with neither port live still has a
                // known size: the batch itself. Nothing is read or
                // written, but the write-sequence cache still advances so
                // downstream consumers see the hole accounted for.
                write_cache.record(max_bytes);
                total += max_bytes;
                max_bytes
            }
        };

        if round_bytes > 0 {
            progressed = true;
        }

        completed = descriptor.consumed(read_cache.pending(), write_cache.pending());
        if completed || work_until.expired() || round_bytes == 0 {
            break;
        }
    }

    descriptor.set_iteration_completed(completed);

    if progressed {
        let read_size = read_cache.flush();
        let write_size = write_cache.flush();
        let completion = TransferCompletion::new(
            descriptor.add_reference(),
            read_port_idx,
            read_offset,
            read_size,
            write_port_idx,
            write_offset,
            write_size,
        );
        match last_stream {
            Some(stream) => {
                stream.add_notification(read_size.max(write_size), move || completion.complete());
            }
            // Pure skip/hole work never touched a device stream; nothing
            // to fence on, so the byte-progress update happens inline.
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

/// The view one side of a copy presents at a given decomposition level.
struct LevelView {
    outer_count: u64,
    pitch: u64,
    advance_dim: usize,
    scale: u64,
    is_last: bool,
}

/// One step of the split/promote rule (§4.4, §9): if `unit` doesn't cover
/// the side's whole `count` at this level, split it into `count / unit`
/// pieces of `unit` each when that divides evenly, else the side is
/// exhausted after a single piece and has nothing further to promote.
/// Otherwise `unit` already covers the side's whole count, so promote to
/// `promote_dim`; `is_last` then reflects whether there is any further
/// structure beyond that dim worth extending into.
fn level_view(
    count: u64,
    unit: u64,
    unit_stride: u64,
    promote_dim: usize,
    next_remaining: u64,
    next_stride: u64,
    beyond_remaining: u64,
) -> LevelView {
    if unit < count {
        let outer_count = if count % unit == 0 { count / unit } else { 1 };
        LevelView { outer_count, pitch: unit * unit_stride, advance_dim: promote_dim - 1, scale: unit, is_last: true }
    } else {
        LevelView {
            outer_count: next_remaining,
            pitch: next_stride,
            advance_dim: promote_dim,
            scale: 1,
            is_last: beyond_remaining <= 1,
        }
    }
}

/// Both an input and an output range remain: the common case. Runs until
/// this round's `max_bytes` budget is spent, a stream refuses admission,
/// both cursors exhaust, or the deadline expires with at least
/// `min_xfer_size` bytes already moved. Dimensionality is chosen
/// independently per side by the split/promote rule, with the input side
/// evaluated first on a tie, so a flat input can still be promoted to
/// match a multi-line output (or vice versa) instead of collapsing the
/// whole transfer to 1D.
#[allow(clippy::too_many_arguments)]
fn copy_both(
    descriptor: &XferDes,
    read_cache: &mut SequenceCache,
    write_cache: &mut SequenceCache,
    last_stream: &mut Option<Arc<StreamHandle>>,
    total: &mut u64,
    host_device_cap: u64,
    max_bytes: u64,
    min_xfer_size: u64,
    work_until: Deadline,
) -> u64 {
    let (stream, kind, is_host_device) = {
        let guard = descriptor.lock();
        let in_idx = match guard.input_ctrl.current_index {
            Some(i) => i,
            None => return 0,
        };
        let out_idx = match guard.output_ctrl.current_index {
            Some(i) => i,
            None => return 0,
        };
        let in_gpu = guard.inputs[in_idx].gpu.clone();
        let out_gpu = guard.outputs[out_idx].gpu.clone();
        let (stream, kind) =
            select_stream(in_gpu.as_deref(), out_gpu.as_deref()).unwrap_or_else(|e| panic!("copy engine: {e}"));
        let is_host_device = matches!(kind, CopyKind::HostToDevice | CopyKind::DeviceToHost);
        (stream, kind, is_host_device)
    };

    let mut round_total = 0u64;

    while round_total < max_bytes {
        let mut guard = descriptor.lock();
        let in_idx = match guard.input_ctrl.current_index {
            Some(i) => i,
            None => break,
        };
        let out_idx = match guard.output_ctrl.current_index {
            Some(i) => i,
            None => break,
        };
        let in_base = match guard.inputs[in_idx].base_ptr {
            Some(b) => b,
            None => break,
        };
        let out_base = match guard.outputs[out_idx].base_ptr {
            Some(b) => b,
            None => break,
        };

        let mut bytes_left = max_bytes - round_total;
        if is_host_device {
            bytes_left = bytes_left.min(host_device_cap);
        }

        let icount = guard.inputs[in_idx].cursor.remaining(0);
        let ocount = guard.outputs[out_idx].cursor.remaining(0);
        let in_dim = guard.inputs[in_idx].cursor.dim();
        let out_dim = guard.outputs[out_idx].cursor.dim();
        let contig = icount.min(ocount).min(bytes_left);
        if contig == 0 {
            break;
        }

        let one_d = contig == bytes_left || (contig == icount && in_dim == 1) || (contig == ocount && out_dim == 1);

        let bytes = if one_d {
            if !stream.admit(contig, descriptor.id()) {
                break;
            }
            let src = in_base + guard.inputs[in_idx].cursor.offset();
            let dst = out_base + guard.outputs[out_idx].cursor.offset();
            stream.submit_copy_1d(kind, src, dst, contig).unwrap_or_else(|e| panic!("copy engine: {e}"));
            guard.inputs[in_idx].cursor.advance(0, contig);
            guard.outputs[out_idx].cursor.advance(0, contig);
            contig
        } else {
            let in_view = level_view(
                icount,
                contig,
                1,
                1,
                guard.inputs[in_idx].cursor.remaining(1),
                guard.inputs[in_idx].cursor.stride(1),
                guard.inputs[in_idx].cursor.remaining(2),
            );
            let out_view = level_view(
                ocount,
                contig,
                1,
                1,
                guard.outputs[out_idx].cursor.remaining(1),
                guard.outputs[out_idx].cursor.stride(1),
                guard.outputs[out_idx].cursor.remaining(2),
            );

            let lines = in_view.outer_count.min(out_view.outer_count).min(bytes_left / contig);
            if lines == 0 {
                break;
            }

            let terminate_at_2d = contig * lines == bytes_left || in_view.is_last || out_view.is_last;

            if terminate_at_2d {
                if !stream.admit(contig * lines, descriptor.id()) {
                    break;
                }
                let src = in_base + guard.inputs[in_idx].cursor.offset();
                let dst = out_base + guard.outputs[out_idx].cursor.offset();
                stream
                    .submit_copy_2d(kind, src, in_view.pitch, dst, out_view.pitch, contig, lines)
                    .unwrap_or_else(|e| panic!("copy engine: {e}"));
                guard.inputs[in_idx].cursor.advance(in_view.advance_dim, lines * in_view.scale);
                guard.outputs[out_idx].cursor.advance(out_view.advance_dim, lines * out_view.scale);
                contig * lines
            } else {
                // Neither side is exhausted by this 2D block: extend into
                // planes by repeating the split/promote rule one level up.
                // The 3D case is unrolled into a loop of 2D submissions
                // rather than one native 3D driver call, so admission
                // refusal or deadline expiry can interrupt it between
                // planes instead of only at whole-descriptor granularity.
                let in_plane = level_view(
                    in_view.outer_count,
                    lines,
                    guard.inputs[in_idx].cursor.stride(1),
                    2,
                    guard.inputs[in_idx].cursor.remaining(2),
                    guard.inputs[in_idx].cursor.stride(2),
                    1,
                );
                let out_plane = level_view(
                    out_view.outer_count,
                    lines,
                    guard.outputs[out_idx].cursor.stride(1),
                    2,
                    guard.outputs[out_idx].cursor.remaining(2),
                    guard.outputs[out_idx].cursor.stride(2),
                    1,
                );
                let planes = in_plane.outer_count.min(out_plane.outer_count).min(bytes_left / (contig * lines));

                let src_base = in_base + guard.inputs[in_idx].cursor.offset();
                let dst_base = out_base + guard.outputs[out_idx].cursor.offset();
                let mut act_planes = 0u64;
                while act_planes < planes {
                    if !stream.admit(contig * lines, descriptor.id()) {
                        break;
                    }
                    let src = src_base + act_planes * in_plane.pitch;
                    let dst = dst_base + act_planes * out_plane.pitch;
                    stream
                        .submit_copy_2d(kind, src, in_view.pitch, dst, out_view.pitch, contig, lines)
                        .unwrap_or_else(|e| panic!("copy engine: {e}"));
                    act_planes += 1;
                    if work_until.expired() {
                        break;
                    }
                }
                if act_planes == 0 {
                    break;
                }
                guard.inputs[in_idx].cursor.advance(in_plane.advance_dim, act_planes * in_plane.scale);
                guard.outputs[out_idx].cursor.advance(out_plane.advance_dim, act_planes * out_plane.scale);
                act_planes * contig * lines
            }
        };

        read_cache.record(bytes);
        write_cache.record(bytes);

        let in_len = guard.inputs.len();
        let in_done = guard.inputs[in_idx].cursor.is_done();
        advance_ctrl_if_done(&mut guard.input_ctrl, in_done, in_len);
        let out_len = guard.outputs.len();
        let out_done = guard.outputs[out_idx].cursor.is_done();
        advance_ctrl_if_done(&mut guard.output_ctrl, out_done, out_len);

        round_total += bytes;
        *total += bytes;
        *last_stream = Some(stream.clone());

        if *total >= min_xfer_size && work_until.expired() {
            break;
        }
    }

    round_total
}

/// Only an input range remains (e.g. a reduction's trailing input once
/// the output side has already hit end-of-stream): drain up to this
/// round's batch size without touching memory, but still record the span
/// as bytes read.
fn skip_input_only(descriptor: &XferDes, read_cache: &mut SequenceCache, max_bytes: u64) -> u64 {
    let mut guard = descriptor.lock();
    let idx = match guard.input_ctrl.current_index {
        Some(i) => i,
        None => return 0,
    };
    let before = guard.inputs[idx].cursor.consumed();
    guard.inputs[idx].cursor.skip_bytes(max_bytes);
    let bytes = guard.inputs[idx].cursor.consumed() - before;
    read_cache.record(bytes);
    let len = guard.inputs.len();
    let done = guard.inputs[idx].cursor.is_done();
    advance_ctrl_if_done(&mut guard.input_ctrl, done, len);
    bytes
}

/// Only an output range remains: drain up to this round's batch size
/// without touching memory and without recording a span — there is no
/// corresponding read to report.
fn skip_output_only(descriptor: &XferDes, write_cache: &mut SequenceCache, max_bytes: u64) -> u64 {
    let mut guard = descriptor.lock();
    let idx = match guard.output_ctrl.current_index {
        Some(i) => i,
        None => return 0,
    };
    let before = guard.outputs[idx].cursor.consumed();
    guard.outputs[idx].cursor.skip_bytes(max_bytes);
    let bytes = guard.outputs[idx].cursor.consumed() - before;
    let _ = write_cache; // output-only holes carry no read span to flush
    let len = guard.outputs.len();
    let done = guard.outputs[idx].cursor.is_done();
    advance_ctrl_if_done(&mut guard.output_ctrl, done, len);
    bytes
}
