//! Address List Cursor — a stateful iterator over a rectangular,
//! possibly-partially-consumed multidimensional address range.
//!
//! The cursor tracks up to three nested dimensions: dim 0 is contiguous
//! bytes within the current line, dim 1 is lines within the current
//! plane, dim 2 is planes. Higher dims only "tile" cleanly with the ones
//! below them when those lower dims are sitting at a fresh boundary
//! (i.e. fully reset); `dim()` reports this dynamically rather than
//! caching a flag that could drift out of sync with the counts.

/// One nested dimension: `total` is the full span of one cycle (used to
/// reset after a carry), `remaining` is how much of the current cycle is
/// left, `stride` is the byte pitch between successive indices (unused
/// for dim 0, whose unit is already bytes).
#[derive(Clone, Copy, Debug)]
struct Dim {
    total: u64,
    remaining: u64,
    stride: u64,
}

impl Dim {
    fn at_boundary(&self) -> bool {
        self.remaining == self.total
    }
}

/// Describes a rectangular region: a line of `line_bytes`, optionally
/// repeated `lines` times at `line_stride`, optionally repeated again
/// `planes` times at `plane_stride`.
#[derive(Clone, Copy, Debug)]
pub struct Shape {
    pub line_bytes: u64,
    pub lines: u64,
    pub line_stride: u64,
    pub planes: u64,
    pub plane_stride: u64,
}

impl Shape {
    pub fn line(line_bytes: u64) -> Self {
        Shape { line_bytes, lines: 1, line_stride: line_bytes, planes: 1, plane_stride: line_bytes }
    }

    pub fn plane(line_bytes: u64, lines: u64, line_stride: u64) -> Self {
        Shape { line_bytes, lines, line_stride, planes: 1, plane_stride: line_stride * lines }
    }

    pub fn volume(line_bytes: u64, lines: u64, line_stride: u64, planes: u64, plane_stride: u64) -> Self {
        Shape { line_bytes, lines, line_stride, planes, plane_stride }
    }

    /// Effective rank: 1 if this is a single line, 2 if a single plane of
    /// several lines, 3 if several planes.
    fn rank(&self) -> usize {
        if self.planes > 1 {
            3
        } else if self.lines > 1 {
            2
        } else {
            1
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.line_bytes * self.lines * self.planes
    }
}

#[derive(Clone, Debug)]
pub struct AddressListCursor {
    base_offset: u64,
    offset: u64,
    dims: [Dim; 3],
    rank: usize,
}

impl AddressListCursor {
    pub fn new(base_offset: u64, shape: Shape) -> Self {
        AddressListCursor {
            base_offset,
            offset: base_offset,
            dims: [
                Dim { total: shape.line_bytes, remaining: shape.line_bytes, stride: shape.line_bytes },
                Dim { total: shape.lines, remaining: shape.lines, stride: shape.line_stride },
                Dim { total: shape.planes, remaining: shape.planes, stride: shape.plane_stride },
            ],
            rank: shape.rank(),
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// How many bytes have been consumed since construction.
    pub fn consumed(&self) -> u64 {
        self.offset - self.base_offset
    }

    /// True once every dim has been fully drained. The outermost dim's
    /// remaining count hits zero exactly when the whole range has been
    /// consumed, since every carry resets the dims below it back to a
    /// full boundary before decrementing the one above.
    pub fn is_done(&self) -> bool {
        self.dims[self.rank - 1].remaining == 0
    }

    /// Current effective dimensionality: 3 only when positioned at a
    /// plane boundary, 2 only when positioned at a line boundary, 1
    /// otherwise. Mirrors the contract: partial consumption of a lower
    /// dim hides the higher ones until that remainder drains.
    pub fn dim(&self) -> usize {
        if self.rank >= 3 && self.dims[0].at_boundary() && self.dims[1].at_boundary() {
            3
        } else if self.rank >= 2 && self.dims[0].at_boundary() {
            2
        } else {
            1
        }
    }

    pub fn remaining(&self, d: usize) -> u64 {
        self.dims[d].remaining
    }

    /// Per the contract, dim 0 has unit stride and reports contiguous
    /// bytes rather than a byte pitch.
    pub fn stride(&self, d: usize) -> u64 {
        if d == 0 {
            self.dims[0].remaining
        } else {
            self.dims[d].stride
        }
    }

    /// Consume `n` units at dim `d`.
    ///
    /// For `d == 0`, `n` may be a partial line (any amount up to
    /// `remaining(0)`); draining a line to zero carries into dim 1 (and
    /// transitively dim 2). For `d > 0`, `n` whole units are consumed;
    /// callers must only invoke this when the lower dims are sitting at
    /// a boundary (i.e. `dim() > d`), which is exactly when the engine's
    /// split/promote logic chooses to advance at that dim.
    pub fn advance(&mut self, d: usize, n: u64) {
        assert!(n <= self.dims[d].remaining, "advance({d}, {n}) exceeds remaining {}", self.dims[d].remaining);
        if d == 0 {
            self.offset += n;
            self.dims[0].remaining -= n;
            if self.dims[0].remaining == 0 && self.rank > 1 {
                self.carry_line();
            }
        } else if d == 1 {
            self.offset += n * self.dims[1].stride;
            self.dims[1].remaining -= n;
            if self.dims[1].remaining == 0 && self.rank > 2 {
                self.carry_plane();
            }
        } else {
            self.offset += n * self.dims[2].stride;
            self.dims[2].remaining -= n;
        }
    }

    fn carry_line(&mut self) {
        // Jump over any padding between the end of this line and the
        // start of the next one.
        self.offset += self.dims[1].stride - self.dims[0].total;
        self.dims[0].remaining = self.dims[0].total;
        self.dims[1].remaining -= 1;
        if self.dims[1].remaining == 0 && self.rank > 2 {
            self.carry_plane();
        }
    }

    fn carry_plane(&mut self) {
        self.offset += self.dims[2].stride - self.dims[1].stride * self.dims[1].total;
        self.dims[1].remaining = self.dims[1].total;
        self.dims[2].remaining -= 1;
    }

    /// Discard `n` bytes of the range without touching memory.
    pub fn skip_bytes(&mut self, mut n: u64) {
        while n > 0 && !self.is_done() {
            let chunk = n.min(self.dims[0].remaining);
            if chunk == 0 {
                break;
            }
            self.advance(0, chunk);
            n -= chunk;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_d_line_drains_in_one_shot() {
        let mut c = AddressListCursor::new(0, Shape::line(1024));
        assert_eq!(c.dim(), 1);
        assert_eq!(c.remaining(0), 1024);
        c.advance(0, 1024);
        assert_eq!(c.remaining(0), 0);
        assert_eq!(c.offset(), 1024);
    }

    #[test]
    fn two_d_plane_full_lines() {
        let mut c = AddressListCursor::new(0, Shape::plane(512, 64, 1024));
        assert_eq!(c.dim(), 2);
        assert_eq!(c.remaining(0), 512);
        assert_eq!(c.remaining(1), 64);
        assert_eq!(c.stride(1), 1024);
        c.advance(1, 64);
        assert_eq!(c.remaining(1), 0);
        assert_eq!(c.offset(), 64 * 1024);
    }

    #[test]
    fn partial_line_hides_outer_dims() {
        let mut c = AddressListCursor::new(0, Shape::plane(512, 4, 512));
        assert_eq!(c.dim(), 2);
        c.advance(0, 256);
        // Mid-line: dim() must drop to 1 even though lines remain.
        assert_eq!(c.dim(), 1);
        assert_eq!(c.remaining(0), 256);
        c.advance(0, 256);
        // Back at a line boundary, carried into the next line.
        assert_eq!(c.dim(), 2);
        assert_eq!(c.remaining(1), 3);
    }

    #[test]
    fn three_d_plane_boundary_exposes_dim3() {
        let mut c = AddressListCursor::new(0, Shape::volume(256, 64, 256, 8, 256 * 64));
        assert_eq!(c.dim(), 3);
        c.advance(1, 32);
        // Partway through a plane: dim 3 is hidden.
        assert_eq!(c.dim(), 2);
        c.advance(1, 32);
        assert_eq!(c.dim(), 3);
        assert_eq!(c.remaining(2), 7);
    }

    #[test]
    fn skip_bytes_walks_through_carries() {
        let mut c = AddressListCursor::new(100, Shape::plane(64, 4, 64));
        c.skip_bytes(64 * 4);
        assert_eq!(c.offset(), 100 + 64 * 4);
        assert_eq!(c.remaining(1), 0);
    }
}
