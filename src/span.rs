//! Strided destination views for pixel copies.
//!
//! An [`ImageSpan`] describes where gathered pixels land in caller memory:
//! a byte buffer plus per-dimension strides (channel, x, y, z). Strides are
//! signed, so flipped layouts (e.g. bottom-up scanline order) are expressed
//! with a negative y stride. All addressing is validated when the span is
//! constructed, so the copy routines are bounds-safe without `unsafe`.

use crate::error::CacheError;
use crate::types::PixelFormat;

/// Marker for element types that can back a typed span.
pub trait PixelElement: bytemuck::Pod {
    const FORMAT: PixelFormat;
}

impl PixelElement for u8 {
    const FORMAT: PixelFormat = PixelFormat::U8;
}
impl PixelElement for u16 {
    const FORMAT: PixelFormat = PixelFormat::U16;
}
impl PixelElement for half::f16 {
    const FORMAT: PixelFormat = PixelFormat::Half;
}
impl PixelElement for f32 {
    const FORMAT: PixelFormat = PixelFormat::F32;
}

// =============================================================================
// ImageSpan
// =============================================================================

/// A mutable, strided view of pixel storage.
///
/// The view covers `width × height × depth` pixels of `nchannels` channels
/// each. Element addresses are computed as
/// `origin + c·chstride + x·xstride + y·ystride + z·zstride` (in bytes);
/// `origin` is chosen at construction so that every reachable address lies
/// inside the borrowed buffer, including when some strides are negative.
pub struct ImageSpan<'a> {
    buf: &'a mut [u8],
    format: PixelFormat,
    origin: isize,
    nchannels: usize,
    width: usize,
    height: usize,
    depth: usize,
    chstride: isize,
    xstride: isize,
    ystride: isize,
    zstride: isize,
}

impl<'a> ImageSpan<'a> {
    /// A densely packed interleaved 2D view: channels innermost, then x,
    /// then y.
    pub fn contiguous(
        buf: &'a mut [u8],
        format: PixelFormat,
        nchannels: usize,
        width: usize,
        height: usize,
    ) -> Result<ImageSpan<'a>, CacheError> {
        Self::contiguous_3d(buf, format, nchannels, width, height, 1)
    }

    /// A densely packed interleaved 3D view.
    pub fn contiguous_3d(
        buf: &'a mut [u8],
        format: PixelFormat,
        nchannels: usize,
        width: usize,
        height: usize,
        depth: usize,
    ) -> Result<ImageSpan<'a>, CacheError> {
        let es = format.size() as isize;
        let chstride = es;
        let xstride = es * nchannels as isize;
        let ystride = xstride * width as isize;
        let zstride = ystride * height as isize;
        Self::with_strides(
            buf, format, nchannels, width, height, depth, chstride, xstride, ystride, zstride,
        )
    }

    /// A typed contiguous 2D view over a slice of pixel elements.
    pub fn of<T: PixelElement>(
        buf: &'a mut [T],
        nchannels: usize,
        width: usize,
        height: usize,
    ) -> Result<ImageSpan<'a>, CacheError> {
        Self::contiguous(bytemuck::cast_slice_mut(buf), T::FORMAT, nchannels, width, height)
    }

    /// A view with explicit byte strides. Strides may be negative; the
    /// element at logical position (0,0,0,0) is then anchored so that the
    /// whole view stays inside `buf`.
    #[allow(clippy::too_many_arguments)]
    pub fn with_strides(
        buf: &'a mut [u8],
        format: PixelFormat,
        nchannels: usize,
        width: usize,
        height: usize,
        depth: usize,
        chstride: isize,
        xstride: isize,
        ystride: isize,
        zstride: isize,
    ) -> Result<ImageSpan<'a>, CacheError> {
        if nchannels == 0 || width == 0 || height == 0 || depth == 0 {
            return Err(CacheError::TypeMismatch(
                "image span has a zero-sized dimension".to_string(),
            ));
        }
        let mut min: isize = 0;
        let mut max: isize = 0;
        for (stride, count) in [
            (chstride, nchannels),
            (xstride, width),
            (ystride, height),
            (zstride, depth),
        ] {
            let span = stride * (count as isize - 1);
            if span < 0 {
                min += span;
            } else {
                max += span;
            }
        }
        let needed = (max - min) as usize + format.size();
        if needed > buf.len() {
            return Err(CacheError::TypeMismatch(format!(
                "image span needs {} bytes but buffer has {}",
                needed,
                buf.len()
            )));
        }
        Ok(ImageSpan {
            buf,
            format,
            origin: -min,
            nchannels,
            width,
            height,
            depth,
            chstride,
            xstride,
            ystride,
            zstride,
        })
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn nchannels(&self) -> usize {
        self.nchannels
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    #[inline]
    fn byte_offset(&self, x: usize, y: usize, z: usize, c: usize) -> usize {
        debug_assert!(x < self.width && y < self.height && z < self.depth && c < self.nchannels);
        (self.origin
            + c as isize * self.chstride
            + x as isize * self.xstride
            + y as isize * self.ystride
            + z as isize * self.zstride) as usize
    }

    /// True when elements are densely packed in channel-then-x-then-y-then-z
    /// order, which permits whole-row byte copies.
    fn is_contiguous(&self) -> bool {
        let es = self.format.size() as isize;
        self.chstride == es
            && self.xstride == es * self.nchannels as isize
            && self.ystride == self.xstride * self.width as isize
            && self.zstride == self.ystride * self.height as isize
    }

    /// Zero every element covered by the view.
    pub fn zero(&mut self) {
        if self.is_contiguous() {
            let total = self.width * self.height * self.depth * self.nchannels * self.format.size();
            let start = self.origin as usize;
            self.buf[start..start + total].fill(0);
            return;
        }
        for z in 0..self.depth {
            for y in 0..self.height {
                for x in 0..self.width {
                    for c in 0..self.nchannels {
                        let off = self.byte_offset(x, y, z, c);
                        self.buf[off..off + self.format.size()].fill(0);
                    }
                }
            }
        }
    }

    /// Copy a box out of a contiguous source buffer into this view,
    /// converting formats element-wise.
    ///
    /// The source is interleaved with `src_nch` channels and row length
    /// `src_width` pixels (plane size `src_width × src_height`). The box
    /// starts at `(sx, sy, sz)` channel `sch` in the source and lands at
    /// `(dx, dy, dz)` channel `dch` here; `nch` channels are copied.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn copy_from_buffer(
        &mut self,
        dx: usize,
        dy: usize,
        dz: usize,
        dch: usize,
        size_x: usize,
        size_y: usize,
        size_z: usize,
        nch: usize,
        src: &[u8],
        src_format: PixelFormat,
        src_width: usize,
        src_height: usize,
        src_nch: usize,
        sx: usize,
        sy: usize,
        sz: usize,
        sch: usize,
    ) {
        debug_assert!(dx + size_x <= self.width);
        debug_assert!(dy + size_y <= self.height);
        debug_assert!(dz + size_z <= self.depth);
        debug_assert!(dch + nch <= self.nchannels);
        debug_assert!(sch + nch <= src_nch);

        let ses = src_format.size();
        let des = self.format.size();
        let row_fastpath = src_format == self.format
            && sch == 0
            && nch == src_nch
            && self.chstride == des as isize
            && self.xstride == (des * self.nchannels) as isize
            && dch == 0
            && nch == self.nchannels;

        for z in 0..size_z {
            for y in 0..size_y {
                let src_row = (((sz + z) * src_height + (sy + y)) * src_width + sx) * src_nch;
                if row_fastpath {
                    let sbytes = src_row * ses;
                    let count = size_x * nch * ses;
                    let doff = self.byte_offset(dx, dy + y, dz + z, 0);
                    self.buf[doff..doff + count].copy_from_slice(&src[sbytes..sbytes + count]);
                    continue;
                }
                for x in 0..size_x {
                    let src_px = src_row + x * src_nch + sch;
                    for c in 0..nch {
                        let v = src_format.read_f32(src, src_px + c);
                        let doff = self.byte_offset(dx + x, dy + y, dz + z, dch + c);
                        self.format
                            .write_f32(&mut self.buf[doff..doff + des], 0, v);
                    }
                }
            }
        }
    }
}
