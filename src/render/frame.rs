use crate::foundation::error::{MandelError, MandelResult};

/// A rendered frame as straight-alpha RGBA8 pixels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameRGBA {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// RGBA8 bytes, tightly packed, row-major.
    pub data: Vec<u8>,
}

/// Owned, contiguous RGBA byte region addressable by row.
///
/// Reads never copy implicitly: [`FrameBuffer::row`] and [`FrameBuffer::full_view`] borrow, and
/// callers decide whether to `to_vec()` or hand the reference on.
#[derive(Clone, Debug, Default)]
pub struct FrameBuffer {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl FrameBuffer {
    /// Zero-filled buffer of `width * height * 4` bytes.
    pub fn new(width: u32, height: u32) -> MandelResult<Self> {
        let mut fb = Self::default();
        fb.allocate(width, height)?;
        Ok(fb)
    }

    /// Replace any previous allocation with a zero-filled `width * height * 4` region.
    pub fn allocate(&mut self, width: u32, height: u32) -> MandelResult<()> {
        if width == 0 || height == 0 {
            return Err(MandelError::validation(
                "frame buffer width/height must be > 0",
            ));
        }
        let len = (width as usize)
            .checked_mul(height as usize)
            .and_then(|px| px.checked_mul(4))
            .ok_or_else(|| MandelError::validation("frame buffer size overflow"))?;
        self.width = width;
        self.height = height;
        self.data = vec![0u8; len];
        Ok(())
    }

    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// `true` before the first allocation.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn row_range(&self, row: u32) -> MandelResult<std::ops::Range<usize>> {
        if row >= self.height {
            return Err(MandelError::validation(format!(
                "row {row} out of range for frame height {}",
                self.height
            )));
        }
        let stride = self.width as usize * 4;
        let start = row as usize * stride;
        Ok(start..start + stride)
    }

    /// Borrow the bytes of row `row` (`0 <= row < height`).
    pub fn row(&self, row: u32) -> MandelResult<&[u8]> {
        let r = self.row_range(row)?;
        Ok(&self.data[r])
    }

    /// Mutably borrow the bytes of row `row`.
    pub fn row_mut(&mut self, row: u32) -> MandelResult<&mut [u8]> {
        let r = self.row_range(row)?;
        Ok(&mut self.data[r])
    }

    /// Borrow the whole frame.
    pub fn full_view(&self) -> &[u8] {
        &self.data
    }

    /// Copy the frame out as a [`FrameRGBA`].
    pub fn to_frame(&self) -> FrameRGBA {
        FrameRGBA {
            width: self.width,
            height: self.height,
            data: self.data.clone(),
        }
    }

    /// Consume the buffer without copying.
    pub fn into_frame(self) -> FrameRGBA {
        FrameRGBA {
            width: self.width,
            height: self.height,
            data: self.data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_zero_fills_and_replaces() {
        let mut fb = FrameBuffer::new(4, 2).unwrap();
        assert_eq!(fb.len(), 32);
        assert!(fb.full_view().iter().all(|&b| b == 0));

        fb.row_mut(1).unwrap().fill(7);
        fb.allocate(3, 3).unwrap();
        assert_eq!((fb.width(), fb.height(), fb.len()), (3, 3, 36));
        assert!(fb.full_view().iter().all(|&b| b == 0));
    }

    #[test]
    fn rows_are_bounds_checked() {
        let mut fb = FrameBuffer::new(2, 3).unwrap();
        assert_eq!(fb.row(2).unwrap().len(), 8);
        assert!(fb.row(3).is_err());
        assert!(fb.row_mut(3).is_err());
        assert!(FrameBuffer::default().row(0).is_err());
    }

    #[test]
    fn row_slices_address_the_right_bytes() {
        let mut fb = FrameBuffer::new(2, 2).unwrap();
        fb.row_mut(1).unwrap().copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&fb.full_view()[8..], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(fb.row(0).unwrap(), &[0u8; 8]);

        let frame = fb.into_frame();
        assert_eq!((frame.width, frame.height), (2, 2));
        assert_eq!(frame.data.len(), 16);
    }

    #[test]
    fn zero_sized_allocations_are_rejected() {
        assert!(FrameBuffer::new(0, 4).is_err());
        assert!(FrameBuffer::new(4, 0).is_err());
    }
}
