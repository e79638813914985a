pub const SCREEN_WIDTH: usize = 256;
pub const SCREEN_HEIGHT: usize = 240;

/// Caller-owned ARGB8888 pixel surface the PPU renders into.
///
/// `stride` is measured in pixels, so a texture row may be wider than the
/// 256 visible columns.
pub struct FrameBuffer<'a> {
    pixels: &'a mut [u32],
    stride: usize,
}

impl<'a> FrameBuffer<'a> {
    /// Returns `None` when `pixels` cannot hold 240 rows at `stride`.
    pub fn new(pixels: &'a mut [u32], stride: usize) -> Option<Self> {
        if stride < SCREEN_WIDTH || pixels.len() < stride * (SCREEN_HEIGHT - 1) + SCREEN_WIDTH {
            return None;
        }
        Some(Self { pixels, stride })
    }

    pub(crate) fn put(&mut self, row: usize, column: usize, argb: u32) {
        if let Some(pixel) = self.pixels.get_mut(row * self.stride + column) {
            *pixel = argb;
        }
    }

    pub fn pixel(&self, row: usize, column: usize) -> u32 {
        self.pixels
            .get(row * self.stride + column)
            .copied()
            .unwrap_or_default()
    }
}

/// Owned 256x240 buffer for hosts that do not render into a texture directly.
#[derive(Clone)]
pub struct Screen {
    pixels: Vec<u32>,
}

impl Default for Screen {
    fn default() -> Self {
        Self {
            pixels: vec![0xFF00_0000; SCREEN_WIDTH * SCREEN_HEIGHT],
        }
    }
}

impl Screen {
    pub fn frame(&mut self) -> FrameBuffer<'_> {
        FrameBuffer {
            pixels: &mut self.pixels,
            stride: SCREEN_WIDTH,
        }
    }

    pub fn pixels(&self) -> &[u32] {
        &self.pixels
    }

    /// RGBA bytes in row order, as texture uploads and hashes expect.
    pub fn to_rgba(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.pixels.len() * 4);
        for &argb in &self.pixels {
            out.extend_from_slice(&[(argb >> 16) as u8, (argb >> 8) as u8, argb as u8, 0xFF]);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_undersized_buffers() {
        let mut pixels = vec![0u32; SCREEN_WIDTH * SCREEN_HEIGHT - 1];
        assert!(FrameBuffer::new(&mut pixels, SCREEN_WIDTH).is_none());
        let mut pixels = vec![0u32; SCREEN_WIDTH * SCREEN_HEIGHT];
        assert!(FrameBuffer::new(&mut pixels, SCREEN_WIDTH - 1).is_none());
    }

    #[test]
    fn writes_honor_stride() {
        let stride = 300;
        let mut pixels = vec![0u32; stride * SCREEN_HEIGHT];
        let mut frame = FrameBuffer::new(&mut pixels, stride).unwrap();
        frame.put(2, 5, 0xFF12_3456);
        assert_eq!(frame.pixel(2, 5), 0xFF12_3456);
        drop(frame);
        assert_eq!(pixels[2 * stride + 5], 0xFF12_3456);
    }

    #[test]
    fn rgba_conversion_reorders_channels() {
        let mut screen = Screen::default();
        screen.frame().put(0, 0, 0xFF11_2233);
        assert_eq!(&screen.to_rgba()[..4], &[0x11, 0x22, 0x33, 0xFF]);
    }
}
