use crate::foundation::core::RenderParams;
use crate::kernel::{ESCAPE_RADIUS_SQ, Palette, PixelKernel};
use crate::strategy::descriptor::Backend;

/// Straightforward pixel-at-a-time kernel.
///
/// Recomputes coordinates and byte offsets for every pixel and goes through [`Palette::color_of`]
/// per pixel. This is the baseline the native kernel is measured against.
#[derive(Clone, Copy, Debug, Default)]
pub struct ManagedKernel;

impl PixelKernel for ManagedKernel {
    fn backend(&self) -> Backend {
        Backend::Managed
    }

    fn default_palette(&self) -> Palette {
        Palette::Ember
    }

    fn iterate(&self, cx: f64, cy: f64, max_iterations: u32) -> u32 {
        let mut x = 0.0f64;
        let mut y = 0.0f64;
        let mut iteration = 0u32;
        while x * x + y * y <= ESCAPE_RADIUS_SQ && iteration < max_iterations {
            let next_x = x * x - y * y + cx;
            y = 2.0 * x * y + cy;
            x = next_x;
            iteration += 1;
        }
        iteration
    }

    fn render_row(&self, params: &RenderParams, palette: Palette, row: u32, out: &mut [u8]) {
        let cy = params.cy(row);
        for col in 0..params.width {
            let cx = params.cx(col);
            let iteration = self.iterate(cx, cy, params.max_iterations);
            let index = (col as usize) << 2;
            if let Some(px) = out.get_mut(index..index + 4) {
                px.copy_from_slice(&palette.color_of(iteration, params.max_iterations));
            }
        }
    }
}
