use crate::foundation::core::RenderParams;
use crate::kernel::{ESCAPE_RADIUS_SQ, Palette, PixelKernel};
use crate::strategy::descriptor::Backend;

/// Tight-loop kernel.
///
/// Reuses the squared terms between the bailout test and the update step and walks the output
/// row with `chunks_exact_mut`, so the inner loop has no bounds checks. The arithmetic is the same
/// sequence of IEEE operations as [`crate::ManagedKernel`], so iteration counts are bit-identical.
#[derive(Clone, Copy, Debug, Default)]
pub struct NativeKernel;

#[inline(always)]
fn escape_time(cx: f64, cy: f64, max_iterations: u32) -> u32 {
    let (mut x, mut y) = (0.0f64, 0.0f64);
    let (mut x2, mut y2) = (0.0f64, 0.0f64);
    let mut iteration = 0u32;
    while x2 + y2 <= ESCAPE_RADIUS_SQ && iteration < max_iterations {
        let next_x = x2 - y2 + cx;
        y = 2.0 * x * y + cy;
        x = next_x;
        x2 = x * x;
        y2 = y * y;
        iteration += 1;
    }
    iteration
}

impl PixelKernel for NativeKernel {
    fn backend(&self) -> Backend {
        Backend::Native
    }

    fn default_palette(&self) -> Palette {
        Palette::Verdant
    }

    fn iterate(&self, cx: f64, cy: f64, max_iterations: u32) -> u32 {
        escape_time(cx, cy, max_iterations)
    }

    fn render_row(&self, params: &RenderParams, palette: Palette, row: u32, out: &mut [u8]) {
        let cap = params.max_iterations;
        let cy = params.cy(row);
        let min_x = params.viewport.min_x;
        let span_x = params.viewport.max_x - params.viewport.min_x;
        let width = f64::from(params.width);

        for (col, px) in out.chunks_exact_mut(4).enumerate() {
            let cx = min_x + (span_x * col as f64) / width;
            let iteration = escape_time(cx, cy, cap);
            px.copy_from_slice(&palette.color_of(iteration, cap));
        }
    }
}
