//! Per-pixel escape-time kernels.
//!
//! Two interchangeable CPU implementations share one contract: for the same `(cx, cy, cap)` they
//! return the same iteration count. They differ in how they walk memory and in their default
//! palette.

use crate::foundation::core::RenderParams;
use crate::foundation::error::{MandelError, MandelResult};
use crate::render::frame::FrameBuffer;
use crate::strategy::descriptor::Backend;

pub(crate) mod managed;
pub(crate) mod native;

pub use managed::ManagedKernel;
pub use native::NativeKernel;

/// Escape radius squared.
pub const ESCAPE_RADIUS_SQ: f64 = 4.0;

/// Iteration-count to RGBA gradient.
///
/// Only internal consistency within one palette matters; the two variants exist so the two CPU
/// backends are visually distinguishable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Palette {
    /// Red-dominant: `(c, c >> 1, c >> 2)`.
    Ember,
    /// Green-dominant: `(c >> 2, c, c >> 1)`.
    Verdant,
}

impl Palette {
    /// Map an escape count to an opaque RGBA pixel.
    ///
    /// `iterations == max_iterations` (never escaped) is opaque black.
    #[inline]
    pub fn color_of(self, iterations: u32, max_iterations: u32) -> [u8; 4] {
        if iterations >= max_iterations {
            return [0, 0, 0, 255];
        }
        let c = ((u64::from(iterations) * 12) % 256) as u8;
        match self {
            Palette::Ember => [c, c >> 1, c >> 2, 255],
            Palette::Verdant => [c >> 2, c, c >> 1, 255],
        }
    }
}

/// A CPU escape-time kernel.
pub trait PixelKernel: Send {
    /// Which backend this kernel implements.
    fn backend(&self) -> Backend;

    /// Palette used when the caller does not override it.
    fn default_palette(&self) -> Palette;

    /// Iterate `z <- z^2 + c` from `z = 0` until `|z|^2 > 4` or the cap is reached.
    fn iterate(&self, cx: f64, cy: f64, max_iterations: u32) -> u32;

    /// Fill one tightly packed RGBA row (`params.width * 4` bytes).
    fn render_row(&self, params: &RenderParams, palette: Palette, row: u32, out: &mut [u8]);

    /// Color with this kernel's default palette.
    fn color_of(&self, iterations: u32, max_iterations: u32) -> [u8; 4] {
        self.default_palette().color_of(iterations, max_iterations)
    }
}

/// Construct the CPU kernel for `backend`.
///
/// The GPU backend has no per-pixel host kernel; asking for one is a caller contract violation.
pub fn kernel_for(backend: Backend) -> MandelResult<Box<dyn PixelKernel>> {
    match backend {
        Backend::Managed => Ok(Box::new(ManagedKernel)),
        Backend::Native => Ok(Box::new(NativeKernel)),
        Backend::Gpu => Err(MandelError::validation(
            "gpu backend has no host pixel kernel",
        )),
    }
}

/// Explicit kernel state: the kernel, the palette and the frame it renders into.
///
/// Every render owns its own context; nothing is shared between jobs.
pub struct KernelContext {
    kernel: Box<dyn PixelKernel>,
    palette: Palette,
    params: Option<RenderParams>,
    frame: FrameBuffer,
}

impl std::fmt::Debug for KernelContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelContext")
            .field("backend", &self.kernel.backend())
            .field("palette", &self.palette)
            .field("params", &self.params)
            .field("frame_bytes", &self.frame.len())
            .finish()
    }
}

impl KernelContext {
    /// Context for a CPU backend using the kernel's default palette.
    pub fn new(backend: Backend) -> MandelResult<Self> {
        let kernel = kernel_for(backend)?;
        let palette = kernel.default_palette();
        Ok(Self {
            kernel,
            palette,
            params: None,
            frame: FrameBuffer::default(),
        })
    }

    /// Override the palette.
    pub fn with_palette(mut self, palette: Palette) -> Self {
        self.palette = palette;
        self
    }

    /// Backend of the wrapped kernel.
    pub fn backend(&self) -> Backend {
        self.kernel.backend()
    }

    /// Active palette.
    pub fn palette(&self) -> Palette {
        self.palette
    }

    /// Borrow the wrapped kernel.
    pub fn kernel(&self) -> &dyn PixelKernel {
        self.kernel.as_ref()
    }

    /// Bind `params` and zero-allocate a matching frame, replacing any previous one.
    pub fn init_canvas(&mut self, params: RenderParams) -> MandelResult<()> {
        params.validate()?;
        self.frame.allocate(params.width, params.height)?;
        self.params = Some(params);
        Ok(())
    }

    fn bound_params(&self) -> MandelResult<RenderParams> {
        self.params
            .ok_or_else(|| MandelError::execution("kernel canvas was not initialized"))
    }

    /// Compute row `row` into the frame and return that row's bytes.
    pub fn calculate_row(&mut self, row: u32) -> MandelResult<&[u8]> {
        let params = self.bound_params()?;
        let out = self.frame.row_mut(row)?;
        self.kernel.render_row(&params, self.palette, row, out);
        self.frame.row(row)
    }

    /// Compute every row and return the full frame.
    pub fn calculate(&mut self) -> MandelResult<&[u8]> {
        let params = self.bound_params()?;
        for row in 0..params.height {
            let out = self.frame.row_mut(row)?;
            self.kernel.render_row(&params, self.palette, row, out);
        }
        Ok(self.frame.full_view())
    }

    /// Borrow the frame.
    pub fn frame(&self) -> &FrameBuffer {
        &self.frame
    }
}
