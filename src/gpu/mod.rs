//! One-shot GPU compute path.
//!
//! The adapter owns the device, the compute pipeline and the buffers for one frame size.
//! `configure` builds them, `submit` uploads the parameter block, dispatches, waits for the queue and
//! reads the RGBA result back. Without the `gpu` feature every entry point reports a configuration
//! error, so callers can exclude the GPU strategy up front.

use crate::foundation::core::Viewport;
use crate::foundation::error::{MandelError, MandelResult};

#[cfg(feature = "gpu")]
mod device;

/// Workgroup edge length used by the shader (`@workgroup_size(8, 8, 1)`).
pub const WORKGROUP_SIZE: u32 = 8;

/// Size in bytes of the uniform parameter block (28 bytes of fields, padded to 32).
pub const PARAMS_BYTES: usize = 32;

/// Uniform parameter block uploaded once per submit.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GpuParams {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Escape iteration cap.
    pub max_iterations: u32,
    /// Viewport narrowed to shader precision.
    pub min_x: f32,
    /// Viewport narrowed to shader precision.
    pub max_x: f32,
    /// Viewport narrowed to shader precision.
    pub min_y: f32,
    /// Viewport narrowed to shader precision.
    pub max_y: f32,
}

impl GpuParams {
    /// Build the block for a frame size, iteration cap and viewport.
    pub fn new(width: u32, height: u32, max_iterations: u32, viewport: Viewport) -> Self {
        Self {
            width,
            height,
            max_iterations,
            min_x: viewport.min_x as f32,
            max_x: viewport.max_x as f32,
            min_y: viewport.min_y as f32,
            max_y: viewport.max_y as f32,
        }
    }

    /// Little-endian std140-compatible layout: three `u32`, four `f32`, one pad word.
    pub fn to_bytes(&self) -> [u8; PARAMS_BYTES] {
        let mut out = [0u8; PARAMS_BYTES];
        out[0..4].copy_from_slice(&self.width.to_le_bytes());
        out[4..8].copy_from_slice(&self.height.to_le_bytes());
        out[8..12].copy_from_slice(&self.max_iterations.to_le_bytes());
        out[12..16].copy_from_slice(&self.min_x.to_le_bytes());
        out[16..20].copy_from_slice(&self.max_x.to_le_bytes());
        out[20..24].copy_from_slice(&self.min_y.to_le_bytes());
        out[24..28].copy_from_slice(&self.max_y.to_le_bytes());
        out
    }

    /// Workgroups needed to cover the frame in x and y.
    pub fn workgroups(&self) -> (u32, u32) {
        (
            self.width.div_ceil(WORKGROUP_SIZE),
            self.height.div_ceil(WORKGROUP_SIZE),
        )
    }
}

/// Adapter lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GpuAdapterState {
    /// No device or pipeline yet.
    Uninitialized,
    /// Device, pipeline and buffers exist for `width` x `height`.
    Configured {
        /// Configured frame width.
        width: u32,
        /// Configured frame height.
        height: u32,
    },
    /// A submit is waiting for the device.
    Submitting,
}

/// Submit/read-back interface to the GPU compute kernel.
pub struct GpuKernelAdapter {
    state: GpuAdapterState,
    #[cfg(feature = "gpu")]
    device: Option<device::GpuDevice>,
}

impl std::fmt::Debug for GpuKernelAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuKernelAdapter")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Default for GpuKernelAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuKernelAdapter {
    /// Unconfigured adapter. No device is touched until [`GpuKernelAdapter::configure`].
    pub fn new() -> Self {
        Self {
            state: GpuAdapterState::Uninitialized,
            #[cfg(feature = "gpu")]
            device: None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> GpuAdapterState {
        self.state
    }

    /// Acquire a device and build the pipeline and buffers for `width` x `height`.
    ///
    /// Reconfiguring with the same size is a no-op. A missing device is reported, never retried.
    pub fn configure(&mut self, width: u32, height: u32) -> MandelResult<()> {
        if width == 0 || height == 0 {
            return Err(MandelError::validation("gpu frame width/height must be > 0"));
        }
        if self.state == (GpuAdapterState::Configured { width, height }) {
            return Ok(());
        }
        self.configure_device(width, height)?;
        self.state = GpuAdapterState::Configured { width, height };
        tracing::debug!(width, height, "gpu adapter configured");
        Ok(())
    }

    #[cfg(feature = "gpu")]
    fn configure_device(&mut self, width: u32, height: u32) -> MandelResult<()> {
        self.device = None;
        self.state = GpuAdapterState::Uninitialized;
        self.device = Some(device::GpuDevice::new(width, height)?);
        Ok(())
    }

    #[cfg(not(feature = "gpu"))]
    fn configure_device(&mut self, _width: u32, _height: u32) -> MandelResult<()> {
        Err(MandelError::configuration(
            "gpu support was not compiled in (enable the `gpu` feature)",
        ))
    }

    /// Dispatch one frame and return its RGBA bytes (`width * height * 4`).
    pub fn submit(&mut self, max_iterations: u32, viewport: Viewport) -> MandelResult<Vec<u8>> {
        let GpuAdapterState::Configured { width, height } = self.state else {
            return Err(MandelError::configuration("gpu adapter is not configured"));
        };
        let params = GpuParams::new(width, height, max_iterations, viewport);

        self.state = GpuAdapterState::Submitting;
        let res = self.dispatch(&params);
        self.state = GpuAdapterState::Configured { width, height };
        res
    }

    #[cfg(feature = "gpu")]
    fn dispatch(&self, params: &GpuParams) -> MandelResult<Vec<u8>> {
        self.device
            .as_ref()
            .ok_or_else(|| MandelError::configuration("gpu adapter is not configured"))?
            .dispatch(params)
    }

    #[cfg(not(feature = "gpu"))]
    fn dispatch(&self, _params: &GpuParams) -> MandelResult<Vec<u8>> {
        Err(MandelError::configuration(
            "gpu support was not compiled in (enable the `gpu` feature)",
        ))
    }
}

/// Static capability check: can a compute-capable adapter be acquired?
///
/// The probe runs once per process; later calls return the cached answer.
pub fn is_available() -> bool {
    static AVAILABLE: std::sync::OnceLock<bool> = std::sync::OnceLock::new();
    *AVAILABLE.get_or_init(|| {
        #[cfg(feature = "gpu")]
        let available = device::probe();
        #[cfg(not(feature = "gpu"))]
        let available = false;
        tracing::debug!(available, "gpu capability probed");
        available
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_block_layout_is_little_endian_and_padded() {
        let p = GpuParams::new(800, 600, 4096, Viewport::default());
        let b = p.to_bytes();
        assert_eq!(b.len(), PARAMS_BYTES);
        assert_eq!(u32::from_le_bytes(b[0..4].try_into().unwrap()), 800);
        assert_eq!(u32::from_le_bytes(b[4..8].try_into().unwrap()), 600);
        assert_eq!(u32::from_le_bytes(b[8..12].try_into().unwrap()), 4096);
        assert_eq!(f32::from_le_bytes(b[12..16].try_into().unwrap()), -2.0);
        assert_eq!(f32::from_le_bytes(b[16..20].try_into().unwrap()), 1.0);
        assert_eq!(f32::from_le_bytes(b[20..24].try_into().unwrap()), -1.2f32);
        assert_eq!(f32::from_le_bytes(b[24..28].try_into().unwrap()), 1.2f32);
        assert_eq!(&b[28..32], &[0, 0, 0, 0]);
    }

    #[test]
    fn workgroups_cover_partial_tiles() {
        let p = GpuParams::new(17, 8, 1, Viewport::default());
        assert_eq!(p.workgroups(), (3, 1));
    }

    #[test]
    fn submit_before_configure_is_rejected() {
        let mut a = GpuKernelAdapter::new();
        assert_eq!(a.state(), GpuAdapterState::Uninitialized);
        let err = a.submit(16, Viewport::default()).unwrap_err();
        assert!(err.to_string().contains("configuration error"));
    }

    #[test]
    fn zero_sized_configure_is_rejected() {
        let mut a = GpuKernelAdapter::new();
        assert!(a.configure(0, 8).is_err());
    }

    #[cfg(not(feature = "gpu"))]
    #[test]
    fn without_the_feature_gpu_is_unavailable() {
        assert!(!is_available());
        let mut a = GpuKernelAdapter::new();
        assert!(a.configure(8, 8).is_err());
        assert_eq!(a.state(), GpuAdapterState::Uninitialized);
    }
}
