use crate::foundation::error::{MandelError, MandelResult};

/// Iteration caps offered by the benchmark selector (2^3 ..= 2^14).
pub const MAX_ITERATION_PRESETS: [u32; 12] = [
    8, 16, 32, 64, 128, 256, 512, 1024, 2048, 4096, 8192, 16384,
];

/// Rectangular window of the complex plane mapped onto the output frame.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Viewport {
    /// Real-axis value at column 0.
    pub min_x: f64,
    /// Real-axis upper bound (exclusive: column `width` would land here).
    pub max_x: f64,
    /// Imaginary-axis value at row 0.
    pub min_y: f64,
    /// Imaginary-axis upper bound (exclusive).
    pub max_y: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            min_x: -2.0,
            max_x: 1.0,
            min_y: -1.2,
            max_y: 1.2,
        }
    }
}

/// Resolution, iteration cap and viewport for one render invocation.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RenderParams {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Escape iteration cap; pixels reaching it are considered inside the set.
    pub max_iterations: u32,
    /// Complex-plane window.
    #[serde(flatten)]
    pub viewport: Viewport,
}

impl Default for RenderParams {
    fn default() -> Self {
        Self {
            width: 800,
            height: 800,
            max_iterations: 4096,
            viewport: Viewport::default(),
        }
    }
}

impl RenderParams {
    /// Build params and validate them.
    pub fn new(
        width: u32,
        height: u32,
        max_iterations: u32,
        viewport: Viewport,
    ) -> MandelResult<Self> {
        let p = Self {
            width,
            height,
            max_iterations,
            viewport,
        };
        p.validate()?;
        Ok(p)
    }

    /// Check the invariants every strategy relies on.
    pub fn validate(&self) -> MandelResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(MandelError::validation(
                "RenderParams width/height must be > 0",
            ));
        }
        if self.max_iterations == 0 {
            return Err(MandelError::validation(
                "RenderParams max_iterations must be > 0",
            ));
        }
        let v = &self.viewport;
        if ![v.min_x, v.max_x, v.min_y, v.max_y]
            .iter()
            .all(|x| x.is_finite())
        {
            return Err(MandelError::validation(
                "RenderParams viewport bounds must be finite",
            ));
        }
        if v.min_x >= v.max_x || v.min_y >= v.max_y {
            return Err(MandelError::validation(
                "RenderParams viewport requires min_x < max_x and min_y < max_y",
            ));
        }
        // Frame sizes are addressed with usize byte offsets.
        (self.width as usize)
            .checked_mul(self.height as usize)
            .and_then(|px| px.checked_mul(4))
            .ok_or_else(|| MandelError::validation("RenderParams frame size overflows"))?;
        Ok(())
    }

    /// Number of bytes in one RGBA row.
    pub fn row_bytes(&self) -> usize {
        self.width as usize * 4
    }

    /// Number of bytes in the whole RGBA frame.
    pub fn frame_bytes(&self) -> usize {
        self.row_bytes() * self.height as usize
    }

    /// Real-axis coordinate of column `col`.
    #[inline]
    pub fn cx(&self, col: u32) -> f64 {
        let v = &self.viewport;
        v.min_x + ((v.max_x - v.min_x) * f64::from(col)) / f64::from(self.width)
    }

    /// Imaginary-axis coordinate of row `row`.
    #[inline]
    pub fn cy(&self, row: u32) -> f64 {
        let v = &self.viewport;
        v.min_y + ((v.max_y - v.min_y) * f64::from(row)) / f64::from(self.height)
    }
}

/// Monotonically increasing render job identifier.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct JobId(pub u64);

impl JobId {
    /// The identifier following `self`.
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_params_are_the_benchmark_viewport() {
        let p = RenderParams::default();
        assert_eq!((p.width, p.height, p.max_iterations), (800, 800, 4096));
        assert_eq!(p.viewport.min_x, -2.0);
        assert_eq!(p.viewport.max_y, 1.2);
        p.validate().unwrap();
    }

    #[test]
    fn validate_rejects_degenerate_inputs() {
        let v = Viewport::default();
        assert!(RenderParams::new(0, 8, 16, v).is_err());
        assert!(RenderParams::new(8, 0, 16, v).is_err());
        assert!(RenderParams::new(8, 8, 0, v).is_err());

        let flipped = Viewport {
            min_x: 1.0,
            max_x: -2.0,
            ..v
        };
        assert!(RenderParams::new(8, 8, 16, flipped).is_err());

        let nan = Viewport {
            min_y: f64::NAN,
            ..v
        };
        assert!(RenderParams::new(8, 8, 16, nan).is_err());
    }

    #[test]
    fn coordinates_map_columns_and_rows_into_the_viewport() {
        let p = RenderParams::new(8, 8, 16, Viewport::default()).unwrap();
        assert_eq!(p.cx(0), -2.0);
        assert_eq!(p.cy(0), -1.2);
        assert!((p.cx(4) - -0.5).abs() < 1e-12);
        assert!((p.cy(4) - 0.0).abs() < 1e-12);
        assert_eq!(p.row_bytes(), 32);
        assert_eq!(p.frame_bytes(), 256);
    }

    #[test]
    fn params_parse_from_flat_json_with_defaults() {
        let p: RenderParams =
            serde_json::from_str(r#"{"width": 16, "height": 4, "min_x": -1.5}"#).unwrap();
        assert_eq!(p.width, 16);
        assert_eq!(p.height, 4);
        assert_eq!(p.max_iterations, 4096);
        assert_eq!(p.viewport.min_x, -1.5);
        assert_eq!(p.viewport.max_x, 1.0);
    }

    #[test]
    fn job_ids_increase() {
        assert!(JobId(3).next() > JobId(3));
        assert_eq!(JobId(u64::MAX).next(), JobId(u64::MAX));
    }
}
