use std::path::Path;
use std::time::Duration;

use crate::foundation::core::RenderParams;
use crate::foundation::error::{MandelError, MandelResult};
use crate::kernel::Palette;
use crate::strategy::descriptor::Strategy;

/// Benchmark run configuration, loadable from JSON.
///
/// Every field has a default, so a file only needs the keys it changes:
///
/// ```json
/// { "params": { "width": 400, "height": 400, "max_iterations": 1024 }, "repeats": 10 }
/// ```
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    /// Frame size, iteration cap and viewport.
    pub params: RenderParams,
    /// Strategies to measure, in order.
    pub strategies: Vec<Strategy>,
    /// Untimed runs per strategy before measuring.
    pub warmup: u32,
    /// Timed runs per strategy.
    pub repeats: u32,
    /// Upper bound on one run, in milliseconds.
    pub timeout_ms: u64,
    /// Palette forced onto both CPU kernels; each uses its own when unset.
    pub palette: Option<Palette>,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            params: RenderParams::default(),
            strategies: Strategy::ALL.to_vec(),
            warmup: 1,
            repeats: 5,
            timeout_ms: 120_000,
            palette: None,
        }
    }
}

impl BenchConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> MandelResult<Self> {
        let cfg: Self = serde_json::from_str(json)
            .map_err(|e| MandelError::configuration(format!("parse bench config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read, parse and validate a JSON file.
    pub fn from_json_path(path: &Path) -> MandelResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            MandelError::configuration(format!("read bench config '{}': {e}", path.display()))
        })?;
        Self::from_json_str(&text)
    }

    /// Check the run shape and the render params.
    pub fn validate(&self) -> MandelResult<()> {
        self.params.validate()?;
        if self.strategies.is_empty() {
            return Err(MandelError::validation("bench config lists no strategies"));
        }
        if self.repeats == 0 {
            return Err(MandelError::validation("bench config repeats must be > 0"));
        }
        if self.timeout_ms == 0 {
            return Err(MandelError::validation("bench config timeout_ms must be > 0"));
        }
        Ok(())
    }

    /// [`BenchConfig::timeout_ms`] as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
