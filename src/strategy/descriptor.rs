use crate::foundation::error::{MandelError, MandelResult};

/// Numeric kernel implementation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Pixel-at-a-time reference kernel.
    Managed,
    /// Tight-loop kernel.
    Native,
    /// Massively parallel compute shader.
    Gpu,
}

/// Whole frame at once, or one row at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeMode {
    /// Compute the entire frame before any callback fires.
    Single,
    /// Compute and deliver one row at a time.
    LineByLine,
}

/// Where the executor runs relative to the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionContext {
    /// On the caller's thread of control.
    Local,
    /// Inside an isolated worker reached through [`crate::CrossThreadProxy`].
    CrossThread,
}

/// Complete description of how a render is executed.
///
/// Only the nine combinations listed in [`Strategy`] are constructible through
/// [`StrategyDescriptor::new`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct StrategyDescriptor {
    /// Whole-frame or row-by-row.
    pub compute_mode: ComputeMode,
    /// Whether the row loop polls for cancellation.
    pub cancellable: bool,
    /// Numeric kernel.
    pub backend: Backend,
    /// Local or worker execution.
    pub execution_context: ExecutionContext,
}

impl StrategyDescriptor {
    /// Build a descriptor, rejecting combinations outside the supported nine.
    pub fn new(
        compute_mode: ComputeMode,
        cancellable: bool,
        backend: Backend,
        execution_context: ExecutionContext,
    ) -> MandelResult<Self> {
        let d = Self {
            compute_mode,
            cancellable,
            backend,
            execution_context,
        };
        d.validate()?;
        Ok(d)
    }

    /// Check that this is one of the supported combinations.
    pub fn validate(&self) -> MandelResult<()> {
        self.strategy().map(|_| ())
    }

    /// Named strategy for this descriptor.
    pub fn strategy(&self) -> MandelResult<Strategy> {
        Strategy::ALL
            .into_iter()
            .find(|s| s.descriptor() == *self)
            .ok_or_else(|| {
                MandelError::validation(format!(
                    "unsupported strategy combination: {:?}/{}/{:?}/{:?}",
                    self.compute_mode,
                    if self.cancellable {
                        "cancellable"
                    } else {
                        "non-cancellable"
                    },
                    self.backend,
                    self.execution_context
                ))
            })
    }

    /// `true` when the loop should yield to the host scheduler after every row.
    ///
    /// A genuine worker never needs to yield: its canceller runs on another thread.
    pub fn yields_per_row(&self) -> bool {
        self.cancellable
            && self.compute_mode == ComputeMode::LineByLine
            && self.execution_context == ExecutionContext::Local
    }
}

/// The nine benchmarked strategies.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Managed kernel, whole frame, caller thread.
    ManagedSingle,
    /// Native kernel, whole frame, caller thread.
    NativeSingle,
    /// GPU compute shader, whole frame.
    GpuSingle,
    /// Managed kernel, row loop, blocking.
    ManagedLineByLine,
    /// Native kernel, row loop, blocking.
    NativeLineByLine,
    /// Managed kernel, row loop, yields per row and polls for cancel.
    ManagedCancellable,
    /// Native kernel, row loop, yields per row and polls for cancel.
    NativeCancellable,
    /// Managed kernel, row loop inside a worker thread.
    ManagedWorker,
    /// Native kernel, row loop inside a worker thread.
    NativeWorker,
}

impl Strategy {
    /// Every strategy in selector order.
    pub const ALL: [Strategy; 9] = [
        Strategy::ManagedSingle,
        Strategy::NativeSingle,
        Strategy::GpuSingle,
        Strategy::ManagedLineByLine,
        Strategy::NativeLineByLine,
        Strategy::ManagedCancellable,
        Strategy::NativeCancellable,
        Strategy::ManagedWorker,
        Strategy::NativeWorker,
    ];

    /// Descriptor implemented by this strategy.
    pub fn descriptor(self) -> StrategyDescriptor {
        use Backend::*;
        use ComputeMode::*;
        use ExecutionContext::*;

        let (compute_mode, cancellable, backend, execution_context) = match self {
            Strategy::ManagedSingle => (Single, false, Managed, Local),
            Strategy::NativeSingle => (Single, false, Native, Local),
            Strategy::GpuSingle => (Single, false, Gpu, Local),
            Strategy::ManagedLineByLine => (LineByLine, false, Managed, Local),
            Strategy::NativeLineByLine => (LineByLine, false, Native, Local),
            Strategy::ManagedCancellable => (LineByLine, true, Managed, Local),
            Strategy::NativeCancellable => (LineByLine, true, Native, Local),
            Strategy::ManagedWorker => (LineByLine, true, Managed, CrossThread),
            Strategy::NativeWorker => (LineByLine, true, Native, CrossThread),
        };
        StrategyDescriptor {
            compute_mode,
            cancellable,
            backend,
            execution_context,
        }
    }

    /// Short, stable identifier used on the command line and in reports.
    pub fn id(self) -> &'static str {
        match self {
            Strategy::ManagedSingle => "managed-single",
            Strategy::NativeSingle => "native-single",
            Strategy::GpuSingle => "gpu-single",
            Strategy::ManagedLineByLine => "managed-line-by-line",
            Strategy::NativeLineByLine => "native-line-by-line",
            Strategy::ManagedCancellable => "managed-cancellable",
            Strategy::NativeCancellable => "native-cancellable",
            Strategy::ManagedWorker => "managed-worker",
            Strategy::NativeWorker => "native-worker",
        }
    }

    /// Human-readable selector label.
    pub fn label(self) -> &'static str {
        match self {
            Strategy::ManagedSingle => "Managed (Single-pass)",
            Strategy::NativeSingle => "Native (Single-pass)",
            Strategy::GpuSingle => "GPU",
            Strategy::ManagedLineByLine => "Managed (Line-by-line)",
            Strategy::NativeLineByLine => "Native (Line-by-line)",
            Strategy::ManagedCancellable => "Managed (Line-by-line, Cancellable)",
            Strategy::NativeCancellable => "Native (Line-by-line, Cancellable)",
            Strategy::ManagedWorker => "Managed (Line-by-line, Worker+Cancellable)",
            Strategy::NativeWorker => "Native (Line-by-line, Worker+Cancellable)",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

impl std::str::FromStr for Strategy {
    type Err = MandelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Strategy::ALL
            .into_iter()
            .find(|st| st.id() == s)
            .ok_or_else(|| MandelError::validation(format!("unknown strategy '{s}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_nine_strategies_round_trip_through_descriptors() {
        for s in Strategy::ALL {
            let d = s.descriptor();
            assert_eq!(d.strategy().unwrap(), s);
            assert_eq!(s.id().parse::<Strategy>().unwrap(), s);
        }
        let unique: std::collections::HashSet<_> =
            Strategy::ALL.iter().map(|s| s.descriptor()).collect();
        assert_eq!(unique.len(), 9);
    }

    #[test]
    fn gpu_only_pairs_with_single_local_non_cancellable() {
        assert!(
            StrategyDescriptor::new(
                ComputeMode::LineByLine,
                false,
                Backend::Gpu,
                ExecutionContext::Local
            )
            .is_err()
        );
        assert!(
            StrategyDescriptor::new(ComputeMode::Single, true, Backend::Gpu, ExecutionContext::Local)
                .is_err()
        );
        assert!(
            StrategyDescriptor::new(
                ComputeMode::Single,
                false,
                Backend::Gpu,
                ExecutionContext::CrossThread
            )
            .is_err()
        );
        StrategyDescriptor::new(ComputeMode::Single, false, Backend::Gpu, ExecutionContext::Local)
            .unwrap();
    }

    #[test]
    fn only_local_cancellable_row_loops_yield() {
        let yielding: Vec<_> = Strategy::ALL
            .into_iter()
            .filter(|s| s.descriptor().yields_per_row())
            .collect();
        assert_eq!(
            yielding,
            vec![Strategy::ManagedCancellable, Strategy::NativeCancellable]
        );
    }

    #[test]
    fn unknown_ids_are_rejected() {
        assert!("wasm-worker".parse::<Strategy>().is_err());
    }

    #[test]
    fn strategies_serialize_by_id() {
        let s = serde_json::to_string(&Strategy::NativeWorker).unwrap();
        assert_eq!(s, "\"native-worker\"");
    }
}
