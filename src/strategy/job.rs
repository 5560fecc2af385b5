use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crate::foundation::core::{JobId, RenderParams};
use crate::foundation::error::MandelResult;
use crate::strategy::descriptor::StrategyDescriptor;

/// Cooperative cancellation flag shared between a job and whoever may cancel it.
///
/// Setting it is idempotent; the row loop polls it once per row, so at most one row already in
/// progress completes after the request.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A fresh, un-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Calling this more than once has no further effect.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// `true` once [`CancelToken::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// One render invocation.
///
/// Owned by the initiating side. The cancel flag is the only state that changes after creation.
#[derive(Clone, Debug)]
pub struct RenderJob {
    id: JobId,
    descriptor: StrategyDescriptor,
    params: RenderParams,
    started_at: Instant,
    cancel: CancelToken,
}

impl RenderJob {
    /// Validate inputs and stamp the start time.
    pub fn new(
        id: JobId,
        descriptor: StrategyDescriptor,
        params: RenderParams,
    ) -> MandelResult<Self> {
        Self::with_token(id, descriptor, params, Instant::now(), CancelToken::new())
    }

    /// Build a job around an existing cancel token and start time.
    ///
    /// Used on the worker side, where the start time travels with the request and the token is
    /// owned by the port thread.
    pub fn with_token(
        id: JobId,
        descriptor: StrategyDescriptor,
        params: RenderParams,
        started_at: Instant,
        cancel: CancelToken,
    ) -> MandelResult<Self> {
        descriptor.validate()?;
        params.validate()?;
        Ok(Self {
            id,
            descriptor,
            params,
            started_at,
            cancel,
        })
    }

    /// Job identifier carried by every callback.
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Strategy descriptor.
    pub fn descriptor(&self) -> &StrategyDescriptor {
        &self.descriptor
    }

    /// Render parameters.
    pub fn params(&self) -> &RenderParams {
        &self.params
    }

    /// When the job was initiated.
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Request cancellation (idempotent).
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether cancellation has been requested.
    pub fn cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Clone of the cancel token, for handing to another thread or an event loop.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::descriptor::{Backend, ComputeMode, ExecutionContext, Strategy};

    #[test]
    fn cancel_is_idempotent_and_shared() {
        let job = RenderJob::new(
            JobId(1),
            Strategy::NativeCancellable.descriptor(),
            RenderParams::default(),
        )
        .unwrap();
        let token = job.cancel_token();
        assert!(!job.cancel_requested());
        token.cancel();
        token.cancel();
        job.cancel();
        assert!(job.cancel_requested());
    }

    #[test]
    fn jobs_reject_illegal_descriptors_and_params() {
        let bad = StrategyDescriptor {
            compute_mode: ComputeMode::LineByLine,
            cancellable: true,
            backend: Backend::Gpu,
            execution_context: ExecutionContext::Local,
        };
        assert!(RenderJob::new(JobId(1), bad, RenderParams::default()).is_err());

        let params = RenderParams {
            width: 0,
            ..RenderParams::default()
        };
        assert!(
            RenderJob::new(JobId(1), Strategy::ManagedSingle.descriptor(), params).is_err()
        );
    }
}
