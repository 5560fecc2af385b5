use std::borrow::Cow;
use std::time::Instant;

use crate::foundation::core::JobId;
use crate::foundation::error::{MandelError, MandelResult};
use crate::gpu::GpuKernelAdapter;
use crate::kernel::{KernelContext, Palette};
use crate::render::frame::FrameBuffer;
use crate::strategy::descriptor::{Backend, ComputeMode, ExecutionContext};
use crate::strategy::job::RenderJob;

/// Receiver of a job's progress.
///
/// Contract, per job:
/// - `on_row` fires for rows in strictly increasing order, at most once each.
/// - `on_full_image` fires at most once, and only for single-pass runs.
/// - exactly one of `on_finish` / `on_cancel` fires when the job ends normally; neither fires when
///   the run returns an error.
///
/// Byte regions arrive as [`Cow`]: `Borrowed` when the executor shares its own frame by reference,
/// `Owned` when ownership of a freshly extracted region is handed to the receiver.
pub trait RenderCallbacks {
    /// One computed row.
    fn on_row(
        &mut self,
        job: JobId,
        started_at: Instant,
        row: u32,
        bytes: Cow<'_, [u8]>,
    ) -> MandelResult<()>;

    /// The whole frame of a single-pass run.
    fn on_full_image(
        &mut self,
        job: JobId,
        started_at: Instant,
        frame: Cow<'_, [u8]>,
    ) -> MandelResult<()>;

    /// Normal completion.
    fn on_finish(&mut self, job: JobId) -> MandelResult<()>;

    /// The row loop observed a cancel request and stopped.
    fn on_cancel(&mut self, job: JobId) -> MandelResult<()>;
}

/// Voluntary suspension point of a local cancellable row loop.
///
/// This is the only place where a canceller sharing the executor's thread of control gets to run.
pub trait Scheduler {
    /// Give pending work a chance to run before the next row.
    fn yield_now(&mut self);
}

/// [`Scheduler`] that yields the OS thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadYield;

impl Scheduler for ThreadYield {
    fn yield_now(&mut self) {
        std::thread::yield_now();
    }
}

/// Lifecycle of the executor's most recent job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutorState {
    /// No job has run yet.
    Idle,
    /// A job is in progress.
    Running,
    /// The last job produced every row (or the full frame) and fired `on_finish`.
    Completed,
    /// The last job observed a cancel request and fired `on_cancel`.
    Cancelled,
    /// The last job returned an error.
    Failed,
}

/// Terminal outcome of a job that did not fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    /// All output was delivered and `on_finish` fired.
    Completed,
    /// `on_cancel` fired; no further rows were produced.
    Cancelled,
}

/// Drives a kernel (or the GPU adapter) through a frame buffer for one job at a time.
#[derive(Debug)]
pub struct StrategyExecutor {
    state: ExecutorState,
    current: Option<JobId>,
    palette: Option<Palette>,
    kernel: Option<KernelContext>,
    gpu: GpuKernelAdapter,
}

impl Default for StrategyExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl StrategyExecutor {
    /// Idle executor using each backend's default palette.
    pub fn new() -> Self {
        Self {
            state: ExecutorState::Idle,
            current: None,
            palette: None,
            kernel: None,
            gpu: GpuKernelAdapter::new(),
        }
    }

    /// Force one palette for every CPU backend.
    pub fn with_palette(mut self, palette: Palette) -> Self {
        self.palette = Some(palette);
        self
    }

    /// State after the most recent transition.
    pub fn state(&self) -> ExecutorState {
        self.state
    }

    /// Most recently started job.
    pub fn current_job(&self) -> Option<JobId> {
        self.current
    }

    /// Frame of the most recent CPU job, if any.
    pub fn last_frame(&self) -> Option<&FrameBuffer> {
        self.kernel.as_ref().map(KernelContext::frame)
    }

    /// Acquire whatever `job` needs before it can produce output.
    ///
    /// Only the GPU backend has a fallible setup step; running it here lets callers reject a job
    /// before touching any presentation state. The later run reuses the configured adapter.
    pub fn prepare(&mut self, job: &RenderJob) -> MandelResult<()> {
        if job.descriptor().backend == Backend::Gpu {
            let params = job.params();
            self.gpu.configure(params.width, params.height)?;
        }
        Ok(())
    }

    /// Run `job` with the compute mode its descriptor selects.
    #[tracing::instrument(skip_all, fields(job = %job.id(), mode = ?job.descriptor().compute_mode))]
    pub fn execute(
        &mut self,
        job: &RenderJob,
        callbacks: &mut dyn RenderCallbacks,
        scheduler: &mut dyn Scheduler,
    ) -> MandelResult<JobOutcome> {
        match job.descriptor().compute_mode {
            ComputeMode::Single => self.run_single(job, callbacks),
            ComputeMode::LineByLine => self.run_line_by_line(job, callbacks, scheduler),
        }
    }

    /// Compute the whole frame, then deliver it and finish. Single-pass runs are not interruptible.
    pub fn run_single(
        &mut self,
        job: &RenderJob,
        callbacks: &mut dyn RenderCallbacks,
    ) -> MandelResult<JobOutcome> {
        self.begin(job);
        let res = self.single_pass(job, callbacks);
        self.settle(job, res)
    }

    /// Compute and deliver one row at a time, polling for cancellation when the descriptor asks.
    pub fn run_line_by_line(
        &mut self,
        job: &RenderJob,
        callbacks: &mut dyn RenderCallbacks,
        scheduler: &mut dyn Scheduler,
    ) -> MandelResult<JobOutcome> {
        self.begin(job);
        let res = self.line_by_line(job, callbacks, scheduler);
        self.settle(job, res)
    }

    fn begin(&mut self, job: &RenderJob) {
        tracing::debug!(job = %job.id(), descriptor = ?job.descriptor(), "job started");
        self.current = Some(job.id());
        self.state = ExecutorState::Running;
    }

    fn settle(
        &mut self,
        job: &RenderJob,
        res: MandelResult<JobOutcome>,
    ) -> MandelResult<JobOutcome> {
        self.state = match &res {
            Ok(JobOutcome::Completed) => ExecutorState::Completed,
            Ok(JobOutcome::Cancelled) => ExecutorState::Cancelled,
            Err(e) => {
                tracing::error!(job = %job.id(), error = %e, "job failed");
                ExecutorState::Failed
            }
        };
        tracing::debug!(
            job = %job.id(),
            state = ?self.state,
            elapsed_ms = job.started_at().elapsed().as_secs_f64() * 1000.0,
            "job settled"
        );
        res
    }

    fn kernel_for_job(&mut self, job: &RenderJob) -> MandelResult<&mut KernelContext> {
        let mut ctx = KernelContext::new(job.descriptor().backend)?;
        if let Some(p) = self.palette {
            ctx = ctx.with_palette(p);
        }
        ctx.init_canvas(*job.params())?;
        Ok(self.kernel.insert(ctx))
    }

    fn single_pass(
        &mut self,
        job: &RenderJob,
        callbacks: &mut dyn RenderCallbacks,
    ) -> MandelResult<JobOutcome> {
        let params = *job.params();
        match job.descriptor().backend {
            Backend::Managed | Backend::Native => {
                let frame = self.kernel_for_job(job)?.calculate()?;
                callbacks.on_full_image(job.id(), job.started_at(), Cow::Borrowed(frame))?;
            }
            Backend::Gpu => {
                self.gpu.configure(params.width, params.height)?;
                let frame = self.gpu.submit(params.max_iterations, params.viewport)?;
                callbacks.on_full_image(job.id(), job.started_at(), Cow::Owned(frame))?;
            }
        }
        callbacks.on_finish(job.id())?;
        Ok(JobOutcome::Completed)
    }

    fn line_by_line(
        &mut self,
        job: &RenderJob,
        callbacks: &mut dyn RenderCallbacks,
        scheduler: &mut dyn Scheduler,
    ) -> MandelResult<JobOutcome> {
        let descriptor = *job.descriptor();
        if descriptor.backend == Backend::Gpu {
            return Err(MandelError::validation(
                "gpu backend does not support line-by-line rendering",
            ));
        }
        let height = job.params().height;
        let ctx = self.kernel_for_job(job)?;

        for row in 0..height {
            if descriptor.cancellable && job.cancel_requested() {
                tracing::debug!(job = %job.id(), row, "cancel observed");
                callbacks.on_cancel(job.id())?;
                return Ok(JobOutcome::Cancelled);
            }

            let bytes = ctx.calculate_row(row)?;
            let bytes = match descriptor.execution_context {
                ExecutionContext::Local => Cow::Borrowed(bytes),
                // The row is handed off and never needed again on this side.
                ExecutionContext::CrossThread => Cow::Owned(bytes.to_vec()),
            };
            callbacks.on_row(job.id(), job.started_at(), row, bytes)?;

            if descriptor.yields_per_row() {
                scheduler.yield_now();
            }
        }

        callbacks.on_finish(job.id())?;
        Ok(JobOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::core::{RenderParams, Viewport};
    use crate::strategy::descriptor::Strategy;

    #[derive(Debug, PartialEq)]
    enum Event {
        Row(u32, bool),
        Full(usize),
        Finish,
        Cancel,
    }

    #[derive(Default)]
    struct Recorder {
        events: Vec<Event>,
    }

    impl RenderCallbacks for Recorder {
        fn on_row(
            &mut self,
            _job: JobId,
            _started_at: Instant,
            row: u32,
            bytes: Cow<'_, [u8]>,
        ) -> MandelResult<()> {
            self.events
                .push(Event::Row(row, matches!(bytes, Cow::Borrowed(_))));
            Ok(())
        }

        fn on_full_image(
            &mut self,
            _job: JobId,
            _started_at: Instant,
            frame: Cow<'_, [u8]>,
        ) -> MandelResult<()> {
            self.events.push(Event::Full(frame.len()));
            Ok(())
        }

        fn on_finish(&mut self, _job: JobId) -> MandelResult<()> {
            self.events.push(Event::Finish);
            Ok(())
        }

        fn on_cancel(&mut self, _job: JobId) -> MandelResult<()> {
            self.events.push(Event::Cancel);
            Ok(())
        }
    }

    struct CountingYield(usize);

    impl Scheduler for CountingYield {
        fn yield_now(&mut self) {
            self.0 += 1;
        }
    }

    fn params() -> RenderParams {
        RenderParams::new(8, 4, 16, Viewport::default()).unwrap()
    }

    fn job(strategy: Strategy) -> RenderJob {
        RenderJob::new(JobId(1), strategy.descriptor(), params()).unwrap()
    }

    #[test]
    fn single_pass_delivers_frame_then_finish() {
        let mut ex = StrategyExecutor::new();
        let mut rec = Recorder::default();
        let out = ex
            .execute(&job(Strategy::ManagedSingle), &mut rec, &mut ThreadYield)
            .unwrap();
        assert_eq!(out, JobOutcome::Completed);
        assert_eq!(rec.events, vec![Event::Full(128), Event::Finish]);
        assert_eq!(ex.state(), ExecutorState::Completed);
        assert_eq!(ex.current_job(), Some(JobId(1)));
    }

    #[test]
    fn local_rows_are_borrowed_and_ordered() {
        let mut ex = StrategyExecutor::new();
        let mut rec = Recorder::default();
        ex.execute(&job(Strategy::NativeLineByLine), &mut rec, &mut ThreadYield)
            .unwrap();
        assert_eq!(
            rec.events,
            vec![
                Event::Row(0, true),
                Event::Row(1, true),
                Event::Row(2, true),
                Event::Row(3, true),
                Event::Finish
            ]
        );
    }

    #[test]
    fn worker_rows_are_owned() {
        let mut ex = StrategyExecutor::new();
        let mut rec = Recorder::default();
        ex.execute(&job(Strategy::ManagedWorker), &mut rec, &mut ThreadYield)
            .unwrap();
        assert!(matches!(rec.events[0], Event::Row(0, false)));
        assert_eq!(rec.events.last(), Some(&Event::Finish));
    }

    #[test]
    fn only_local_cancellable_loops_yield() {
        for (strategy, expected) in [
            (Strategy::NativeCancellable, 4),
            (Strategy::NativeLineByLine, 0),
            (Strategy::NativeWorker, 0),
        ] {
            let mut ex = StrategyExecutor::new();
            let mut sched = CountingYield(0);
            ex.execute(&job(strategy), &mut Recorder::default(), &mut sched)
                .unwrap();
            assert_eq!(sched.0, expected, "{strategy}");
        }
    }

    #[test]
    fn pre_cancelled_job_emits_cancel_only() {
        let j = job(Strategy::ManagedCancellable);
        j.cancel();
        let mut ex = StrategyExecutor::new();
        let mut rec = Recorder::default();
        let out = ex.execute(&j, &mut rec, &mut ThreadYield).unwrap();
        assert_eq!(out, JobOutcome::Cancelled);
        assert_eq!(rec.events, vec![Event::Cancel]);
        assert_eq!(ex.state(), ExecutorState::Cancelled);
    }

    #[test]
    fn non_cancellable_loop_ignores_cancel_requests() {
        let j = job(Strategy::ManagedLineByLine);
        j.cancel();
        let mut ex = StrategyExecutor::new();
        let mut rec = Recorder::default();
        assert_eq!(
            ex.execute(&j, &mut rec, &mut ThreadYield).unwrap(),
            JobOutcome::Completed
        );
        assert_eq!(rec.events.len(), 5);
    }

    #[test]
    fn gpu_line_by_line_is_a_contract_violation() {
        let j = RenderJob::new(JobId(1), Strategy::GpuSingle.descriptor(), params()).unwrap();
        let mut ex = StrategyExecutor::new();
        let err = ex
            .run_line_by_line(&j, &mut Recorder::default(), &mut ThreadYield)
            .unwrap_err();
        assert!(err.to_string().contains("validation error"));
        assert_eq!(ex.state(), ExecutorState::Failed);
    }
}
