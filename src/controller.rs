//! Benchmark driver: strategy selection, job lifecycle and the stale-delivery filter.
//!
//! Every delivery carries the id of the job that produced it. The controller paints a delivery
//! only while that job is the active one, so superseding a job needs no locking: late rows from
//! the old job are logged and dropped. Superseding a worker job additionally tears its binding
//! down and spawns a fresh one.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::{Duration, Instant};

use crate::foundation::core::{JobId, RenderParams};
use crate::foundation::error::{MandelError, MandelResult};
use crate::gpu;
use crate::kernel::Palette;
use crate::proxy::client::{CrossThreadProxy, ProxyCallbacks};
use crate::proxy::wire::CallId;
use crate::render::frame::{FrameBuffer, FrameRGBA};
use crate::strategy::descriptor::{Backend, ComputeMode, ExecutionContext, Strategy};
use crate::strategy::executor::{RenderCallbacks, Scheduler, StrategyExecutor};
use crate::strategy::job::{CancelToken, RenderJob};

const BIND_TIMEOUT: Duration = Duration::from_secs(10);

/// Whether a job is in flight.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerState {
    /// Nothing running; `start` is accepted.
    Stopped,
    /// A job was started and has not finished, been cancelled or failed.
    Running,
}

/// Surface the controller paints onto.
pub trait Presenter {
    /// Prepare for a new frame of `width` x `height`.
    fn begin(&mut self, width: u32, height: u32) -> MandelResult<()>;

    /// Paint one RGBA row.
    fn paint_row(&mut self, row: u32, bytes: &[u8]) -> MandelResult<()>;

    /// Paint a whole RGBA frame.
    fn paint_frame(&mut self, frame: &[u8]) -> MandelResult<()>;

    /// Blank the surface.
    fn clear(&mut self);
}

/// In-memory RGBA canvas.
#[derive(Clone, Debug, Default)]
pub struct CanvasPresenter {
    canvas: FrameBuffer,
    rows_painted: usize,
    frames_painted: usize,
}

impl CanvasPresenter {
    /// Empty canvas; sized by the first `begin`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current canvas contents.
    pub fn canvas(&self) -> &FrameBuffer {
        &self.canvas
    }

    /// Copy of the canvas as a frame.
    pub fn snapshot(&self) -> FrameRGBA {
        self.canvas.to_frame()
    }

    /// Rows painted since the last `begin` or `clear`.
    pub fn rows_painted(&self) -> usize {
        self.rows_painted
    }

    /// Full frames painted since the last `begin` or `clear`.
    pub fn frames_painted(&self) -> usize {
        self.frames_painted
    }
}

impl Presenter for CanvasPresenter {
    fn begin(&mut self, width: u32, height: u32) -> MandelResult<()> {
        self.canvas.allocate(width, height)?;
        self.rows_painted = 0;
        self.frames_painted = 0;
        Ok(())
    }

    fn paint_row(&mut self, row: u32, bytes: &[u8]) -> MandelResult<()> {
        let dst = self.canvas.row_mut(row)?;
        if dst.len() != bytes.len() {
            return Err(MandelError::validation(format!(
                "row {row} has {} bytes, canvas rows have {}",
                bytes.len(),
                dst.len()
            )));
        }
        dst.copy_from_slice(bytes);
        self.rows_painted += 1;
        Ok(())
    }

    fn paint_frame(&mut self, frame: &[u8]) -> MandelResult<()> {
        let (w, h) = (self.canvas.width(), self.canvas.height());
        if self.canvas.is_empty() || frame.len() != self.canvas.len() {
            return Err(MandelError::validation(format!(
                "frame has {} bytes, canvas is {w}x{h}",
                frame.len()
            )));
        }
        for (row, src) in (0..h).zip(frame.chunks_exact(w as usize * 4)) {
            self.canvas.row_mut(row)?.copy_from_slice(src);
        }
        self.frames_painted += 1;
        Ok(())
    }

    fn clear(&mut self) {
        let (w, h) = (self.canvas.width(), self.canvas.height());
        if self.canvas.allocate(w, h).is_err() {
            self.canvas = FrameBuffer::default();
        }
        self.rows_painted = 0;
        self.frames_painted = 0;
    }
}

/// Progress report delivered to the controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// One row.
    Row {
        /// Producing job.
        job: JobId,
        /// Job start time.
        started_at: Instant,
        /// Row index.
        row: u32,
        /// RGBA bytes of the row.
        bytes: Vec<u8>,
    },
    /// Whole frame of a single-pass run.
    FullImage {
        /// Producing job.
        job: JobId,
        /// Job start time.
        started_at: Instant,
        /// RGBA bytes of the frame.
        frame: Vec<u8>,
    },
    /// Normal completion.
    Finish {
        /// Producing job.
        job: JobId,
    },
    /// Observed cancellation.
    Cancel {
        /// Producing job.
        job: JobId,
    },
}

impl Delivery {
    /// Job the delivery belongs to.
    pub fn job(&self) -> JobId {
        match self {
            Delivery::Row { job, .. }
            | Delivery::FullImage { job, .. }
            | Delivery::Finish { job }
            | Delivery::Cancel { job } => *job,
        }
    }
}

#[derive(Debug)]
enum Command {
    Cancel,
}

/// Cloneable, `Send` handle for asking a controller to act from elsewhere.
///
/// Commands are queued and applied when the controller's event loop next runs: at every yield of
/// a local cancellable row loop, or on [`BenchmarkController::pump`].
#[derive(Clone, Debug)]
pub struct ControllerHandle {
    commands: Sender<Command>,
}

impl ControllerHandle {
    /// Queue a cancel of whatever job is active when the command is applied.
    pub fn cancel(&self) {
        if self.commands.send(Command::Cancel).is_err() {
            tracing::debug!("controller gone, cancel dropped");
        }
    }
}

/// Bookkeeping touched by deliveries.
#[derive(Debug)]
struct Session<P> {
    presenter: P,
    state: ControllerState,
    active: Option<JobId>,
    active_strategy: Option<Strategy>,
    height: u32,
    progress: Option<u32>,
    last_elapsed: Option<Duration>,
    elapsed: BTreeMap<Strategy, Duration>,
}

impl<P: Presenter> Session<P> {
    fn is_current(&self, job: JobId, what: &str) -> bool {
        if self.active == Some(job) {
            return true;
        }
        tracing::warn!(%job, active = ?self.active, what, "stale delivery ignored");
        false
    }

    fn record_elapsed(&mut self, started_at: Instant) {
        let elapsed = started_at.elapsed();
        self.last_elapsed = Some(elapsed);
        if let Some(s) = self.active_strategy {
            self.elapsed.insert(s, elapsed);
        }
    }

    fn row(&mut self, job: JobId, started_at: Instant, row: u32, bytes: &[u8]) -> bool {
        if !self.is_current(job, "row") {
            return false;
        }
        self.record_elapsed(started_at);
        self.progress = Some(row);
        if let Err(e) = self.presenter.paint_row(row, bytes) {
            tracing::warn!(%job, row, error = %e, "row paint failed");
        }
        true
    }

    fn full_image(&mut self, job: JobId, started_at: Instant, frame: &[u8]) -> bool {
        if !self.is_current(job, "full_image") {
            return false;
        }
        self.record_elapsed(started_at);
        self.progress = self.height.checked_sub(1);
        if let Err(e) = self.presenter.paint_frame(frame) {
            tracing::warn!(%job, error = %e, "frame paint failed");
        }
        true
    }

    fn settle(&mut self, job: JobId, what: &str) -> bool {
        if !self.is_current(job, what) {
            return false;
        }
        tracing::debug!(%job, what, "job settled");
        self.state = ControllerState::Stopped;
        true
    }

    fn accept(&mut self, delivery: Delivery) -> bool {
        match delivery {
            Delivery::Row {
                job,
                started_at,
                row,
                bytes,
            } => self.row(job, started_at, row, &bytes),
            Delivery::FullImage {
                job,
                started_at,
                frame,
            } => self.full_image(job, started_at, &frame),
            Delivery::Finish { job } => self.settle(job, "finish"),
            Delivery::Cancel { job } => self.settle(job, "cancel"),
        }
    }
}

impl<P: Presenter> RenderCallbacks for Session<P> {
    fn on_row(
        &mut self,
        job: JobId,
        started_at: Instant,
        row: u32,
        bytes: Cow<'_, [u8]>,
    ) -> MandelResult<()> {
        self.row(job, started_at, row, &bytes);
        Ok(())
    }

    fn on_full_image(
        &mut self,
        job: JobId,
        started_at: Instant,
        frame: Cow<'_, [u8]>,
    ) -> MandelResult<()> {
        self.full_image(job, started_at, &frame);
        Ok(())
    }

    fn on_finish(&mut self, job: JobId) -> MandelResult<()> {
        self.settle(job, "finish");
        Ok(())
    }

    fn on_cancel(&mut self, job: JobId) -> MandelResult<()> {
        self.settle(job, "cancel");
        Ok(())
    }
}

/// Event loop seen by a local cancellable row loop: queued commands run at each yield.
struct EventLoop<'a> {
    commands: &'a Receiver<Command>,
    job: CancelToken,
}

impl Scheduler for EventLoop<'_> {
    fn yield_now(&mut self) {
        while let Ok(cmd) = self.commands.try_recv() {
            match cmd {
                Command::Cancel => self.job.cancel(),
            }
        }
        std::thread::yield_now();
    }
}

/// Drives one strategy at a time and feeds its deliveries to a [`Presenter`].
pub struct BenchmarkController<P: Presenter = CanvasPresenter> {
    strategy: Strategy,
    params: RenderParams,
    palette: Option<Palette>,
    last_job: JobId,
    executor: StrategyExecutor,
    proxy: Option<CrossThreadProxy>,
    in_flight: Option<(CallId, JobId)>,
    local_cancel: Option<CancelToken>,
    session: Session<P>,
    deliveries_tx: Sender<Delivery>,
    deliveries: Receiver<Delivery>,
    commands_tx: Sender<Command>,
    commands: Receiver<Command>,
}

impl<P: Presenter + std::fmt::Debug> std::fmt::Debug for BenchmarkController<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BenchmarkController")
            .field("strategy", &self.strategy)
            .field("params", &self.params)
            .field("last_job", &self.last_job)
            .field("session", &self.session)
            .field("proxy", &self.proxy)
            .finish_non_exhaustive()
    }
}

impl BenchmarkController<CanvasPresenter> {
    /// Controller painting onto an in-memory canvas.
    pub fn new() -> Self {
        Self::with_presenter(CanvasPresenter::new())
    }
}

impl Default for BenchmarkController<CanvasPresenter> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Presenter> BenchmarkController<P> {
    /// Controller painting onto `presenter`. Starts with the first strategy and default params.
    pub fn with_presenter(presenter: P) -> Self {
        let (deliveries_tx, deliveries) = mpsc::channel();
        let (commands_tx, commands) = mpsc::channel();
        Self {
            strategy: Strategy::ManagedSingle,
            params: RenderParams::default(),
            palette: None,
            last_job: JobId(0),
            executor: StrategyExecutor::new(),
            proxy: None,
            in_flight: None,
            local_cancel: None,
            session: Session {
                presenter,
                state: ControllerState::Stopped,
                active: None,
                active_strategy: None,
                height: 0,
                progress: None,
                last_elapsed: None,
                elapsed: BTreeMap::new(),
            },
            deliveries_tx,
            deliveries,
            commands_tx,
            commands,
        }
    }

    /// Force one palette for every CPU backend, local or behind a worker.
    pub fn with_palette(mut self, palette: Palette) -> Self {
        self.palette = Some(palette);
        self.executor = StrategyExecutor::new().with_palette(palette);
        self
    }

    /// Handle for queueing commands from callbacks or other threads.
    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle {
            commands: self.commands_tx.clone(),
        }
    }

    /// Selected strategy.
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Current render parameters.
    pub fn params(&self) -> &RenderParams {
        &self.params
    }

    /// Running or stopped.
    pub fn state(&self) -> ControllerState {
        self.session.state
    }

    /// Job whose deliveries are currently accepted.
    pub fn active_job(&self) -> Option<JobId> {
        self.session.active
    }

    /// Index of the last painted row (`height - 1` after a full frame).
    pub fn progress(&self) -> Option<u32> {
        self.session.progress
    }

    /// Time from job start to the latest accepted delivery.
    pub fn elapsed(&self) -> Option<Duration> {
        self.session.last_elapsed
    }

    /// Latest elapsed time per strategy.
    pub fn elapsed_map(&self) -> &BTreeMap<Strategy, Duration> {
        &self.session.elapsed
    }

    /// Borrow the presenter.
    pub fn presenter(&self) -> &P {
        &self.session.presenter
    }

    /// Mutably borrow the presenter.
    pub fn presenter_mut(&mut self) -> &mut P {
        &mut self.session.presenter
    }

    fn ensure_stopped(&self, what: &str) -> MandelResult<()> {
        if self.session.state == ControllerState::Running {
            return Err(MandelError::configuration(format!(
                "cannot {what} while a job is running"
            )));
        }
        Ok(())
    }

    /// Choose the strategy for the next `start`.
    ///
    /// GPU strategies are rejected up front when no adapter can be acquired.
    pub fn select_strategy(&mut self, strategy: Strategy) -> MandelResult<()> {
        self.ensure_stopped("change strategy")?;
        let descriptor = strategy.descriptor();
        descriptor.validate()?;
        if descriptor.backend == Backend::Gpu && !gpu::is_available() {
            return Err(MandelError::configuration(format!(
                "strategy '{strategy}' needs a gpu adapter and none is available"
            )));
        }
        tracing::debug!(%strategy, "strategy selected");
        self.strategy = strategy;
        Ok(())
    }

    /// Set the parameters for the next `start`.
    pub fn set_params(&mut self, params: RenderParams) -> MandelResult<()> {
        self.ensure_stopped("change parameters")?;
        params.validate()?;
        self.params = params;
        Ok(())
    }

    /// Convenience for changing only the iteration cap.
    pub fn set_max_iterations(&mut self, max_iterations: u32) -> MandelResult<()> {
        self.set_params(RenderParams {
            max_iterations,
            ..self.params
        })
    }

    /// Start a job with the selected strategy and params, superseding any job in flight.
    ///
    /// Local strategies run to completion (or cancellation) before this returns. Worker
    /// strategies return immediately; their deliveries arrive through
    /// [`BenchmarkController::pump`].
    #[tracing::instrument(skip(self), fields(strategy = %self.strategy))]
    pub fn start(&mut self) -> MandelResult<JobId> {
        if self.session.state == ControllerState::Running {
            self.cancel()?;
        }

        let id = self.last_job.next();
        let job = RenderJob::new(id, self.strategy.descriptor(), self.params)?;
        if job.descriptor().execution_context == ExecutionContext::Local {
            self.executor.prepare(&job)?;
        }
        self.session.presenter.begin(self.params.width, self.params.height)?;

        let before = (
            self.last_job,
            self.session.active,
            self.session.active_strategy,
            self.session.height,
            self.session.progress,
        );
        self.last_job = id;
        self.session.active = Some(id);
        self.session.active_strategy = Some(self.strategy);
        self.session.height = self.params.height;
        self.session.progress = None;
        self.session.state = ControllerState::Running;

        let res = match job.descriptor().execution_context {
            ExecutionContext::Local => self.run_local(&job),
            ExecutionContext::CrossThread => self.post_remote(&job),
        };
        if let Err(e) = res {
            tracing::error!(job = %id, error = %e, "start failed");
            (
                self.last_job,
                self.session.active,
                self.session.active_strategy,
                self.session.height,
                self.session.progress,
            ) = before;
            self.session.state = ControllerState::Stopped;
            return Err(e);
        }
        Ok(id)
    }

    fn run_local(&mut self, job: &RenderJob) -> MandelResult<()> {
        self.local_cancel = Some(job.cancel_token());
        let mut event_loop = EventLoop {
            commands: &self.commands,
            job: job.cancel_token(),
        };
        let res = self
            .executor
            .execute(job, &mut self.session, &mut event_loop);
        self.local_cancel = None;
        res.map(|_| ())
    }

    /// Fresh worker binding whose executor carries this controller's palette.
    fn bind(&self) -> MandelResult<CrossThreadProxy> {
        let mut proxy = CrossThreadProxy::spawn()?;
        if self.palette.is_some() {
            proxy.construct(self.palette, BIND_TIMEOUT)?;
        }
        Ok(proxy)
    }

    fn proxy(&mut self) -> MandelResult<&mut CrossThreadProxy> {
        if self.proxy.is_none() {
            self.proxy = Some(self.bind()?);
        }
        self.proxy
            .as_mut()
            .ok_or_else(|| MandelError::transport("worker binding unavailable"))
    }

    fn post_remote(&mut self, job: &RenderJob) -> MandelResult<()> {
        let tx = self.deliveries_tx.clone();
        let row_tx = tx.clone();
        let full_tx = tx.clone();
        let cancel_tx = tx.clone();
        let callbacks = ProxyCallbacks::new()
            .on_row(move |job, started_at, row, bytes| {
                let _ = row_tx.send(Delivery::Row {
                    job,
                    started_at,
                    row,
                    bytes,
                });
            })
            .on_full_image(move |job, started_at, frame| {
                let _ = full_tx.send(Delivery::FullImage {
                    job,
                    started_at,
                    frame,
                });
            })
            .on_finish(move |job| {
                let _ = tx.send(Delivery::Finish { job });
            })
            .on_cancel(move |job| {
                let _ = cancel_tx.send(Delivery::Cancel { job });
            });

        let mode = job.descriptor().compute_mode;
        // A superseded call may still be unresolved when its last delivery has been painted.
        let previous = self.in_flight.take();
        let proxy = self.proxy()?;
        if let Some((old, old_job)) = previous
            && let Some(Err(e)) = proxy.forget(old)
        {
            tracing::warn!(job = %old_job, error = %e, "superseded worker job had failed");
        }
        let call = match mode {
            ComputeMode::Single => proxy.run_single(job, callbacks)?,
            ComputeMode::LineByLine => proxy.run_line_by_line(job, callbacks)?,
        };
        self.in_flight = Some((call, job.id()));
        Ok(())
    }

    /// Cancel the active job. A no-op when nothing is running.
    ///
    /// Local cancellable loops stop at their next row check. Worker jobs get a fire-and-forget
    /// cancel and their binding is torn down and recreated, so nothing more arrives from them.
    /// Non-cancellable local runs have already finished by the time this can be called.
    pub fn cancel(&mut self) -> MandelResult<()> {
        if self.session.state != ControllerState::Running {
            tracing::debug!("cancel with no running job");
            return Ok(());
        }
        let descriptor = self.strategy.descriptor();
        if descriptor.execution_context == ExecutionContext::CrossThread {
            self.rebind()?;
        } else if let Some(token) = &self.local_cancel {
            token.cancel();
        }
        tracing::debug!(job = ?self.session.active, "job cancelled");
        // Anything still in flight for the cancelled job is stale from here on.
        self.session.active = None;
        self.session.state = ControllerState::Stopped;
        Ok(())
    }

    fn rebind(&mut self) -> MandelResult<()> {
        if let Some(mut old) = self.proxy.take() {
            if let Err(e) = old.cancel() {
                tracing::warn!(error = %e, "cancel could not be posted to the worker");
            }
            old.release()?;
        }
        self.in_flight = None;
        self.proxy = Some(self.bind()?);
        Ok(())
    }

    /// Stop any running job and blank the presenter.
    pub fn reset(&mut self) -> MandelResult<()> {
        self.cancel()?;
        self.session.presenter.clear();
        self.session.progress = None;
        self.session.last_elapsed = None;
        Ok(())
    }

    /// Apply one delivery through the stale-job filter. Returns `false` when it was ignored.
    pub fn accept(&mut self, delivery: Delivery) -> bool {
        self.session.accept(delivery)
    }

    fn apply_commands(&mut self) -> MandelResult<()> {
        while let Ok(cmd) = self.commands.try_recv() {
            match cmd {
                Command::Cancel => self.cancel()?,
            }
        }
        Ok(())
    }

    fn check_in_flight(&mut self) -> MandelResult<()> {
        let (Some((call, job)), Some(proxy)) = (self.in_flight, self.proxy.as_mut()) else {
            return Ok(());
        };
        let Some(res) = proxy.take_settled(call) else {
            return Ok(());
        };
        self.in_flight = None;
        match res {
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::error!(%job, error = %e, "worker job failed");
                if self.session.active == Some(job) {
                    self.session.state = ControllerState::Stopped;
                }
                Err(e)
            }
        }
    }

    /// Run the event loop once: apply queued commands, process worker messages (waiting up to
    /// `timeout` for the first) and apply deliveries. Returns how many deliveries were painted.
    pub fn pump(&mut self, timeout: Duration) -> MandelResult<usize> {
        self.apply_commands()?;
        if let Some(proxy) = self.proxy.as_mut() {
            if self.in_flight.is_some() {
                proxy.pump(timeout)?;
            }
            proxy.drain()?;
        }
        let mut applied = 0;
        while let Ok(delivery) = self.deliveries.try_recv() {
            if self.session.accept(delivery) {
                applied += 1;
            }
        }
        self.check_in_flight()?;
        Ok(applied)
    }

    /// Pump until the controller is stopped and the worker has resolved its last call.
    pub fn wait_idle(&mut self, timeout: Duration) -> MandelResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            self.apply_commands()?;
            if self.session.state == ControllerState::Stopped && self.in_flight.is_none() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(MandelError::execution(format!(
                    "job still running after {timeout:?}"
                )));
            }
            self.pump((deadline - now).min(Duration::from_millis(50)))?;
        }
    }
}
