//! Remote side of a proxy binding.
//!
//! Two threads per binding. The port thread owns the request channel: it checks origins, decodes
//! requests into [`ServiceCall`]s, answers property reads and writes itself and forwards runs to
//! the compute thread. Keeping the port free while a job computes is what lets a fire-and-forget
//! cancel reach the running loop's flag.

use std::borrow::Cow;
use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Instant;

use crate::foundation::core::{JobId, RenderParams};
use crate::foundation::error::{MandelError, MandelResult};
use crate::kernel::Palette;
use crate::proxy::handles::RemoteHandle;
use crate::proxy::wire::{
    CallId, EndpointId, Envelope, HandleToken, Message, Request, RequestKind, Response, WireValue,
};
use crate::strategy::descriptor::{ComputeMode, StrategyDescriptor};
use crate::strategy::executor::{RenderCallbacks, StrategyExecutor, ThreadYield};
use crate::strategy::job::{CancelToken, RenderJob};

pub(crate) const RUN_SINGLE: &str = "run_single";
pub(crate) const RUN_LINE_BY_LINE: &str = "run_line_by_line";
pub(crate) const CANCEL: &str = "cancel";
pub(crate) const CANCELLED: &str = "cancelled";

#[derive(Debug)]
struct JobArgs {
    job: JobId,
    started_at: Instant,
    descriptor: StrategyDescriptor,
    params: RenderParams,
}

#[derive(Debug)]
struct RunHandles {
    on_row: Option<HandleToken>,
    on_full_image: Option<HandleToken>,
    on_finish: HandleToken,
    on_cancel: Option<HandleToken>,
}

/// Statically enumerated remote operations.
#[derive(Debug)]
enum ServiceCall {
    Run {
        id: CallId,
        mode: ComputeMode,
        args: JobArgs,
        handles: RunHandles,
    },
    Cancel {
        id: Option<CallId>,
    },
    GetCancelled {
        id: CallId,
    },
    SetCancelled {
        id: CallId,
        value: bool,
    },
    Construct {
        id: CallId,
        palette: Option<Palette>,
    },
    Endpoint {
        id: CallId,
    },
    Release {
        id: CallId,
    },
}

fn next_arg(
    args: &mut std::vec::IntoIter<WireValue>,
    what: &str,
) -> MandelResult<WireValue> {
    args.next()
        .ok_or_else(|| MandelError::transport(format!("missing argument `{what}`")))
}

fn decode_job_args(args: &mut std::vec::IntoIter<WireValue>) -> MandelResult<JobArgs> {
    Ok(JobArgs {
        job: JobId(next_arg(args, "job")?.as_u64()?),
        started_at: next_arg(args, "started_at")?.as_instant()?,
        descriptor: next_arg(args, "descriptor")?.into_record()?,
        params: next_arg(args, "params")?.into_record()?,
    })
}

fn required_id(req: &Request) -> MandelResult<CallId> {
    req.id.ok_or_else(|| {
        MandelError::transport(format!(
            "{:?} {} needs a correlation id",
            req.kind,
            req.path_str()
        ))
    })
}

impl TryFrom<Request> for ServiceCall {
    type Error = MandelError;

    fn try_from(req: Request) -> MandelResult<Self> {
        let path: Vec<&str> = req.path.iter().map(String::as_str).collect();
        let call = match (req.kind, path.as_slice()) {
            (RequestKind::Apply, [CANCEL]) => ServiceCall::Cancel { id: req.id },
            (RequestKind::Apply, [RUN_SINGLE]) => {
                let id = required_id(&req)?;
                let mut args = req.args.into_iter();
                let job = decode_job_args(&mut args)?;
                let handles = RunHandles {
                    on_row: None,
                    on_full_image: Some(next_arg(&mut args, "on_full_image")?.as_handler()?),
                    on_finish: next_arg(&mut args, "on_finish")?.as_handler()?,
                    on_cancel: None,
                };
                ServiceCall::Run {
                    id,
                    mode: ComputeMode::Single,
                    args: job,
                    handles,
                }
            }
            (RequestKind::Apply, [RUN_LINE_BY_LINE]) => {
                let id = required_id(&req)?;
                let mut args = req.args.into_iter();
                let job = decode_job_args(&mut args)?;
                let handles = RunHandles {
                    on_row: Some(next_arg(&mut args, "on_row")?.as_handler()?),
                    on_full_image: None,
                    on_finish: next_arg(&mut args, "on_finish")?.as_handler()?,
                    on_cancel: Some(next_arg(&mut args, "on_cancel")?.as_handler()?),
                };
                ServiceCall::Run {
                    id,
                    mode: ComputeMode::LineByLine,
                    args: job,
                    handles,
                }
            }
            (RequestKind::Get, [CANCELLED]) => ServiceCall::GetCancelled {
                id: required_id(&req)?,
            },
            (RequestKind::Set, [CANCELLED]) => {
                let id = required_id(&req)?;
                let value = req
                    .value
                    .as_ref()
                    .ok_or_else(|| MandelError::transport("SET cancelled without a value"))?
                    .as_bool()?;
                ServiceCall::SetCancelled { id, value }
            }
            (RequestKind::Construct, []) => {
                let id = required_id(&req)?;
                // An absent argument means each backend keeps its own palette.
                let palette = match req.args.into_iter().next() {
                    Some(v) => v.into_record()?,
                    None => None,
                };
                ServiceCall::Construct { id, palette }
            }
            (RequestKind::Endpoint, []) => ServiceCall::Endpoint {
                id: required_id(&req)?,
            },
            (RequestKind::Release, []) => ServiceCall::Release {
                id: required_id(&req)?,
            },
            (kind, _) => {
                return Err(MandelError::transport(format!(
                    "unknown remote operation {kind:?} `{}`",
                    req.path_str()
                )));
            }
        };
        Ok(call)
    }
}

fn respond(
    replies: &Sender<Envelope>,
    origin: EndpointId,
    id: CallId,
    result: MandelResult<WireValue>,
) {
    let env = Envelope {
        origin,
        message: Message::Response(Response {
            id,
            result: result.map_err(|e| e.to_string()),
        }),
    };
    if replies.send(env).is_err() {
        tracing::debug!(call = id.0, "caller endpoint closed, response dropped");
    }
}

enum ComputeTask {
    Construct {
        id: CallId,
        palette: Option<Palette>,
    },
    Run {
        id: CallId,
        mode: ComputeMode,
        job: RenderJob,
        callbacks: RemoteCallbacks,
    },
}

/// [`RenderCallbacks`] that post invocations back through the binding.
///
/// Rows the executor hands over by ownership travel as transfers; borrowed regions are copied.
struct RemoteCallbacks {
    on_row: Option<RemoteHandle>,
    on_full_image: Option<RemoteHandle>,
    on_finish: RemoteHandle,
    on_cancel: Option<RemoteHandle>,
}

fn region(bytes: Cow<'_, [u8]>) -> WireValue {
    match bytes {
        Cow::Owned(v) => WireValue::transfer(v),
        Cow::Borrowed(b) => WireValue::copy_of(b),
    }
}

fn bound<'a>(handle: &'a Option<RemoteHandle>, what: &str) -> MandelResult<&'a RemoteHandle> {
    handle
        .as_ref()
        .ok_or_else(|| MandelError::transport(format!("no `{what}` handle bound for this call")))
}

impl RenderCallbacks for RemoteCallbacks {
    fn on_row(
        &mut self,
        job: JobId,
        started_at: Instant,
        row: u32,
        bytes: Cow<'_, [u8]>,
    ) -> MandelResult<()> {
        bound(&self.on_row, "on_row")?.invoke(vec![
            WireValue::U64(job.0),
            WireValue::Instant(started_at),
            WireValue::U32(row),
            region(bytes),
        ])
    }

    fn on_full_image(
        &mut self,
        job: JobId,
        started_at: Instant,
        frame: Cow<'_, [u8]>,
    ) -> MandelResult<()> {
        // Full frames are copied, never transferred.
        bound(&self.on_full_image, "on_full_image")?.invoke(vec![
            WireValue::U64(job.0),
            WireValue::Instant(started_at),
            WireValue::copy_of(&frame),
        ])
    }

    fn on_finish(&mut self, job: JobId) -> MandelResult<()> {
        self.on_finish.invoke(vec![WireValue::U64(job.0)])
    }

    fn on_cancel(&mut self, job: JobId) -> MandelResult<()> {
        bound(&self.on_cancel, "on_cancel")?.invoke(vec![WireValue::U64(job.0)])
    }
}

#[derive(Debug, Default)]
struct RunFlags {
    /// Runs forwarded to the compute thread and not yet settled, oldest first.
    outstanding: VecDeque<CancelToken>,
    /// Flag reported while nothing is outstanding.
    idle: CancelToken,
    released: bool,
}

/// Cancel flags shared by the port and compute threads.
///
/// Runs execute in the order they were forwarded, so the front of the queue is the job that is
/// computing (or about to). Cancel requests land there, never on a job still waiting behind it.
#[derive(Clone, Debug, Default)]
struct RunQueue(Arc<Mutex<RunFlags>>);

impl RunQueue {
    fn lock(&self) -> MutexGuard<'_, RunFlags> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, token: CancelToken) {
        self.lock().outstanding.push_back(token);
    }

    /// Undo a `push` whose task never reached the compute thread.
    fn abandon_last(&self) {
        self.lock().outstanding.pop_back();
    }

    /// The oldest run has settled.
    fn settle(&self) {
        let mut flags = self.lock();
        if let Some(token) = flags.outstanding.pop_front() {
            flags.idle = token;
        }
    }

    fn current(&self) -> CancelToken {
        let flags = self.lock();
        flags.outstanding.front().unwrap_or(&flags.idle).clone()
    }

    fn reset_idle(&self) {
        self.lock().idle = CancelToken::new();
    }

    /// Cancel every outstanding run and stop the compute thread after its current row.
    fn release(&self) {
        let mut flags = self.lock();
        flags.released = true;
        flags.idle.cancel();
        for token in &flags.outstanding {
            token.cancel();
        }
    }

    fn is_released(&self) -> bool {
        self.lock().released
    }
}

struct Port {
    endpoint: EndpointId,
    replies: Sender<Envelope>,
    tasks: Sender<ComputeTask>,
    runs: RunQueue,
}

impl Port {
    fn reply(&self, id: CallId, result: MandelResult<WireValue>) {
        respond(&self.replies, self.endpoint, id, result);
    }

    fn remote(&self, token: HandleToken) -> RemoteHandle {
        RemoteHandle::new(token, self.endpoint, self.replies.clone())
    }

    fn serve(&mut self, call: ServiceCall) -> ControlFlow<()> {
        match call {
            ServiceCall::Cancel { id } => {
                self.runs.current().cancel();
                if let Some(id) = id {
                    self.reply(id, Ok(WireValue::Unit));
                }
            }
            ServiceCall::GetCancelled { id } => {
                self.reply(id, Ok(WireValue::Bool(self.runs.current().is_cancelled())));
            }
            ServiceCall::SetCancelled { id, value } => {
                let current = self.runs.current();
                let res = if value {
                    current.cancel();
                    Ok(WireValue::Unit)
                } else if current.is_cancelled() {
                    Err(MandelError::validation(
                        "a cancel request cannot be withdrawn",
                    ))
                } else {
                    Ok(WireValue::Unit)
                };
                self.reply(id, res);
            }
            ServiceCall::Endpoint { id } => {
                self.reply(id, Ok(WireValue::Endpoint(self.endpoint)));
            }
            ServiceCall::Construct { id, palette } => {
                self.runs.reset_idle();
                if self.tasks.send(ComputeTask::Construct { id, palette }).is_err() {
                    self.reply(id, Err(MandelError::transport("compute thread stopped")));
                }
            }
            ServiceCall::Run {
                id,
                mode,
                args,
                handles,
            } => {
                // Each run gets its own flag, queued in message order behind the runs ahead of it.
                let token = CancelToken::new();
                let job = RenderJob::with_token(
                    args.job,
                    args.descriptor,
                    args.params,
                    args.started_at,
                    token,
                );
                match job {
                    Err(e) => self.reply(id, Err(e)),
                    Ok(job) => {
                        self.runs.push(job.cancel_token());
                        let callbacks = RemoteCallbacks {
                            on_row: handles.on_row.map(|t| self.remote(t)),
                            on_full_image: handles.on_full_image.map(|t| self.remote(t)),
                            on_finish: self.remote(handles.on_finish),
                            on_cancel: handles.on_cancel.map(|t| self.remote(t)),
                        };
                        let task = ComputeTask::Run {
                            id,
                            mode,
                            job,
                            callbacks,
                        };
                        if self.tasks.send(task).is_err() {
                            self.runs.abandon_last();
                            self.reply(id, Err(MandelError::transport("compute thread stopped")));
                        }
                    }
                }
            }
            ServiceCall::Release { id } => {
                self.runs.release();
                self.reply(id, Ok(WireValue::Unit));
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn run(mut self, requests: Receiver<Envelope>) {
        for env in requests {
            if env.origin != self.endpoint {
                tracing::warn!(
                    expected = self.endpoint.0,
                    got = env.origin.0,
                    "dropping message from foreign endpoint"
                );
                continue;
            }
            let Message::Request(req) = env.message else {
                tracing::warn!(endpoint = self.endpoint.0, "dropping non-request message");
                continue;
            };
            let id = req.id;
            let path = req.path_str();
            match ServiceCall::try_from(req) {
                Ok(call) => {
                    if self.serve(call).is_break() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(endpoint = self.endpoint.0, path, error = %e, "malformed request");
                    if let Some(id) = id {
                        self.reply(id, Err(e));
                    }
                }
            }
        }
        tracing::debug!(endpoint = self.endpoint.0, "port thread stopped");
    }
}

fn compute(
    endpoint: EndpointId,
    tasks: Receiver<ComputeTask>,
    replies: Sender<Envelope>,
    runs: RunQueue,
) {
    let mut executor = StrategyExecutor::new();
    for task in tasks {
        if runs.is_released() {
            break;
        }
        match task {
            ComputeTask::Construct { id, palette } => {
                executor = match palette {
                    Some(p) => StrategyExecutor::new().with_palette(p),
                    None => StrategyExecutor::new(),
                };
                respond(&replies, endpoint, id, Ok(WireValue::Unit));
            }
            ComputeTask::Run {
                id,
                mode,
                job,
                mut callbacks,
            } => {
                let res = match mode {
                    ComputeMode::Single => executor.run_single(&job, &mut callbacks),
                    ComputeMode::LineByLine => {
                        executor.run_line_by_line(&job, &mut callbacks, &mut ThreadYield)
                    }
                };
                runs.settle();
                // Success or failure, the call resolves exactly once.
                respond(
                    &replies,
                    endpoint,
                    id,
                    res.and_then(|outcome| WireValue::record(&outcome)),
                );
            }
        }
    }
    tracing::debug!(endpoint = endpoint.0, "compute thread stopped");
}

/// Start the port and compute threads for `endpoint`.
///
/// Returns the port thread's handle. The compute thread is detached: after a release it stops at
/// its current job's next row check and skips anything still queued.
pub(crate) fn spawn(
    endpoint: EndpointId,
    requests: Receiver<Envelope>,
    replies: Sender<Envelope>,
) -> MandelResult<JoinHandle<()>> {
    let (tasks, task_rx) = mpsc::channel();
    let runs = RunQueue::default();

    let compute_replies = replies.clone();
    let compute_runs = runs.clone();
    std::thread::Builder::new()
        .name(format!("mandelbench-compute-{}", endpoint.0))
        .spawn(move || compute(endpoint, task_rx, compute_replies, compute_runs))
        .map_err(|e| MandelError::transport(format!("failed to spawn compute thread: {e}")))?;

    let port = Port {
        endpoint,
        replies,
        tasks,
        runs,
    };
    std::thread::Builder::new()
        .name(format!("mandelbench-port-{}", endpoint.0))
        .spawn(move || port.run(requests))
        .map_err(|e| MandelError::transport(format!("failed to spawn port thread: {e}")))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::strategy::descriptor::Strategy;

    const WAIT: Duration = Duration::from_secs(10);

    fn bind() -> (EndpointId, Sender<Envelope>, Receiver<Envelope>, JoinHandle<()>) {
        let endpoint = EndpointId(41);
        let (req_tx, req_rx) = mpsc::channel();
        let (rep_tx, rep_rx) = mpsc::channel();
        let port = spawn(endpoint, req_rx, rep_tx).unwrap();
        (endpoint, req_tx, rep_rx, port)
    }

    fn send(tx: &Sender<Envelope>, origin: EndpointId, req: Request) {
        tx.send(Envelope {
            origin,
            message: Message::Request(req),
        })
        .unwrap();
    }

    fn response(rx: &Receiver<Envelope>) -> Response {
        loop {
            match rx.recv_timeout(WAIT).unwrap().message {
                Message::Response(r) => return r,
                _ => continue,
            }
        }
    }

    #[test]
    fn cancel_lands_on_the_oldest_outstanding_run() {
        let runs = RunQueue::default();
        let (a, b) = (CancelToken::new(), CancelToken::new());
        runs.push(a.clone());
        runs.push(b.clone());

        runs.current().cancel();
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());

        runs.settle();
        assert!(!runs.current().is_cancelled());
        runs.settle();
        // Idle reports the flag of the last settled run.
        assert!(!runs.current().is_cancelled());

        let c = CancelToken::new();
        runs.push(c.clone());
        runs.release();
        assert!(c.is_cancelled());
        assert!(runs.is_released());
    }

    #[test]
    fn decode_rejects_unknown_paths_and_missing_ids() {
        let req = Request::call(CallId(1), RequestKind::Apply, &["explode"], vec![]);
        assert!(ServiceCall::try_from(req).is_err());

        let req = Request::notify(RequestKind::Get, &[CANCELLED], vec![]);
        assert!(ServiceCall::try_from(req).is_err());

        let req = Request::notify(RequestKind::Apply, &[CANCEL], vec![]);
        assert!(matches!(
            ServiceCall::try_from(req).unwrap(),
            ServiceCall::Cancel { id: None }
        ));
    }

    #[test]
    fn property_access_and_endpoint() {
        let (ep, tx, rx, port) = bind();

        send(&tx, ep, Request::call(CallId(1), RequestKind::Get, &[CANCELLED], vec![]));
        assert!(!response(&rx).result.unwrap().as_bool().unwrap());

        send(
            &tx,
            ep,
            Request::call(CallId(2), RequestKind::Set, &[CANCELLED], vec![])
                .with_value(WireValue::Bool(true)),
        );
        assert_eq!(response(&rx).id, CallId(2));

        send(&tx, ep, Request::call(CallId(3), RequestKind::Get, &[CANCELLED], vec![]));
        assert!(response(&rx).result.unwrap().as_bool().unwrap());

        send(
            &tx,
            ep,
            Request::call(CallId(4), RequestKind::Set, &[CANCELLED], vec![])
                .with_value(WireValue::Bool(false)),
        );
        assert!(response(&rx).result.is_err());

        send(&tx, ep, Request::call(CallId(5), RequestKind::Endpoint, &[], vec![]));
        assert_eq!(response(&rx).result.unwrap().as_endpoint().unwrap(), ep);

        send(&tx, ep, Request::call(CallId(6), RequestKind::Release, &[], vec![]));
        assert_eq!(response(&rx).id, CallId(6));
        port.join().unwrap();
    }

    #[test]
    fn foreign_origins_are_dropped_without_teardown() {
        let (ep, tx, rx, port) = bind();
        send(
            &tx,
            EndpointId(999),
            Request::call(CallId(1), RequestKind::Endpoint, &[], vec![]),
        );
        send(&tx, ep, Request::call(CallId(2), RequestKind::Endpoint, &[], vec![]));
        // Only the well-addressed request is answered.
        assert_eq!(response(&rx).id, CallId(2));

        send(&tx, ep, Request::call(CallId(3), RequestKind::Release, &[], vec![]));
        assert_eq!(response(&rx).id, CallId(3));
        port.join().unwrap();
    }

    #[test]
    fn run_single_invokes_handles_then_resolves() {
        let (ep, tx, rx, port) = bind();
        let params = RenderParams::new(4, 2, 8, Default::default()).unwrap();
        let args = vec![
            WireValue::U64(5),
            WireValue::Instant(Instant::now()),
            WireValue::record(&Strategy::NativeSingle.descriptor()).unwrap(),
            WireValue::record(&params).unwrap(),
            WireValue::Handler(HandleToken(10)),
            WireValue::Handler(HandleToken(11)),
        ];
        send(&tx, ep, Request::call(CallId(1), RequestKind::Apply, &[RUN_SINGLE], args));

        let mut invoked = Vec::new();
        let resolved = loop {
            match rx.recv_timeout(WAIT).unwrap().message {
                Message::Invoke(inv) => invoked.push((inv.handle, inv.args.len())),
                Message::Response(r) => break r,
                Message::Request(_) => unreachable!(),
            }
        };
        assert_eq!(invoked, vec![(HandleToken(10), 3), (HandleToken(11), 1)]);
        assert_eq!(resolved.id, CallId(1));
        let outcome: crate::strategy::executor::JobOutcome =
            resolved.result.unwrap().into_record().unwrap();
        assert_eq!(outcome, crate::strategy::executor::JobOutcome::Completed);

        send(&tx, ep, Request::call(CallId(2), RequestKind::Release, &[], vec![]));
        response(&rx);
        port.join().unwrap();
    }
}
