use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::foundation::core::JobId;
use crate::foundation::error::{MandelError, MandelResult};
use crate::kernel::Palette;
use crate::proxy::handles::{CallbackFn, HandleRegistry};
use crate::proxy::wire::{
    CallId, EndpointId, Envelope, HandleToken, Message, Request, RequestKind, WireValue,
};
use crate::proxy::worker::{self, CANCEL, CANCELLED, RUN_LINE_BY_LINE, RUN_SINGLE};
use crate::strategy::executor::JobOutcome;
use crate::strategy::job::RenderJob;

static NEXT_ENDPOINT: AtomicU64 = AtomicU64::new(1);

type RowFn = Box<dyn FnMut(JobId, Instant, u32, Vec<u8>)>;
type FrameFn = Box<dyn FnMut(JobId, Instant, Vec<u8>)>;
type JobFn = Box<dyn FnMut(JobId)>;

/// Local functions receiving a proxied run's progress.
///
/// Unset callbacks are no-ops. They run on the thread that pumps the proxy.
#[derive(Default)]
pub struct ProxyCallbacks {
    on_row: Option<RowFn>,
    on_full_image: Option<FrameFn>,
    on_finish: Option<JobFn>,
    on_cancel: Option<JobFn>,
}

impl std::fmt::Debug for ProxyCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyCallbacks")
            .field("on_row", &self.on_row.is_some())
            .field("on_full_image", &self.on_full_image.is_some())
            .field("on_finish", &self.on_finish.is_some())
            .field("on_cancel", &self.on_cancel.is_some())
            .finish()
    }
}

impl ProxyCallbacks {
    /// No callbacks set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-row delivery. Row bytes arrive owned (transferred).
    pub fn on_row(mut self, f: impl FnMut(JobId, Instant, u32, Vec<u8>) + 'static) -> Self {
        self.on_row = Some(Box::new(f));
        self
    }

    /// Full-frame delivery of a single-pass run. Frame bytes arrive copied.
    pub fn on_full_image(mut self, f: impl FnMut(JobId, Instant, Vec<u8>) + 'static) -> Self {
        self.on_full_image = Some(Box::new(f));
        self
    }

    /// Normal completion.
    pub fn on_finish(mut self, f: impl FnMut(JobId) + 'static) -> Self {
        self.on_finish = Some(Box::new(f));
        self
    }

    /// Cancellation observed by the remote row loop.
    pub fn on_cancel(mut self, f: impl FnMut(JobId) + 'static) -> Self {
        self.on_cancel = Some(Box::new(f));
        self
    }
}

fn arity<const N: usize>(args: Vec<WireValue>, what: &str) -> MandelResult<[WireValue; N]> {
    args.try_into().map_err(|a: Vec<WireValue>| {
        MandelError::transport(format!("{what} expects {N} arguments, got {}", a.len()))
    })
}

fn row_handler(mut f: RowFn) -> CallbackFn {
    Box::new(move |args| {
        let [job, at, row, bytes] = arity(args, "on_row")?;
        f(
            JobId(job.as_u64()?),
            at.as_instant()?,
            row.as_u32()?,
            bytes.into_bytes()?,
        );
        Ok(())
    })
}

fn frame_handler(mut f: FrameFn) -> CallbackFn {
    Box::new(move |args| {
        let [job, at, frame] = arity(args, "on_full_image")?;
        f(JobId(job.as_u64()?), at.as_instant()?, frame.into_bytes()?);
        Ok(())
    })
}

fn job_handler(mut f: JobFn, what: &'static str) -> CallbackFn {
    Box::new(move |args| {
        let [job] = arity(args, what)?;
        f(JobId(job.as_u64()?));
        Ok(())
    })
}

fn no_op_job() -> JobFn {
    Box::new(|_| {})
}

/// Caller side of a binding to a [`crate::StrategyExecutor`] running on its own worker threads.
///
/// Requests are posted without blocking. Responses and callback invocations are processed only
/// when the caller pumps ([`CrossThreadProxy::pump`], [`CrossThreadProxy::drain`],
/// [`CrossThreadProxy::wait`]), so every local callback runs on the caller's thread.
pub struct CrossThreadProxy {
    endpoint: EndpointId,
    requests: Option<Sender<Envelope>>,
    replies: Receiver<Envelope>,
    port: Option<JoinHandle<()>>,
    handles: HandleRegistry,
    next_call: u64,
    pending: HashSet<CallId>,
    detached: HashSet<CallId>,
    settled: HashMap<CallId, MandelResult<WireValue>>,
}

impl std::fmt::Debug for CrossThreadProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrossThreadProxy")
            .field("endpoint", &self.endpoint)
            .field("released", &self.is_released())
            .field("pending", &self.pending.len())
            .field("handles", &self.handles)
            .finish_non_exhaustive()
    }
}

impl CrossThreadProxy {
    /// Start a worker and bind to it under a fresh endpoint id.
    pub fn spawn() -> MandelResult<Self> {
        let endpoint = EndpointId(NEXT_ENDPOINT.fetch_add(1, Ordering::Relaxed));
        let (req_tx, req_rx) = mpsc::channel();
        let (rep_tx, rep_rx) = mpsc::channel();
        let port = worker::spawn(endpoint, req_rx, rep_tx)?;
        tracing::debug!(endpoint = endpoint.0, "proxy bound");
        Ok(Self {
            endpoint,
            requests: Some(req_tx),
            replies: rep_rx,
            port: Some(port),
            handles: HandleRegistry::new(),
            next_call: 0,
            pending: HashSet::new(),
            detached: HashSet::new(),
            settled: HashMap::new(),
        })
    }

    /// Identity stamped on this binding's messages.
    pub fn endpoint(&self) -> EndpointId {
        self.endpoint
    }

    /// `true` after [`CrossThreadProxy::release`].
    pub fn is_released(&self) -> bool {
        self.requests.is_none()
    }

    /// Number of live callback handles.
    pub fn live_handles(&self) -> usize {
        self.handles.len()
    }

    fn post(&self, req: Request) -> MandelResult<()> {
        let tx = self
            .requests
            .as_ref()
            .ok_or_else(|| MandelError::transport("proxy has been released"))?;
        tx.send(Envelope {
            origin: self.endpoint,
            message: Message::Request(req),
        })
        .map_err(|_| MandelError::transport("worker endpoint closed"))
    }

    fn call(
        &mut self,
        kind: RequestKind,
        path: &[&str],
        args: Vec<WireValue>,
        value: Option<WireValue>,
    ) -> MandelResult<CallId> {
        self.next_call += 1;
        let id = CallId(self.next_call);
        let mut req = Request::call(id, kind, path, args);
        req.value = value;
        self.post(req)?;
        self.pending.insert(id);
        Ok(id)
    }

    fn job_args(job: &RenderJob) -> MandelResult<Vec<WireValue>> {
        Ok(vec![
            WireValue::U64(job.id().0),
            WireValue::Instant(job.started_at()),
            WireValue::record(job.descriptor())?,
            WireValue::record(job.params())?,
        ])
    }

    fn dispatch_run(
        &mut self,
        method: &str,
        mut args: Vec<WireValue>,
        handlers: Vec<CallbackFn>,
    ) -> MandelResult<CallId> {
        let tokens: Vec<HandleToken> = handlers
            .into_iter()
            .map(|f| self.handles.register(f))
            .collect();
        args.extend(tokens.iter().map(|t| WireValue::Handler(*t)));
        match self.call(RequestKind::Apply, &[method], args, None) {
            Ok(id) => {
                self.handles.bind(id, tokens);
                Ok(id)
            }
            Err(e) => {
                // Nothing will ever invoke them.
                self.handles.forget(&tokens);
                Err(e)
            }
        }
    }

    /// Post a single-pass run. The call resolves to the job's [`JobOutcome`].
    pub fn run_single(
        &mut self,
        job: &RenderJob,
        callbacks: ProxyCallbacks,
    ) -> MandelResult<CallId> {
        let args = Self::job_args(job)?;
        let on_full_image = callbacks
            .on_full_image
            .unwrap_or_else(|| Box::new(|_, _, _| {}));
        let handlers = vec![
            frame_handler(on_full_image),
            job_handler(callbacks.on_finish.unwrap_or_else(no_op_job), "on_finish"),
        ];
        let id = self.dispatch_run(RUN_SINGLE, args, handlers)?;
        tracing::debug!(endpoint = self.endpoint.0, job = %job.id(), call = id.0, "run_single posted");
        Ok(id)
    }

    /// Post a line-by-line run. Rows arrive through `on_row` as the remote loop produces them.
    pub fn run_line_by_line(
        &mut self,
        job: &RenderJob,
        callbacks: ProxyCallbacks,
    ) -> MandelResult<CallId> {
        let args = Self::job_args(job)?;
        let on_row = callbacks.on_row.unwrap_or_else(|| Box::new(|_, _, _, _| {}));
        let handlers = vec![
            row_handler(on_row),
            job_handler(callbacks.on_finish.unwrap_or_else(no_op_job), "on_finish"),
            job_handler(callbacks.on_cancel.unwrap_or_else(no_op_job), "on_cancel"),
        ];
        let id = self.dispatch_run(RUN_LINE_BY_LINE, args, handlers)?;
        tracing::debug!(endpoint = self.endpoint.0, job = %job.id(), call = id.0, "run_line_by_line posted");
        Ok(id)
    }

    /// Fire-and-forget cancel of the worker's current job. No response is sent.
    ///
    /// "Current" is the oldest run not yet resolved; runs queued behind it are unaffected.
    pub fn cancel(&self) -> MandelResult<()> {
        self.post(Request::notify(RequestKind::Apply, &[CANCEL], vec![]))
    }

    /// Read the worker's cancel flag.
    pub fn cancelled(&mut self, timeout: Duration) -> MandelResult<bool> {
        let id = self.call(RequestKind::Get, &[CANCELLED], vec![], None)?;
        self.wait(id, timeout)?.as_bool()
    }

    /// Write the worker's cancel flag. Setting `true` is a cancel that waits for acknowledgment.
    pub fn set_cancelled(&mut self, value: bool, timeout: Duration) -> MandelResult<()> {
        let id = self.call(
            RequestKind::Set,
            &[CANCELLED],
            vec![],
            Some(WireValue::Bool(value)),
        )?;
        self.wait(id, timeout).map(|_| ())
    }

    /// Replace the remote executor with a fresh one, after any queued runs.
    ///
    /// `palette` is forced onto every CPU backend of the new executor.
    pub fn construct(&mut self, palette: Option<Palette>, timeout: Duration) -> MandelResult<()> {
        let args = vec![WireValue::record(&palette)?];
        let id = self.call(RequestKind::Construct, &[], args, None)?;
        self.wait(id, timeout).map(|_| ())
    }

    /// Ask the worker which endpoint it serves.
    pub fn remote_endpoint(&mut self, timeout: Duration) -> MandelResult<EndpointId> {
        let id = self.call(RequestKind::Endpoint, &[], vec![], None)?;
        self.wait(id, timeout)?.as_endpoint()
    }

    fn handle(&mut self, env: Envelope) {
        if env.origin != self.endpoint {
            tracing::warn!(
                expected = self.endpoint.0,
                got = env.origin.0,
                "dropping message from foreign endpoint"
            );
            return;
        }
        match env.message {
            Message::Response(resp) => {
                if self.detached.remove(&resp.id) {
                    self.handles.release_call(resp.id);
                    if let Err(e) = resp.result {
                        tracing::warn!(call = resp.id.0, error = %e, "forgotten call failed");
                    }
                    return;
                }
                if !self.pending.remove(&resp.id) {
                    tracing::warn!(call = resp.id.0, "dropping response to unknown call");
                    return;
                }
                self.handles.release_call(resp.id);
                let result = resp
                    .result
                    .map_err(|e| MandelError::transport(format!("remote call failed: {e}")));
                self.settled.insert(resp.id, result);
            }
            Message::Invoke(inv) => {
                if let Err(e) = self.handles.invoke(inv.handle, inv.args) {
                    tracing::warn!(handle = inv.handle.0, error = %e, "dropping callback invocation");
                }
            }
            Message::Request(req) => {
                tracing::warn!(path = req.path_str(), "dropping request sent to the caller side");
            }
        }
    }

    /// Process at most one incoming message, waiting up to `timeout`.
    ///
    /// Returns `Ok(false)` when nothing arrived.
    pub fn pump(&mut self, timeout: Duration) -> MandelResult<bool> {
        match self.replies.recv_timeout(timeout) {
            Ok(env) => {
                self.handle(env);
                Ok(true)
            }
            Err(RecvTimeoutError::Timeout) => Ok(false),
            Err(RecvTimeoutError::Disconnected) => {
                Err(MandelError::transport("worker endpoint closed"))
            }
        }
    }

    /// Process every message already queued without waiting. Returns how many were handled.
    pub fn drain(&mut self) -> MandelResult<usize> {
        let mut n = 0;
        loop {
            match self.replies.try_recv() {
                Ok(env) => {
                    self.handle(env);
                    n += 1;
                }
                Err(TryRecvError::Empty) => return Ok(n),
                // Released bindings drain what was already delivered, then report quiet.
                Err(TryRecvError::Disconnected) if self.is_released() => return Ok(n),
                Err(TryRecvError::Disconnected) => {
                    return Err(MandelError::transport("worker endpoint closed"));
                }
            }
        }
    }

    /// `true` while `call` awaits its response.
    pub fn is_pending(&self, call: CallId) -> bool {
        self.pending.contains(&call)
    }

    /// Take the result of `call` if it has resolved.
    pub fn take_settled(&mut self, call: CallId) -> Option<MandelResult<WireValue>> {
        self.settled.remove(&call)
    }

    /// Stop tracking `call`.
    ///
    /// Returns its result if it already resolved. A response still in transit is discarded on
    /// arrival (failures are logged), and the call's callbacks stay live until then.
    pub fn forget(&mut self, call: CallId) -> Option<MandelResult<WireValue>> {
        if self.pending.remove(&call) {
            self.detached.insert(call);
            return None;
        }
        self.settled.remove(&call)
    }

    /// Number of resolved results nobody has taken yet.
    pub fn unclaimed(&self) -> usize {
        self.settled.len()
    }

    /// Pump until `call` resolves, running callbacks as they arrive.
    pub fn wait(&mut self, call: CallId, timeout: Duration) -> MandelResult<WireValue> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(res) = self.settled.remove(&call) {
                return res;
            }
            if !self.pending.contains(&call) {
                return Err(MandelError::transport(format!(
                    "call {} is not outstanding",
                    call.0
                )));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(MandelError::transport(format!(
                    "call {} timed out after {timeout:?}",
                    call.0
                )));
            }
            self.pump(deadline - now)?;
        }
    }

    /// [`CrossThreadProxy::wait`] for a run call, decoding its outcome.
    pub fn wait_job(&mut self, call: CallId, timeout: Duration) -> MandelResult<JobOutcome> {
        self.wait(call, timeout)?.into_record()
    }

    /// Tear the binding down: the worker cancels its current job, answers and stops.
    ///
    /// Outstanding calls are abandoned and every callback handle is dropped. Every outstanding run
    /// is cancelled and queued ones are skipped. The compute thread is not joined; it stops after
    /// its current row. Releasing twice is a no-op.
    pub fn release(&mut self) -> MandelResult<()> {
        if self.is_released() {
            return Ok(());
        }
        self.next_call += 1;
        let release = Request::call(CallId(self.next_call), RequestKind::Release, &[], vec![]);
        if self.post(release).is_err() {
            tracing::debug!(endpoint = self.endpoint.0, "worker already gone at release");
        }
        self.requests = None;
        self.handles.clear();
        self.pending.clear();
        self.detached.clear();
        self.settled.clear();
        if let Some(port) = self.port.take() {
            port.join()
                .map_err(|_| MandelError::transport("port thread panicked"))?;
        }
        tracing::debug!(endpoint = self.endpoint.0, "proxy released");
        Ok(())
    }
}

impl Drop for CrossThreadProxy {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!(endpoint = self.endpoint.0, error = %e, "proxy release failed on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::wire::{Invocation, Response};

    #[test]
    fn endpoints_are_unique_per_binding() {
        let a = CrossThreadProxy::spawn().unwrap();
        let b = CrossThreadProxy::spawn().unwrap();
        assert_ne!(a.endpoint(), b.endpoint());
    }

    #[test]
    fn foreign_envelopes_are_dropped_on_the_caller_side() {
        let mut proxy = CrossThreadProxy::spawn().unwrap();
        let id = proxy
            .call(RequestKind::Endpoint, &[], vec![], None)
            .unwrap();
        let forged = Envelope {
            origin: EndpointId(u64::MAX),
            message: Message::Response(Response {
                id,
                result: Ok(WireValue::Endpoint(EndpointId(u64::MAX))),
            }),
        };
        proxy.handle(forged);
        assert!(proxy.is_pending(id));

        let ep = proxy
            .wait(id, Duration::from_secs(10))
            .unwrap()
            .as_endpoint()
            .unwrap();
        assert_eq!(ep, proxy.endpoint());
    }

    #[test]
    fn malformed_invocations_do_not_tear_down_the_channel() {
        let mut proxy = CrossThreadProxy::spawn().unwrap();
        let token = proxy.handles.register(job_handler(no_op_job(), "on_finish"));
        proxy.handle(Envelope {
            origin: proxy.endpoint(),
            message: Message::Invoke(Invocation {
                handle: token,
                args: vec![WireValue::Bool(true), WireValue::Unit],
            }),
        });
        proxy.handle(Envelope {
            origin: proxy.endpoint(),
            message: Message::Invoke(Invocation {
                handle: HandleToken(12345),
                args: vec![],
            }),
        });
        assert!(!proxy.cancelled(Duration::from_secs(10)).unwrap());
    }

    #[test]
    fn forgotten_calls_leave_nothing_behind() {
        let mut proxy = CrossThreadProxy::spawn().unwrap();

        let settled = proxy
            .call(RequestKind::Endpoint, &[], vec![], None)
            .unwrap();
        while proxy.is_pending(settled) {
            proxy.pump(Duration::from_secs(10)).unwrap();
        }
        assert_eq!(proxy.unclaimed(), 1);
        assert!(matches!(proxy.forget(settled), Some(Ok(_))));

        let in_transit = proxy
            .call(RequestKind::Endpoint, &[], vec![], None)
            .unwrap();
        assert!(proxy.forget(in_transit).is_none());
        assert!(!proxy.is_pending(in_transit));
        // Answered in order, so the forgotten response has landed by now.
        assert!(!proxy.cancelled(Duration::from_secs(10)).unwrap());
        assert!(proxy.detached.is_empty());
        assert_eq!(proxy.unclaimed(), 0);
        assert!(proxy.wait(in_transit, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn release_is_idempotent_and_blocks_further_calls() {
        let mut proxy = CrossThreadProxy::spawn().unwrap();
        proxy.release().unwrap();
        proxy.release().unwrap();
        assert!(proxy.is_released());
        assert!(proxy.cancel().is_err());
        assert!(proxy.cancelled(Duration::from_millis(10)).is_err());
    }
}
