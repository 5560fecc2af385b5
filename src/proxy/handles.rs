use std::collections::HashMap;
use std::sync::mpsc::Sender;

use crate::foundation::error::{MandelError, MandelResult};
use crate::proxy::wire::{CallId, EndpointId, Envelope, HandleToken, Invocation, Message, WireValue};

/// Local function behind a callback handle.
pub type CallbackFn = Box<dyn FnMut(Vec<WireValue>) -> MandelResult<()>>;

/// Caller-side table resolving handle tokens to local functions.
///
/// Handles are registered per call and dropped together when that call's response arrives, so a
/// token outlives its job only until the job resolves.
#[derive(Default)]
pub struct HandleRegistry {
    next: u64,
    handles: HashMap<HandleToken, CallbackFn>,
    by_call: HashMap<CallId, Vec<HandleToken>>,
}

impl std::fmt::Debug for HandleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleRegistry")
            .field("live", &self.handles.len())
            .field("calls", &self.by_call.len())
            .finish()
    }
}

impl HandleRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `f` under a fresh token.
    pub fn register(&mut self, f: CallbackFn) -> HandleToken {
        self.next += 1;
        let token = HandleToken(self.next);
        self.handles.insert(token, f);
        token
    }

    /// Tie `tokens` to `call`; [`HandleRegistry::release_call`] drops them together.
    pub fn bind(&mut self, call: CallId, tokens: Vec<HandleToken>) {
        self.by_call.entry(call).or_default().extend(tokens);
    }

    /// Invoke the function behind `token`.
    pub fn invoke(&mut self, token: HandleToken, args: Vec<WireValue>) -> MandelResult<()> {
        let f = self
            .handles
            .get_mut(&token)
            .ok_or_else(|| MandelError::transport(format!("unknown callback handle {}", token.0)))?;
        f(args)
    }

    /// Deregister every handle bound to `call`. Returns how many were dropped.
    pub fn release_call(&mut self, call: CallId) -> usize {
        let tokens = self.by_call.remove(&call).unwrap_or_default();
        tokens
            .iter()
            .filter(|t| self.handles.remove(t).is_some())
            .count()
    }

    /// Deregister `tokens` directly.
    pub fn forget(&mut self, tokens: &[HandleToken]) {
        for t in tokens {
            self.handles.remove(t);
        }
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.handles.clear();
        self.by_call.clear();
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// `true` when no handle is registered.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

/// Worker-side capability: invoking it posts an [`Invocation`] back to the caller.
#[derive(Clone, Debug)]
pub struct RemoteHandle {
    token: HandleToken,
    origin: EndpointId,
    outbox: Sender<Envelope>,
}

impl RemoteHandle {
    pub(crate) fn new(token: HandleToken, origin: EndpointId, outbox: Sender<Envelope>) -> Self {
        Self {
            token,
            origin,
            outbox,
        }
    }

    /// Token this handle resolves to on the caller side.
    pub fn token(&self) -> HandleToken {
        self.token
    }

    /// Post an invocation. Fails only when the caller side has gone away.
    pub fn invoke(&self, args: Vec<WireValue>) -> MandelResult<()> {
        self.outbox
            .send(Envelope {
                origin: self.origin,
                message: Message::Invoke(Invocation {
                    handle: self.token,
                    args,
                }),
            })
            .map_err(|_| MandelError::transport("caller endpoint closed"))
    }
}
