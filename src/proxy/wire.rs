use std::time::Instant;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::foundation::error::{MandelError, MandelResult};

/// Identity of one proxy binding. Every envelope is stamped with it; the receiver drops envelopes
/// from any other origin.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(pub u64);

/// Correlation token matching a request to its response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId(pub u64);

/// Registered callback capability.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleToken(pub u64);

/// Request operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Read a property.
    Get,
    /// Write a property.
    Set,
    /// Call a method.
    Apply,
    /// Create a fresh service instance.
    Construct,
    /// Report the binding's endpoint.
    Endpoint,
    /// Tear the binding down.
    Release,
}

/// A value crossing the thread boundary.
///
/// Primitives and records are copied. Byte regions are either copied ([`WireValue::Bytes`]) or
/// moved ([`WireValue::Transfer`]); after a transfer the sender no longer has the region.
/// [`WireValue::Handler`] is a callback capability, resolved by the receiver into something
/// invocable rather than read as data.
pub enum WireValue {
    /// No value.
    Unit,
    /// Boolean.
    Bool(bool),
    /// 32-bit unsigned.
    U32(u32),
    /// 64-bit unsigned.
    U64(u64),
    /// Monotonic timestamp.
    Instant(Instant),
    /// Structured value, marshalled through serde.
    Record(serde_json::Value),
    /// Byte region copied from the sender.
    Bytes(Vec<u8>),
    /// Byte region whose ownership moved from the sender.
    Transfer(Vec<u8>),
    /// Callback capability.
    Handler(HandleToken),
    /// Endpoint identity.
    Endpoint(EndpointId),
}

impl std::fmt::Debug for WireValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireValue::Unit => f.write_str("Unit"),
            WireValue::Bool(v) => write!(f, "Bool({v})"),
            WireValue::U32(v) => write!(f, "U32({v})"),
            WireValue::U64(v) => write!(f, "U64({v})"),
            WireValue::Instant(v) => write!(f, "Instant({v:?})"),
            WireValue::Record(v) => write!(f, "Record({v})"),
            WireValue::Bytes(b) => write!(f, "Bytes(len={})", b.len()),
            WireValue::Transfer(b) => write!(f, "Transfer(len={})", b.len()),
            WireValue::Handler(h) => write!(f, "Handler({})", h.0),
            WireValue::Endpoint(e) => write!(f, "Endpoint({})", e.0),
        }
    }
}

impl WireValue {
    /// Copy `bytes` into a new region; the sender keeps its own.
    pub fn copy_of(bytes: &[u8]) -> Self {
        WireValue::Bytes(bytes.to_vec())
    }

    /// Move `bytes` to the receiver.
    pub fn transfer(bytes: Vec<u8>) -> Self {
        WireValue::Transfer(bytes)
    }

    /// Marshal a serde value by copy.
    pub fn record<T: Serialize>(value: &T) -> MandelResult<Self> {
        serde_json::to_value(value)
            .map(WireValue::Record)
            .map_err(|e| MandelError::transport(format!("record encode failed: {e}")))
    }

    /// Short name of the variant, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            WireValue::Unit => "unit",
            WireValue::Bool(_) => "bool",
            WireValue::U32(_) => "u32",
            WireValue::U64(_) => "u64",
            WireValue::Instant(_) => "instant",
            WireValue::Record(_) => "record",
            WireValue::Bytes(_) => "bytes",
            WireValue::Transfer(_) => "transfer",
            WireValue::Handler(_) => "handler",
            WireValue::Endpoint(_) => "endpoint",
        }
    }

    fn mismatch(&self, expected: &str) -> MandelError {
        MandelError::transport(format!(
            "expected {expected} wire value, got {}",
            self.kind()
        ))
    }

    /// Decode a [`WireValue::Record`].
    pub fn into_record<T: DeserializeOwned>(self) -> MandelResult<T> {
        match self {
            WireValue::Record(v) => serde_json::from_value(v)
                .map_err(|e| MandelError::transport(format!("record decode failed: {e}"))),
            other => Err(other.mismatch("record")),
        }
    }

    /// Take the bytes of a copied or transferred region.
    pub fn into_bytes(self) -> MandelResult<Vec<u8>> {
        match self {
            WireValue::Bytes(b) | WireValue::Transfer(b) => Ok(b),
            other => Err(other.mismatch("bytes")),
        }
    }

    /// Read a `bool`.
    pub fn as_bool(&self) -> MandelResult<bool> {
        match self {
            WireValue::Bool(v) => Ok(*v),
            other => Err(other.mismatch("bool")),
        }
    }

    /// Read a `u32`.
    pub fn as_u32(&self) -> MandelResult<u32> {
        match self {
            WireValue::U32(v) => Ok(*v),
            other => Err(other.mismatch("u32")),
        }
    }

    /// Read a `u64`.
    pub fn as_u64(&self) -> MandelResult<u64> {
        match self {
            WireValue::U64(v) => Ok(*v),
            other => Err(other.mismatch("u64")),
        }
    }

    /// Read an [`Instant`].
    pub fn as_instant(&self) -> MandelResult<Instant> {
        match self {
            WireValue::Instant(v) => Ok(*v),
            other => Err(other.mismatch("instant")),
        }
    }

    /// Read a callback handle.
    pub fn as_handler(&self) -> MandelResult<HandleToken> {
        match self {
            WireValue::Handler(h) => Ok(*h),
            other => Err(other.mismatch("handler")),
        }
    }

    /// Read an endpoint id.
    pub fn as_endpoint(&self) -> MandelResult<EndpointId> {
        match self {
            WireValue::Endpoint(e) => Ok(*e),
            other => Err(other.mismatch("endpoint")),
        }
    }
}

/// Caller-to-worker request.
#[derive(Debug)]
pub struct Request {
    /// Correlation token; `None` for fire-and-forget calls, which get no response.
    pub id: Option<CallId>,
    /// Operation.
    pub kind: RequestKind,
    /// Property or method path on the remote service.
    pub path: Vec<String>,
    /// Positional arguments.
    pub args: Vec<WireValue>,
    /// New value for [`RequestKind::Set`].
    pub value: Option<WireValue>,
}

impl Request {
    /// Request expecting a response.
    pub fn call(id: CallId, kind: RequestKind, path: &[&str], args: Vec<WireValue>) -> Self {
        Self {
            id: Some(id),
            kind,
            path: path.iter().map(|s| (*s).to_string()).collect(),
            args,
            value: None,
        }
    }

    /// Fire-and-forget request.
    pub fn notify(kind: RequestKind, path: &[&str], args: Vec<WireValue>) -> Self {
        Self {
            id: None,
            kind,
            path: path.iter().map(|s| (*s).to_string()).collect(),
            args,
            value: None,
        }
    }

    /// Attach a value (for [`RequestKind::Set`]).
    pub fn with_value(mut self, value: WireValue) -> Self {
        self.value = Some(value);
        self
    }

    /// `path` joined with dots, for diagnostics.
    pub fn path_str(&self) -> String {
        self.path.join(".")
    }
}

/// Worker-to-caller response to a [`Request`] with an id.
#[derive(Debug)]
pub struct Response {
    /// Correlation token of the request.
    pub id: CallId,
    /// Value, or the remote error rendered as text.
    pub result: Result<WireValue, String>,
}

/// Worker-to-caller invocation of a registered callback.
#[derive(Debug)]
pub struct Invocation {
    /// Which callback.
    pub handle: HandleToken,
    /// Positional arguments.
    pub args: Vec<WireValue>,
}

/// Message body.
#[derive(Debug)]
pub enum Message {
    /// See [`Request`].
    Request(Request),
    /// See [`Response`].
    Response(Response),
    /// See [`Invocation`].
    Invoke(Invocation),
}

/// Transport unit: a message stamped with the binding it belongs to.
#[derive(Debug)]
pub struct Envelope {
    /// Binding identity.
    pub origin: EndpointId,
    /// Body.
    pub message: Message,
}
