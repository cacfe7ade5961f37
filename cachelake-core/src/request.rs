//! Wire-neutral request and reply model.
//!
//! A [`Request`] is one parsed client operation handed over by the front-end
//! acceptor; a [`Reply`] is what eventually flows back through the one-shot
//! reply sink. Both are plain values with no protocol framing attached.

use bytes::Bytes;

/// Operation kind of a request.
///
/// Internal diagnostic kinds ([`Stats`](RequestKind::Stats),
/// [`Version`](RequestKind::Version)) never pass through the route handle
/// tree and are exempt from admission throttling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Get,
    Set,
    Delete,
    Stats,
    Version,
}

pub const REQUEST_KIND_COUNT: usize = 5;

impl RequestKind {
    pub const ALL: [RequestKind; REQUEST_KIND_COUNT] = [
        RequestKind::Get,
        RequestKind::Set,
        RequestKind::Delete,
        RequestKind::Stats,
        RequestKind::Version,
    ];

    pub fn name(self) -> &'static str {
        match self {
            RequestKind::Get => "get",
            RequestKind::Set => "set",
            RequestKind::Delete => "delete",
            RequestKind::Stats => "stats",
            RequestKind::Version => "version",
        }
    }

    /// Diagnostic kinds bypass admission control entirely.
    pub fn is_rate_limit_exempt(self) -> bool {
        matches!(self, RequestKind::Stats | RequestKind::Version)
    }

    pub(crate) fn index(self) -> usize {
        match self {
            RequestKind::Get => 0,
            RequestKind::Set => 1,
            RequestKind::Delete => 2,
            RequestKind::Stats => 3,
            RequestKind::Version => 4,
        }
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Set of request kinds the route handle tree is willing to execute.
///
/// Kinds outside the set are answered with LOCAL_ERROR before a task is ever
/// scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutableKinds(u8);

impl RoutableKinds {
    pub const fn empty() -> Self {
        RoutableKinds(0)
    }

    pub fn of(kinds: &[RequestKind]) -> Self {
        let mut mask = 0u8;
        for k in kinds {
            mask |= 1 << k.index();
        }
        RoutableKinds(mask)
    }

    pub fn contains(self, kind: RequestKind) -> bool {
        self.0 & (1 << kind.index()) != 0
    }
}

impl Default for RoutableKinds {
    /// Data-path kinds; diagnostics are always handled by the worker itself.
    fn default() -> Self {
        RoutableKinds::of(&[RequestKind::Get, RequestKind::Set, RequestKind::Delete])
    }
}

/// Admission priority. Lower discriminant pumps first; starvation of the
/// lower band under sustained high-priority load is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(usize)]
pub enum RequestPriority {
    Interactive = 0,
    Background = 1,
}

pub const PRIORITY_COUNT: usize = 2;

impl Default for RequestPriority {
    fn default() -> Self {
        RequestPriority::Interactive
    }
}

/// One immutable client operation.
#[derive(Debug, Clone)]
pub struct Request {
    kind: RequestKind,
    key: Bytes,
    value: Option<Bytes>,
    flags: u32,
    expiry_secs: u32,
}

impl Request {
    pub fn get(key: impl Into<Bytes>) -> Self {
        Request {
            kind: RequestKind::Get,
            key: key.into(),
            value: None,
            flags: 0,
            expiry_secs: 0,
        }
    }

    pub fn set(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Request {
            kind: RequestKind::Set,
            key: key.into(),
            value: Some(value.into()),
            flags: 0,
            expiry_secs: 0,
        }
    }

    pub fn delete(key: impl Into<Bytes>) -> Self {
        Request {
            kind: RequestKind::Delete,
            key: key.into(),
            value: None,
            flags: 0,
            expiry_secs: 0,
        }
    }

    /// The key selects the stats group; empty means the default group.
    pub fn stats(group: impl Into<Bytes>) -> Self {
        Request {
            kind: RequestKind::Stats,
            key: group.into(),
            value: None,
            flags: 0,
            expiry_secs: 0,
        }
    }

    pub fn version() -> Self {
        Request {
            kind: RequestKind::Version,
            key: Bytes::new(),
            value: None,
            flags: 0,
            expiry_secs: 0,
        }
    }

    pub fn with_expiry(mut self, expiry_secs: u32) -> Self {
        self.expiry_secs = expiry_secs;
        self
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn key(&self) -> &Bytes {
        &self.key
    }

    /// Lossy view of the key for diagnostics and internal endpoints.
    pub fn key_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.key)
    }

    pub fn value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn expiry_secs(&self) -> u32 {
        self.expiry_secs
    }
}

/// Wire-neutral result carried by a [`Reply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyResult {
    Ok,
    Found,
    NotFound,
    Stored,
    NotStored,
    Deleted,
    /// Admission shedding or waiting-deadline expiry.
    Busy,
    /// Internal failure; the message carries the diagnostic text.
    LocalError,
}

impl ReplyResult {
    pub fn is_error(self) -> bool {
        matches!(self, ReplyResult::Busy | ReplyResult::LocalError)
    }
}

/// Reply delivered through the one-shot sink of a request context.
#[derive(Debug, Clone)]
pub struct Reply {
    result: ReplyResult,
    value: Option<Bytes>,
    message: Option<String>,
}

impl Reply {
    pub fn new(result: ReplyResult) -> Self {
        Reply {
            result,
            value: None,
            message: None,
        }
    }

    pub fn found(value: impl Into<Bytes>) -> Self {
        Reply {
            result: ReplyResult::Found,
            value: Some(value.into()),
            message: None,
        }
    }

    pub fn ok_with_value(value: impl Into<Bytes>) -> Self {
        Reply {
            result: ReplyResult::Ok,
            value: Some(value.into()),
            message: None,
        }
    }

    pub fn busy() -> Self {
        Reply::new(ReplyResult::Busy)
    }

    pub fn local_error(message: impl Into<String>) -> Self {
        Reply {
            result: ReplyResult::LocalError,
            value: None,
            message: Some(message.into()),
        }
    }

    pub fn result(&self) -> ReplyResult {
        self.result
    }

    pub fn value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}
