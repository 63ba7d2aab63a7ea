use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Malformed or incoherent configuration (bad URL scheme, `PongWait <= PingPeriod`, ...).
    InvalidConfig,
    /// Setup-time faults: dial timeout, handshake failure, connection refused.
    Dial,
    /// State-machine rejections: operation invalid for the current `ConnectionState`.
    State,
    /// Capacity faults: send queue full, ingress ring overflow, sustained backpressure.
    Capacity,
    /// Payload faults: serialization, deserialization, validation, oversized event.
    Payload,
    /// Runtime transport faults: read/write error, missed pong, no healthy connections.
    Transport,
    /// Propagated from a caller's cancellation or deadline.
    Canceled,
}

#[derive(Debug)]
pub struct Error {
    kind: Kind,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    backtrace: Backtrace,
}

impl Error {
    pub fn with_source<S: StdError + Send + Sync + 'static>(kind: Kind, source: S) -> Self {
        Self {
            kind,
            source: Some(Box::new(source)),
            backtrace: Backtrace::capture(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> Kind {
        self.kind
    }

    #[must_use]
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    #[must_use]
    pub fn inner(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    #[must_use]
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        let e = self.source.as_deref()?;
        e.downcast_ref::<E>()
    }

    #[must_use]
    pub fn invalid_config<S: Into<String>>(reason: S) -> Self {
        InvalidConfig {
            reason: reason.into(),
        }
        .into()
    }

    #[must_use]
    pub fn validation_failed(errors: Vec<String>) -> Self {
        ValidationFailed { errors }.into()
    }

    #[must_use]
    pub fn event_too_large(max: usize, actual: usize) -> Self {
        EventTooLarge { max, actual }.into()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => write!(f, "{:?}: {}", self.kind, src),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

macro_rules! marker_error {
    ($name:ident, $kind:expr, $display:expr) => {
        #[non_exhaustive]
        #[derive(Debug, Clone, Copy)]
        pub struct $name;

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, $display)
            }
        }

        impl StdError for $name {}

        impl From<$name> for Error {
            fn from(err: $name) -> Self {
                Error::with_source($kind, err)
            }
        }
    };
}

#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct InvalidConfig {
    pub reason: String,
}

impl fmt::Display for InvalidConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid configuration: {}", self.reason)
    }
}

impl StdError for InvalidConfig {}

impl From<InvalidConfig> for Error {
    fn from(err: InvalidConfig) -> Self {
        Error::with_source(Kind::InvalidConfig, err)
    }
}

marker_error!(DialTimeout, Kind::Dial, "dial timed out before handshake completed");
marker_error!(ConnectionRefused, Kind::Dial, "connection refused by remote endpoint");

#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct HandshakeFailed {
    pub reason: String,
}

impl fmt::Display for HandshakeFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "websocket handshake failed: {}", self.reason)
    }
}

impl StdError for HandshakeFailed {}

impl From<HandshakeFailed> for Error {
    fn from(err: HandshakeFailed) -> Self {
        Error::with_source(Kind::Dial, err)
    }
}

marker_error!(NotConnected, Kind::State, "connection is not in the Connected state");
marker_error!(AlreadyConnecting, Kind::State, "connection is already attempting to connect");
marker_error!(Closed, Kind::State, "connection is closed and cannot be reused");

#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct QueueFull {
    pub capacity: usize,
}

impl fmt::Display for QueueFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "send queue full at capacity {}", self.capacity)
    }
}

impl StdError for QueueFull {}

impl From<QueueFull> for Error {
    fn from(err: QueueFull) -> Self {
        Error::with_source(Kind::Capacity, err)
    }
}

marker_error!(RingOverflow, Kind::Capacity, "ingress ring buffer overflowed and dropped a frame");
marker_error!(Backpressure, Kind::Capacity, "transport is under sustained backpressure");

#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ValidationFailed {
    pub errors: Vec<String>,
}

impl fmt::Display for ValidationFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event validation failed: {}", self.errors.join(", "))
    }
}

impl StdError for ValidationFailed {}

impl From<ValidationFailed> for Error {
    fn from(err: ValidationFailed) -> Self {
        Error::with_source(Kind::Payload, err)
    }
}

#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct EventTooLarge {
    pub max: usize,
    pub actual: usize,
}

impl fmt::Display for EventTooLarge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "event of size {} exceeds maximum of {}",
            self.actual, self.max
        )
    }
}

impl StdError for EventTooLarge {}

impl From<EventTooLarge> for Error {
    fn from(err: EventTooLarge) -> Self {
        Error::with_source(Kind::Payload, err)
    }
}

marker_error!(PongTimeout, Kind::Transport, "no pong received within the configured window");
marker_error!(NoHealthyConnections, Kind::Transport, "no healthy connection available in the pool");

#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct Canceled;

impl fmt::Display for Canceled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation canceled")
    }
}

impl StdError for Canceled {}

impl From<Canceled> for Error {
    fn from(err: Canceled) -> Self {
        Error::with_source(Kind::Canceled, err)
    }
}

marker_error!(DeadlineExceeded, Kind::Canceled, "operation exceeded its deadline");

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::with_source(Kind::Payload, e)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::with_source(Kind::Transport, e)
    }
}
