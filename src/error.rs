//! Unified error types for the kernel.
//!
//! A single `Error` enum that every subsystem converts into, so drivers
//! handle kernel failures uniformly. All variants are `Copy` so they can
//! be returned from registry calls and logged without allocation.
//!
//! Event delivery failures ([`DeliveryError`]) are never returned to the
//! code that raised the event. Dispatch is asynchronous, so they only
//! show up in the bus counters.

use core::fmt;

// ---------------------------------------------------------------------------
// Top-level kernel error
// ---------------------------------------------------------------------------

/// Every fallible kernel operation funnels into this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// An action, event, task, signal, function or fuse registry rejected
    /// the request.
    Registry(RegistryError),
    /// An event could not be delivered.
    Delivery(DeliveryError),
    /// A dataflow operation failed.
    Graph(GraphError),
    /// A host timer operation failed.
    Timer(TimerError),
    /// Kernel start-up failed (thread spawn, double start).
    Init(&'static str),
    /// Configuration is invalid.
    Config(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registry(e) => write!(f, "registry: {e}"),
            Self::Delivery(e) => write!(f, "delivery: {e}"),
            Self::Graph(e) => write!(f, "dataflow: {e}"),
            Self::Timer(e) => write!(f, "timer: {e}"),
            Self::Init(msg) => write!(f, "init: {msg}"),
            Self::Config(msg) => write!(f, "config: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

// ---------------------------------------------------------------------------
// Registry errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    /// The name is already registered; the first registration is kept.
    DuplicateName,
    /// No entry with that name exists.
    UnknownName,
    /// Identifier is 0, out of range, or addresses a detached slot.
    InvalidId,
    /// Name does not fit the fixed-capacity name buffer.
    NameTooLong,
    /// The 16-bit identifier space is used up.
    Exhausted,
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateName => write!(f, "duplicate name"),
            Self::UnknownName => write!(f, "unknown name"),
            Self::InvalidId => write!(f, "invalid id"),
            Self::NameTooLong => write!(f, "name too long"),
            Self::Exhausted => write!(f, "id space exhausted"),
        }
    }
}

impl From<RegistryError> for Error {
    fn from(e: RegistryError) -> Self {
        Self::Registry(e)
    }
}

// ---------------------------------------------------------------------------
// Delivery outcomes
// ---------------------------------------------------------------------------

/// Why an event did not reach its callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// Valid event without callbacks; dropped without queueing.
    Discarded,
    /// Mailbox full (ISR) or send timeout expired.
    Lost,
    /// Event id 0 or never registered.
    InvalidId,
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Discarded => write!(f, "discarded (no callbacks)"),
            Self::Lost => write!(f, "lost (mailbox full)"),
            Self::InvalidId => write!(f, "invalid event id"),
        }
    }
}

impl From<DeliveryError> for Error {
    fn from(e: DeliveryError) -> Self {
        Self::Delivery(e)
    }
}

// ---------------------------------------------------------------------------
// Dataflow errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphError {
    /// The function was evaluated before all its parameters were bound.
    UnboundParameter,
    /// No operator factory is registered for the requested kind.
    UnknownOperator,
    /// Creation argument could not be parsed.
    BadArgument(&'static str),
    /// Parameter index is beyond the operator's arity.
    ParameterIndex,
    /// Signal propagation exceeded the configured depth.
    RecursionLimit,
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnboundParameter => write!(f, "unbound parameter"),
            Self::UnknownOperator => write!(f, "unknown operator"),
            Self::BadArgument(msg) => write!(f, "bad argument: {msg}"),
            Self::ParameterIndex => write!(f, "parameter index out of range"),
            Self::RecursionLimit => write!(f, "propagation depth exceeded"),
        }
    }
}

impl From<GraphError> for Error {
    fn from(e: GraphError) -> Self {
        Self::Graph(e)
    }
}

// ---------------------------------------------------------------------------
// Timer errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerError {
    /// Interval of zero or not representable by the host timer.
    InvalidInterval,
    CreateFailed,
    StartFailed,
    StopFailed,
}

impl fmt::Display for TimerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInterval => write!(f, "invalid interval"),
            Self::CreateFailed => write!(f, "create failed"),
            Self::StartFailed => write!(f, "start failed"),
            Self::StopFailed => write!(f, "stop failed"),
        }
    }
}

impl From<TimerError> for Error {
    fn from(e: TimerError) -> Self {
        Self::Timer(e)
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Kernel-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_subsystem() {
        let e: Error = RegistryError::DuplicateName.into();
        assert_eq!(e.to_string(), "registry: duplicate name");
        let e: Error = GraphError::BadArgument("not an integer").into();
        assert_eq!(e.to_string(), "dataflow: bad argument: not an integer");
    }

    #[test]
    fn unknown_name_is_distinct_from_invalid_id() {
        assert_ne!(
            Error::from(RegistryError::UnknownName),
            Error::from(RegistryError::InvalidId)
        );
    }
}
