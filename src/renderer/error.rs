//! Renderer error types.
//!
//! Every fallible operation in the renderer returns a [`RenderResult`]. The error carries an
//! [`ErrorKind`] that decides whether the renderer can keep going, plus the human-readable
//! message that the client-facing layer stores for later retrieval.

use std::fmt;
use thiserror::Error;

/// Severity class of a [`RenderError`].
///
/// Negative codes are fatal and the renderer must be torn down. Positive codes are
/// recoverable and leave every internal structure in a consistent state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Unclassified fatal failure
    Failure,
    /// The window system could not provide a renderable surface
    CriticalWindow,
    /// No physical device satisfies the renderer's requirements
    NoDevice,
    /// Device lost, bootstrap failure, or a failed frame submission
    CriticalVulkan,
    /// Recoverable window-system failure
    Window,
    /// Recoverable GPU failure, e.g. a single allocation request ran out of memory
    Vulkan,
    /// The caller broke an API contract (frame state, sizes, stale handles)
    InvalidUsage,
}

impl ErrorKind {
    pub const fn code(self) -> i32 {
        match self {
            ErrorKind::Failure => -1,
            ErrorKind::CriticalWindow => -2,
            ErrorKind::NoDevice => -3,
            ErrorKind::CriticalVulkan => -4,
            ErrorKind::Window => 1,
            ErrorKind::Vulkan => 2,
            ErrorKind::InvalidUsage => 3,
        }
    }

    pub const fn is_fatal(self) -> bool {
        self.code() < 0
    }
}

/// Error raised by renderer operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct RenderError {
    kind: ErrorKind,
    message: String,
}

impl RenderError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Fatal GPU error.
    pub fn critical(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CriticalVulkan, message)
    }

    /// Recoverable GPU error.
    pub fn vulkan(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Vulkan, message)
    }

    pub fn invalid_usage(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidUsage, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_fatal(&self) -> bool {
        self.kind.is_fatal()
    }

    /// Prefixes the message with `context`, keeping the kind.
    pub fn context(self, context: impl fmt::Display) -> Self {
        Self {
            kind: self.kind,
            message: format!("{context}, {}", self.message),
        }
    }

    /// Reclassifies the error, keeping the message.
    pub fn with_kind(self, kind: ErrorKind) -> Self {
        Self { kind, ..self }
    }
}

pub type RenderResult<T> = Result<T, RenderError>;

/// Converts foreign errors (`vk::Result`, allocator errors, eyre reports) into [`RenderError`]s.
pub trait ResultExt<T> {
    fn or_kind(self, kind: ErrorKind, context: &str) -> RenderResult<T>;

    fn recoverable(self, context: &str) -> RenderResult<T>
    where
        Self: Sized,
    {
        self.or_kind(ErrorKind::Vulkan, context)
    }

    fn critical(self, context: &str) -> RenderResult<T>
    where
        Self: Sized,
    {
        self.or_kind(ErrorKind::CriticalVulkan, context)
    }

    fn no_device(self, context: &str) -> RenderResult<T>
    where
        Self: Sized,
    {
        self.or_kind(ErrorKind::NoDevice, context)
    }

    /// Window failures during bootstrap leave nothing to recover, so they are critical.
    fn window(self, context: &str) -> RenderResult<T>
    where
        Self: Sized,
    {
        self.or_kind(ErrorKind::CriticalWindow, context)
    }
}

impl<T, E: fmt::Display> ResultExt<T> for Result<T, E> {
    fn or_kind(self, kind: ErrorKind, context: &str) -> RenderResult<T> {
        self.map_err(|e| RenderError::new(kind, format!("{context}, {e}")))
    }
}
