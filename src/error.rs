//! Error handling for target-link
//!
//! This module defines the error type shared by the registry, the codecs, the
//! transports and the connection manager, plus a Result alias.
//!
//! Most variants render to the exact text shown to users in connection
//! progress and log views, so callers may match on the rendered message.

use thiserror::Error;

/// Main error type for target-link operations
#[derive(Error, Debug)]
pub enum LinkError {
    /// A fully rendered configuration error
    #[error("{0}")]
    Configuration(String),

    /// The configuration string was blank
    #[error("The config specification was empty.")]
    EmptyConfiguration,

    /// Malformed configuration string
    #[error("{0}")]
    Syntax(String),

    /// Identifier with characters outside `[A-Za-z0-9_.$]`
    #[error("Bad identifier \"{0}\".  Identifiers for Codecs, models, and transports must only contain numbers, letters, underscore, period, or $ characters.")]
    BadIdentifier(String),

    /// Identifier that is not registered
    #[error("Missing a model, transport, or codec with id=\"{0}\"")]
    MissingNode(String),

    /// The same node appears twice in one configuration
    #[error("{0} is used twice")]
    DuplicateUse(String),

    /// Parent node has no encoder side
    #[error("Invalid parent node.  \"{0}\" is not an IEncoder.")]
    NotAnEncoder(String),

    /// Child node has no decoder side
    #[error("Invalid child node.  \"{0}\" is not an IDecoder")]
    NotADecoder(String),

    /// Parent output type rejected by the child's decoder input
    #[error("Type Mismatch: {parent} output type \"{parent_type}\" is incompatible with {child} input type \"{child_type}\"")]
    OutputTypeMismatch {
        parent: String,
        parent_type: String,
        child: String,
        child_type: String,
    },

    /// Child output type rejected by the parent's encoder input
    #[error("Type Mismatch: {parent} input type \"{parent_type}\" is incompatible with {child} output type \"{child_type}\"")]
    InputTypeMismatch {
        parent: String,
        parent_type: String,
        child: String,
        child_type: String,
    },

    /// No configuration has been applied yet
    #[error("Failed to connect: There is no active configuration to connect with.")]
    NoActiveConfiguration,

    /// The active configuration contains no registered transport
    #[error("Failed to connect: There are no active transports to connect with.")]
    NoActiveTransports,

    /// A node depends on a device whose program failed to load
    #[error("Program was not loaded successfully for device=\"{0}\".")]
    ProgramNotLoaded(String),

    /// Several children were expected but none connected
    #[error("One or more codecs failed to connect without error.")]
    CodecsFailedToConnect,

    /// A required transport failed, or nothing connected
    #[error("One or more transports failed to connect without error.")]
    TransportsFailedToConnect,

    /// A required program loader failed
    #[error("One or more required programs failed to load without error.")]
    RequiredProgramsFailed,

    /// Connect sequence superseded by a disconnect
    #[error("Connection to {0} was aborted by the user.")]
    Aborted(String),

    /// A command was skipped over by a newer response
    #[error("{name} error: missing response for command sequence #{sequence}")]
    MissingResponse { name: String, sequence: u8 },

    /// Response carried a different command than the pending one
    #[error("{name} error: Command Mismatch.  Expected {expected}, but received {received}")]
    CommandMismatch {
        name: String,
        expected: u32,
        received: u32,
    },

    /// Pending command dropped by a queue reset
    #[error("Skipping response from {0} due to reset operation")]
    QueueReset(String),

    /// Error reported by the controller or device
    #[error("{0}")]
    Device(String),

    /// Protocol level failure of a packet codec
    #[error("{0}")]
    Protocol(String),

    /// Commands are still outstanding when a ping was requested
    #[error("No response from {0} controller")]
    NoResponse(String),

    /// Operation did not complete in time
    #[error("{0}")]
    Timeout(String),

    /// Failure reported by an external collaborator (port, loader, probe)
    #[error("{0}")]
    Failure(String),

    /// The owning registry or manager was disposed
    #[error("{0} was disposed")]
    Disposed(String),

    /// Errors related to settings loading/saving
    #[error("Settings error: {0}")]
    Settings(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<LinkError>,
    },
}

impl LinkError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        LinkError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Whether the error came from a connect that was superseded by a disconnect
    pub fn is_abort(&self) -> bool {
        self.to_string().contains("was aborted by the user")
    }

    /// Whether the error reports a command the device never answered
    pub fn is_missing_response(&self) -> bool {
        match self {
            LinkError::MissingResponse { .. } => true,
            LinkError::WithContext { source, .. } => source.is_missing_response(),
            _ => false,
        }
    }
}

/// Result type alias for target-link operations
pub type Result<T> = std::result::Result<T, LinkError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, serde_json::Error> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| LinkError::Serialization(e.to_string()).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| LinkError::Serialization(e.to_string()).with_context(f()))
    }
}

/// Upper-case the first character, leaving the rest untouched
pub fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LinkError::MissingNode("uart".to_string());
        assert_eq!(
            err.to_string(),
            "Missing a model, transport, or codec with id=\"uart\""
        );
    }

    #[test]
    fn test_error_with_context() {
        let err = LinkError::Failure("port busy".to_string());
        let with_ctx = err.with_context("Opening COM3");
        assert_eq!(with_ctx.to_string(), "Opening COM3: port busy");
    }

    #[test]
    fn test_type_mismatch_messages() {
        let err = LinkError::OutputTypeMismatch {
            parent: "usb".into(),
            parent_type: "buffer".into(),
            child: "json".into(),
            child_type: "string".into(),
        };
        assert_eq!(
            err.to_string(),
            "Type Mismatch: usb output type \"buffer\" is incompatible with json input type \"string\""
        );
    }

    #[test]
    fn test_abort_detection() {
        assert!(LinkError::Aborted("usb".into()).is_abort());
        assert!(!LinkError::NoActiveTransports.is_abort());
    }

    #[test]
    fn test_missing_response_through_context() {
        let err = LinkError::MissingResponse {
            name: "u2a".into(),
            sequence: 7,
        }
        .with_context("reading register");
        assert!(err.is_missing_response());
    }

    #[test]
    fn test_capitalize() {
        assert_eq!(capitalize("model id=\"uart\""), "Model id=\"uart\"");
        assert_eq!(capitalize(""), "");
    }
}
