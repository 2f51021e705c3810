//! Error types for the radarfleet library.

use thiserror::Error;

/// The main error type for radarfleet operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Serial port error.
    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame encoding/decoding error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Declared and actual payload sizes disagree.
    #[error("payload size mismatch: expected {expected} bytes, got {actual}")]
    PayloadSizeMismatch { expected: usize, actual: usize },

    /// A text value received from the device is not UTF-8.
    #[error("invalid text value: {0}")]
    InvalidText(#[from] std::str::Utf8Error),

    /// The response does not start with the command that was sent.
    #[error("command mismatch: expected {expected}, got {actual}")]
    CommandMismatch { expected: String, actual: String },

    /// Writing a request did not complete in time.
    #[error("transmit timed out after {timeout_ms}ms")]
    TransmitTimeout { timeout_ms: u64 },

    /// No complete response frame arrived in time.
    #[error("receive timed out after {timeout_ms}ms")]
    ReceiveTimeout { timeout_ms: u64 },

    /// Connection is not established.
    #[error("not connected")]
    NotConnected,

    /// A request is already in flight on this device.
    #[error("session busy")]
    Busy,

    /// The device answered the identity inquiry with an unexpected id.
    #[error("identity mismatch: expected {expected}, got {actual}")]
    IdentityMismatch { expected: String, actual: String },

    /// An attached script failed.
    #[error("script '{script}' failed: {reason}")]
    ScriptExecution { script: String, reason: String },

    /// The device was halted and ignores triggers until set idle again.
    #[error("device halted")]
    PolicyHalt,

    /// Order indices within a command group are not contiguous.
    #[error("command group {command} has an order gap at index {index}")]
    GroupOrderGap { command: String, index: u16 },

    /// Members of one command group declare different directions.
    #[error("command group {command} mixes parameter directions")]
    MixedDirection { command: String },

    /// A parameter definition is inconsistent.
    #[error("invalid parameter '{name}': {reason}")]
    InvalidParam { name: String, reason: String },

    /// The requested trigger is not legal in the current state.
    #[error("cannot {trigger} from state {from}")]
    InvalidTransition {
        from: &'static str,
        trigger: &'static str,
    },

    /// Another fleet already runs this project.
    #[error("project '{0}' is already running")]
    AlreadyRunning(String),

    /// No device with this id is attached.
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    /// A device with this id is already attached.
    #[error("device already attached: {0}")]
    DuplicateDevice(String),

    /// Channel receive error.
    #[error("channel closed")]
    ChannelClosed,
}

/// Frame-specific errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Frame too short to contain both delimiters.
    #[error("frame too short: need at least 2 bytes, got {0}")]
    TooShort(usize),

    /// First byte is not the start delimiter.
    #[error("frame does not begin with the start byte")]
    MissingStart,

    /// Last byte is not the stop delimiter.
    #[error("frame does not end with the stop byte")]
    MissingStop,

    /// Escape byte followed by an unrecognised code.
    #[error("invalid escape code 0x{byte:02x}")]
    BadEscape { byte: u8 },

    /// Escape byte directly before the stop delimiter.
    #[error("escape byte at end of payload")]
    TrailingEscape,
}

/// Result type alias for radarfleet operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns true for transmit or receive timeouts.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::TransmitTimeout { .. } | Self::ReceiveTimeout { .. }
        )
    }

    /// Returns true for errors caused by the content of a response
    /// (framing, size, text encoding or command prefix).
    #[must_use]
    pub const fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::Frame(_)
                | Self::PayloadSizeMismatch { .. }
                | Self::InvalidText(_)
                | Self::CommandMismatch { .. }
        )
    }
}
