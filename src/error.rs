/* Shared error definitions: BrailleError aggregates transport/probe/protocol
 * failures for callers that need a single error type. */
use thiserror::Error;

/* Domain-specific error variants for all driver operations. */
/*                                                                 */
/* Using explicit variants instead of opaque strings allows the    */
/* host to take structured recovery actions (e.g., reopening on    */
/* `Io` vs. logging and abandoning on `ChecksumMismatch`).         */
#[derive(Debug, Error)]
pub enum BrailleError {
    #[error("Driver {driver} does not support {spec}")]
    UnsupportedTransport { driver: &'static str, spec: String },

    #[error("Unknown driver: {0}")]
    UnknownDriver(String),

    #[error("Invalid device specification: {0}")]
    InvalidDeviceSpec(String),

    #[error("Failed to open {device}: {source}")]
    OpenFailed {
        device: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No protocol matched during probe of {driver}")]
    ProbeFailed { driver: &'static str },

    #[error("Device identity not recognized: {identity:#04x}")]
    IdentityMismatch { identity: u8 },

    #[error("Hardware timed out after {attempts} attempt(s)")]
    Timeout { attempts: u8 },

    #[error("I/O failure on {device}: {source}")]
    Io {
        device: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Device reported protocol error (code={code:#04x})")]
    Protocol { code: u8 },

    #[error("Checksum mismatch: computed {computed:#04x}, received {received:#04x}")]
    ChecksumMismatch { computed: u8, received: u8 },

    #[error("Invalid buffer size: expected at least {expected}, got {actual}")]
    BufferTooSmall { expected: usize, actual: usize },

    #[error("Operation not supported by this driver: {0}")]
    UnsupportedOperation(&'static str),
}

pub type Result<T> = std::result::Result<T, BrailleError>;

impl BrailleError {
    /* Fatal errors tear the session down; the dispatch layer folds them
     * into a RESTART indication on the next read_command. */
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BrailleError::Io { .. } | BrailleError::Timeout { .. }
        )
    }
}
