use thiserror::Error;

/// Errors raised by the EtherCAT master and the link built on top of it.
///
/// Variants are grouped by the layer that produces them: transport,
/// discovery, protocol, state machine, and recovery.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EmemError {
    /// The network adapter could not be opened.
    #[error("failed to open adapter {adapter}: {reason}")]
    AdapterOpen {
        /// Adapter name.
        adapter: String,
        /// OS or backend error text.
        reason: String,
    },

    /// No adapter with the expected slave chain was found.
    #[error("no adapter with {expected} EtherCAT slave(s) found")]
    AdapterNotFound {
        /// Number of slaves the caller asked for.
        expected: usize,
    },

    /// Frame transmission failed.
    #[error("failed to send frame: {0}")]
    SendFailed(String),

    /// No frame arrived before the timeout.
    #[error("no frame received")]
    NoFrame,

    /// A frame arrived that belongs to another transaction.
    #[error("received frame for another transaction")]
    UnknownFrame,

    /// Discovery found no slaves on the wire.
    #[error("no slaves found")]
    NoSlaves,

    /// Discovery found more slaves than the master supports.
    #[error("too many slaves: found {found}, maximum {max}")]
    TooManySlaves {
        /// Number of slaves that answered.
        found: usize,
        /// Supported maximum.
        max: usize,
    },

    /// Discovered slave count differs from the requested topology.
    #[error("slave count mismatch: expected {expected}, found {found}")]
    SlaveCountMismatch {
        /// Devices in the requested topology.
        expected: usize,
        /// Slaves that answered.
        found: usize,
    },

    /// Malformed frame or unexpected protocol response.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Every transmit buffer is in flight.
    #[error("all {0} frame buffers are in use")]
    BuffersExhausted(usize),

    /// A buffer was moved through an illegal state transition.
    #[error("buffer {index}: invalid transition from {from} to {to}")]
    InvalidBufferTransition {
        /// Buffer index.
        index: u8,
        /// Current state.
        from: String,
        /// Requested state.
        to: String,
    },

    /// A slave (or the whole chain) did not reach a requested state.
    #[error("{target} did not reach {expected} (current: {actual})")]
    StateNotReached {
        /// `"all slaves"` or `"slave N"`.
        target: String,
        /// Requested state.
        expected: String,
        /// Last observed state.
        actual: String,
    },

    /// A lost slave could not be brought back.
    #[error("slave {0} could not be recovered")]
    NotRecovered(usize),

    /// A different device answered at the slave's position.
    #[error("slave {slave}: found station address {found:#06x} at its position")]
    WrongSlave {
        /// Slave index.
        slave: usize,
        /// Address read back.
        found: u16,
    },

    /// Configuration or initialization error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O operation error.
    #[error("I/O error: {0}")]
    Io(String),

    /// The link is not open.
    #[error("link is closed")]
    LinkClosed,
}

impl EmemError {
    /// Whether the error comes from the transport layer and may clear on retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NoFrame | Self::UnknownFrame | Self::SendFailed(_))
    }
}

impl From<std::io::Error> for EmemError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Convenience type alias for master and link operations.
pub type EmemResult<T> = Result<T, EmemError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EmemError::SlaveCountMismatch {
            expected: 2,
            found: 1,
        };
        assert_eq!(err.to_string(), "slave count mismatch: expected 2, found 1");

        let err = EmemError::StateNotReached {
            target: "slave 3".into(),
            expected: "OP".into(),
            actual: "SAFE_OP + ERROR".into(),
        };
        assert_eq!(
            err.to_string(),
            "slave 3 did not reach OP (current: SAFE_OP + ERROR)"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(EmemError::NoFrame.is_transient());
        assert!(EmemError::SendFailed("down".into()).is_transient());
        assert!(!EmemError::NoSlaves.is_transient());
        assert!(!EmemError::NotRecovered(0).is_transient());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "raw socket");
        let err: EmemError = io.into();
        assert!(matches!(err, EmemError::Io(msg) if msg.contains("raw socket")));
    }
}
