use thiserror::Error;

/// Fine-delay error types covering configuration, hardware faults, and pipeline conditions.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FdError {
    /// Configuration rejected at construction time.
    #[error("configuration error: {0}")]
    Config(String),

    /// Fatal hardware condition (bus self-test, lock loss, wrong gateware).
    #[error("hardware fault: {0}")]
    HardwareFault(String),

    /// Ring buffer saturated; the oldest half of the buffered samples was dropped.
    #[error("ring buffer overflow: {dropped} samples dropped")]
    Overflow {
        /// Number of samples discarded.
        dropped: usize,
    },

    /// A bounded wait for a status bit expired.
    #[error("timeout waiting for {what} after {waited_ms}ms")]
    Timeout {
        /// What was being waited for.
        what: String,
        /// How long the wait lasted.
        waited_ms: u64,
    },

    /// A calibration run failed; the previous calibration stays in effect.
    #[error("calibration of channel {channel} failed: {reason}")]
    Calibration {
        /// External channel number (1..4).
        channel: u8,
        /// Failure description.
        reason: String,
    },

    /// Invalid state transition attempted.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Source state.
        from: String,
        /// Attempted target state.
        to: String,
    },
}

impl FdError {
    /// Escalate an expired wait into a fatal hardware fault.
    ///
    /// Other variants pass through unchanged.
    #[must_use]
    pub fn into_hardware_fault(self) -> Self {
        match self {
            Self::Timeout { what, waited_ms } => {
                Self::HardwareFault(format!("{what} not reached within {waited_ms}ms"))
            }
            other => other,
        }
    }

    /// Returns true if this error must abort initialization.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::HardwareFault(_) | Self::Timeout { .. })
    }
}

/// Convenience type alias for fine-delay operations.
pub type FdResult<T> = Result<T, FdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_escalates_to_hardware_fault() {
        let err = FdError::Timeout {
            what: "TDC PLL lock".into(),
            waited_ms: 2000,
        };
        assert!(err.is_fatal());
        let escalated = err.into_hardware_fault();
        assert_eq!(
            escalated,
            FdError::HardwareFault("TDC PLL lock not reached within 2000ms".into())
        );
    }

    #[test]
    fn test_non_timeout_passes_through() {
        let err = FdError::Overflow { dropped: 4 };
        assert!(!err.is_fatal());
        assert_eq!(err.clone().into_hardware_fault(), err);
        assert_eq!(err.to_string(), "ring buffer overflow: 4 samples dropped");
    }
}
