//! Initial reply status bytes.

use crate::error::{ProtoError, Result};

/// First byte of the reply to the opening frame of a new request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InitialStatus {
    /// The command/version pair is registered; request-specific bytes may
    /// follow.
    Supported = 1,
    /// The command code is unknown to the node.
    RequestNotSupported = 2,
    /// The command code is known but the requested version is not.
    RequestVersionNotSupported = 3,
}

impl TryFrom<u8> for InitialStatus {
    type Error = ProtoError;

    /// Strict decoding: any byte outside the defined set is an error, which
    /// callers treat as a protocol violation.
    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(InitialStatus::Supported),
            2 => Ok(InitialStatus::RequestNotSupported),
            3 => Ok(InitialStatus::RequestVersionNotSupported),
            _ => Err(ProtoError::UnknownStatus { value }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            InitialStatus::Supported,
            InitialStatus::RequestNotSupported,
            InitialStatus::RequestVersionNotSupported,
        ] {
            assert_eq!(InitialStatus::try_from(status as u8).unwrap(), status);
        }
    }

    #[test]
    fn test_unknown_status_rejected() {
        assert_eq!(
            InitialStatus::try_from(0),
            Err(ProtoError::UnknownStatus { value: 0 })
        );
        assert_eq!(
            InitialStatus::try_from(23),
            Err(ProtoError::UnknownStatus { value: 23 })
        );
    }
}
