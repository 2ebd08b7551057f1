//! Boot stub error handling
//!
//! This module defines the error type used throughout the stub for
//! consistent error reporting. Diagnostic values (sizes, addresses, counts)
//! are logged at the failure site; the variants stay small enough to copy.

use core::fmt;

/// Boot stub error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootError {
    /// No embedded payload was linked in, or the blob is not a valid ELF image
    PayloadNotFound,

    /// Malformed payload image (bad header, truncated table, bounds violation)
    BadImage(&'static str),

    /// A read through a byte span fell outside the underlying buffer
    OutOfBounds,

    /// A loadable segment violates the platform alignment rules
    UnalignedSegment,

    /// The firmware allocator could not satisfy a request
    OutOfResources,

    /// A required firmware protocol or table is missing
    ProtocolUnavailable(&'static str),

    /// No boot hart id could be resolved from any source
    HartIdUnavailable,

    /// A firmware call failed with the given status
    Firmware(uefi::Status),
}

impl BootError {
    /// Get a human-readable description of the error
    pub fn description(&self) -> &'static str {
        match self {
            BootError::PayloadNotFound => "no bootable payload found",
            BootError::BadImage(msg) => msg,
            BootError::OutOfBounds => "read beyond end of payload",
            BootError::UnalignedSegment => "segment violates alignment rules",
            BootError::OutOfResources => "firmware allocation failed",
            BootError::ProtocolUnavailable(msg) => msg,
            BootError::HartIdUnavailable => "boot hart id not resolvable",
            BootError::Firmware(_) => "firmware call failed",
        }
    }

    /// Convert to the status returned from the EFI entry point on failure
    pub fn as_status(&self) -> uefi::Status {
        match self {
            BootError::PayloadNotFound => uefi::Status::NOT_FOUND,
            BootError::BadImage(_) => uefi::Status::LOAD_ERROR,
            BootError::OutOfBounds => uefi::Status::LOAD_ERROR,
            BootError::UnalignedSegment => uefi::Status::LOAD_ERROR,
            BootError::OutOfResources => uefi::Status::OUT_OF_RESOURCES,
            BootError::ProtocolUnavailable(_) => uefi::Status::UNSUPPORTED,
            BootError::HartIdUnavailable => uefi::Status::UNSUPPORTED,
            BootError::Firmware(status) => *status,
        }
    }
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootError::Firmware(status) => {
                write!(f, "{} ({:?})", self.description(), status)
            }
            _ => write!(f, "{}", self.description()),
        }
    }
}

/// Result type used throughout the stub
pub type Result<T = ()> = core::result::Result<T, BootError>;

impl From<uefi::Status> for BootError {
    fn from(status: uefi::Status) -> Self {
        match status {
            uefi::Status::OUT_OF_RESOURCES => BootError::OutOfResources,
            _ => BootError::Firmware(status),
        }
    }
}

impl From<uefi::Error> for BootError {
    fn from(err: uefi::Error) -> Self {
        err.status().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let err: BootError = uefi::Status::OUT_OF_RESOURCES.into();
        assert_eq!(err, BootError::OutOfResources);
        assert_eq!(err.as_status(), uefi::Status::OUT_OF_RESOURCES);

        let err: BootError = uefi::Status::DEVICE_ERROR.into();
        assert_eq!(err, BootError::Firmware(uefi::Status::DEVICE_ERROR));
        assert_eq!(err.as_status(), uefi::Status::DEVICE_ERROR);
    }

    #[test]
    fn test_description_is_stable() {
        assert_eq!(
            BootError::PayloadNotFound.description(),
            "no bootable payload found"
        );
        assert_eq!(BootError::BadImage("truncated").description(), "truncated");
    }
}
