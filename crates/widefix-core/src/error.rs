use thiserror::Error;

use crate::scanner::MemoryRegion;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Signature not found for site '{site}': {pattern}")]
    SignatureNotFound { site: String, pattern: String },

    #[error("Module not found: {module} (after {attempts} attempts)")]
    ModuleNotFound { module: String, attempts: u32 },

    #[error("Patch of {len} bytes at {address:#x} falls outside {region}")]
    PatchOutOfBounds {
        address: usize,
        len: usize,
        region: MemoryRegion,
    },

    #[error("Patch '{second}' overwrites bytes of '{first}' at {address:#x}")]
    PatchOverlap {
        first: String,
        second: String,
        address: usize,
    },

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    #[error("Failed to install hook at {address:#x}: {reason}")]
    HookInstall { address: usize, reason: String },

    #[error("Failed to change memory protection at {address:#x}: {message}")]
    MemoryProtect { address: usize, message: String },

    #[error("Failed to allocate executable memory near {near:#x}")]
    AllocationFailed { near: usize },

    #[error("Failed to decode instruction at {address:#x}")]
    Decode { address: usize },

    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check if this error is a "file not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }

    /// Whether the error means the target build is not the one a profile was written for.
    ///
    /// Missing signatures and missing modules are expected on unsupported game
    /// versions; everything else points at a bug or a broken environment.
    pub fn is_unsupported_target(&self) -> bool {
        matches!(
            self,
            Error::SignatureNotFound { .. } | Error::ModuleNotFound { .. }
        )
    }
}

impl From<iced_x86::IcedError> for Error {
    fn from(e: iced_x86::IcedError) -> Self {
        Error::HookInstall {
            address: 0,
            reason: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_config_is_not_found() {
        let missing: Error = std::fs::read("/nonexistent/widefix.toml").unwrap_err().into();
        assert!(missing.is_not_found());
        assert!(!missing.is_unsupported_target());

        let denied = Error::Io(std::io::ErrorKind::PermissionDenied.into());
        assert!(!denied.is_not_found());
    }

    #[test]
    fn test_unsupported_target_classification() {
        let missing = Error::SignatureNotFound {
            site: "hfov".to_string(),
            pattern: "D9 05 ?? ?? ?? ??".to_string(),
        };
        assert!(missing.is_unsupported_target());

        let oob = Error::PatchOutOfBounds {
            address: 0x2000,
            len: 4,
            region: MemoryRegion::new(0x1000, 0x10),
        };
        assert!(!oob.is_unsupported_target());
        assert_eq!(
            oob.to_string(),
            "Patch of 4 bytes at 0x2000 falls outside [0x1000..0x1010)"
        );
    }
}
