//! How device-resident bytes reach storage.
//!
//! A device buffer is written either directly from device memory through
//! GPUDirect Storage (cuFile), or staged through a host copy and written with
//! positional POSIX I/O.
//!
//! # Detection Logic
//!
//! In `Auto` mode the storage layer probes for direct transfers by checking:
//! 1. Is this WSL? (GPUDirect Storage is not supported on WSL.)
//! 2. Is `/run/udev` readable? (Required for device detection; absent in many containers.)
//! 3. Can the cuFile driver be initialized and the object file registered?
//!
//! Buffers of the emulated host device always take the staged path.

use std::path::Path;

use crate::error::{Error, ErrorKind};

/// Controls whether device buffers are written through cuFile or a host copy.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum StagingMode {
    /// Require GPUDirect Storage. Opening an object fails if it is unavailable.
    Direct,
    /// Always copy through host memory and use POSIX I/O.
    Staged,
    /// Try GPUDirect Storage, fall back to staging (default).
    #[default]
    Auto,
}

impl StagingMode {
    /// Parse a staging mode from a string.
    ///
    /// Accepts (case-insensitive):
    /// - `"direct"`, `"gds"` → [`StagingMode::Direct`]
    /// - `"staged"`, `"host"`, `"posix"` → [`StagingMode::Staged`]
    /// - `"auto"` → [`StagingMode::Auto`]
    pub fn parse(s: &str) -> crate::error::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" | "gds" => Ok(StagingMode::Direct),
            "staged" | "host" | "posix" => Ok(StagingMode::Staged),
            "auto" => Ok(StagingMode::Auto),
            _ => Err(Error::new(
                ErrorKind::ConfigInvalid,
                format!("unknown staging mode: {s:?}"),
            )
            .with_operation("StagingMode::parse")),
        }
    }

    /// Returns `true` if a direct transfer should be attempted.
    ///
    /// In `Auto` mode this returns `true` but the caller must still verify
    /// that cuFile is actually usable for the object.
    pub fn is_direct_preferred(self) -> bool {
        self != StagingMode::Staged
    }
}

impl std::fmt::Display for StagingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StagingMode::Direct => f.write_str("direct"),
            StagingMode::Staged => f.write_str("staged"),
            StagingMode::Auto => f.write_str("auto"),
        }
    }
}

/// Check whether the system is running under WSL.
pub fn is_wsl() -> bool {
    std::fs::read_to_string("/proc/version")
        .map(|v| v.to_ascii_lowercase().contains("microsoft"))
        .unwrap_or(false)
}

/// Check whether `/run/udev` is readable.
pub fn is_udev_readable() -> bool {
    Path::new("/run/udev").is_dir()
}

/// Narrow `Auto` down to `Staged` when the environment rules out cuFile.
///
/// `Auto` stays `Auto` when a direct transfer might work; the per-object
/// registration in the storage layer makes the final call. Explicit modes are
/// returned unchanged.
pub fn resolve_staging_mode(mode: StagingMode) -> StagingMode {
    match mode {
        StagingMode::Direct | StagingMode::Staged => mode,
        StagingMode::Auto => {
            if is_wsl() || !is_udev_readable() {
                StagingMode::Staged
            } else {
                StagingMode::Auto
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ---- Parsing ----

    #[test]
    fn test_parse_direct_variants() {
        for s in &["direct", "DIRECT", "gds", "Gds"] {
            assert_eq!(StagingMode::parse(s).unwrap(), StagingMode::Direct, "{s:?}");
        }
    }

    #[test]
    fn test_parse_staged_variants() {
        for s in &["staged", "Staged", "host", "posix", "POSIX"] {
            assert_eq!(StagingMode::parse(s).unwrap(), StagingMode::Staged, "{s:?}");
        }
    }

    #[test]
    fn test_parse_auto_and_whitespace() {
        assert_eq!(StagingMode::parse("auto").unwrap(), StagingMode::Auto);
        assert_eq!(StagingMode::parse("\tAUTO\n").unwrap(), StagingMode::Auto);
    }

    #[test]
    fn test_parse_invalid() {
        let err = StagingMode::parse("sometimes").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
        assert!(err.message().contains("unknown staging mode"));
    }

    // ---- Display / helpers ----

    #[test]
    fn test_display_round_trips_through_parse() {
        for mode in [StagingMode::Direct, StagingMode::Staged, StagingMode::Auto] {
            assert_eq!(StagingMode::parse(&mode.to_string()).unwrap(), mode);
        }
    }

    #[test]
    fn test_default_is_auto() {
        assert_eq!(StagingMode::default(), StagingMode::Auto);
    }

    #[test]
    fn test_is_direct_preferred() {
        assert!(StagingMode::Direct.is_direct_preferred());
        assert!(!StagingMode::Staged.is_direct_preferred());
        assert!(StagingMode::Auto.is_direct_preferred());
    }

    // ---- Resolution ----

    #[test]
    fn test_resolve_explicit_modes_unchanged() {
        assert_eq!(resolve_staging_mode(StagingMode::Direct), StagingMode::Direct);
        assert_eq!(resolve_staging_mode(StagingMode::Staged), StagingMode::Staged);
    }

    #[test]
    fn test_resolve_auto_never_forces_direct() {
        let resolved = resolve_staging_mode(StagingMode::Auto);
        assert!(resolved == StagingMode::Auto || resolved == StagingMode::Staged);
    }
}
