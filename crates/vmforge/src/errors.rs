//! Failure taxonomy shared across the tool.
//!
//! Every fallible subsystem funnels into one of these kinds so that `main`
//! can map a failed run onto a stable, distinct exit code. Functions still
//! return `color_eyre::Result` for plumbing; the taxonomy travels inside the
//! report chain and is recovered by downcasting.

use camino::Utf8PathBuf;

/// A classified failure. One exit code per variant.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A configuration, definition, or install-medium file is missing.
    #[error("file not found: {0}")]
    NotFound(Utf8PathBuf),

    /// A file exists but could not be read.
    #[error("reading {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A file was read but is not well-formed JSON for the expected shape.
    #[error("parsing {path}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The image tree violates a tree-wide invariant, or a node selector
    /// does not resolve.
    #[error("invalid image configuration: {0}")]
    Validation(String),

    /// The disk-image tool could not be spawned or exited non-zero.
    #[error("disk tool failed: {0}")]
    DiskTool(String),

    /// The system emulator could not be spawned.
    #[error("emulator launch failed: {0}")]
    EmulatorLaunch(String),

    /// The provisioning shell never became reachable.
    #[error("shell connect failed: {0}")]
    ShellConnect(String),

    /// A provisioning command failed under an `abort` (or exhausted
    /// `retry`) policy.
    #[error("provisioning aborted: {0}")]
    Provision(String),
}

impl Error {
    /// Exit code for this failure kind. 1 is reserved for unclassified
    /// errors, so classified kinds start at 2.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::NotFound(_) => 2,
            Error::Io { .. } => 3,
            Error::Parse { .. } => 4,
            Error::Validation(_) => 5,
            Error::DiskTool(_) => 6,
            Error::EmulatorLaunch(_) => 7,
            Error::ShellConnect(_) => 8,
            Error::Provision(_) => 9,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct() {
        let errors = [
            Error::NotFound("x".into()),
            Error::Io {
                path: "x".into(),
                source: std::io::Error::other("io"),
            },
            Error::Parse {
                path: "x".into(),
                source: serde_json::from_str::<()>("{").unwrap_err(),
            },
            Error::Validation("v".into()),
            Error::DiskTool("d".into()),
            Error::EmulatorLaunch("e".into()),
            Error::ShellConnect("s".into()),
            Error::Provision("p".into()),
        ];
        let mut codes: Vec<u8> = errors.iter().map(Error::exit_code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
        assert!(!codes.contains(&0));
        assert!(!codes.contains(&1));
    }
}
