//! Error taxonomy for the lobby

use std::path::PathBuf;
use thiserror::Error;

use crate::ident::TraceId;

/// An external process (trace inspector or container runtime) failed.
///
/// These are fatal to the single unit of work that invoked the tool, never
/// to the watcher loop or the serve loop.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The program could not be launched at all
    #[error("failed to launch `{program}`: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The program ran but exited non-zero
    #[error("`{program}` exited with {code}: {stderr}")]
    Failed {
        program: String,
        /// Exit code, or "signal" when terminated without one
        code: String,
        stderr: String,
    },

    /// The program produced output we could not interpret
    #[error("unparsable output from `{program}`: {reason}")]
    Unparsable { program: String, reason: String },
}

/// A registry insert violated the one-entry-per-key invariant.
///
/// Should not occur under single-writer discipline; the watcher logs it and
/// cleans up the container it started for the rejected entry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("trace `{0}` is already registered")]
    DuplicateId(TraceId),

    #[error("directory `{}` is already registered", .0.display())]
    DuplicateDir(PathBuf),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_error_display() {
        let err = ToolError::Failed {
            program: "rr".to_string(),
            code: "1".to_string(),
            stderr: "no trace found".to_string(),
        };
        assert_eq!(err.to_string(), "`rr` exited with 1: no trace found");

        let err = ToolError::Unparsable {
            program: "rr".to_string(),
            reason: "missing uuid field".to_string(),
        };
        assert!(err.to_string().contains("unparsable output"));
    }

    #[test]
    fn test_registry_error_display() {
        let err = RegistryError::DuplicateDir(PathBuf::from("/traces/foo"));
        assert_eq!(err.to_string(), "directory `/traces/foo` is already registered");
    }
}
