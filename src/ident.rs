//! Trace identifier derivation
//!
//! A trace's identifier is the base64-url (no padding) encoding of the
//! 16-byte UUID the recording tool stamped into it, reported by the
//! inspector's `traceinfo` subcommand. 16 bytes encode to exactly 22
//! characters, which is what the router matches on.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::Deserialize;
use std::ffi::OsStr;
use std::fmt;
use std::path::Path;

use crate::cmd;
use crate::error::ToolError;

/// Length of an encoded trace identifier
pub const TRACE_ID_LEN: usize = 22;

/// URL-safe identifier derived from a trace's intrinsic UUID.
///
/// Stable for the trace's lifetime and unique per logical trace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TraceId(String);

impl TraceId {
    /// Encode a raw trace UUID into its identifier
    pub fn from_uuid_bytes(bytes: &[u8; 16]) -> Self {
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Validate a path segment as a trace identifier.
    ///
    /// Returns `None` unless it is exactly 22 characters from the
    /// base64-url alphabet. This is a syntactic check only; whether the
    /// trace exists is the registry's business.
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() != TRACE_ID_LEN {
            return None;
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return None;
        }
        Some(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Shape of the inspector's `traceinfo` JSON output
#[derive(Deserialize)]
struct TraceInfo {
    uuid: Vec<u8>,
}

/// Check whether a directory carries trace markers (any `db.*` file).
///
/// An unreadable path is simply not a trace; this covers plain files,
/// dangling symlinks, and directories that vanished mid-check.
pub fn looks_like_trace(dir: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    entries.flatten().any(|entry| {
        entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with("db."))
    })
}

/// Derive the identifier for a candidate trace directory.
///
/// `Ok(None)` means the directory is not a trace (a normal negative, e.g.
/// a stray file dropped into the watched root). `Err` means the inspector
/// itself failed or produced output we could not interpret; the caller
/// abandons this directory but keeps running.
pub async fn derive(inspector: &str, dir: &Path) -> Result<Option<TraceId>, ToolError> {
    if !looks_like_trace(dir) {
        return Ok(None);
    }

    let stdout =
        cmd::checked_output(inspector, [OsStr::new("traceinfo"), dir.as_os_str()]).await?;

    let info: TraceInfo =
        serde_json::from_slice(&stdout).map_err(|e| ToolError::Unparsable {
            program: inspector.to_string(),
            reason: e.to_string(),
        })?;

    let bytes: [u8; 16] = info.uuid.as_slice().try_into().map_err(|_| ToolError::Unparsable {
        program: inspector.to_string(),
        reason: format!("uuid field has {} bytes, expected 16", info.uuid.len()),
    })?;

    Ok(Some(TraceId::from_uuid_bytes(&bytes)))
}
