//! Per-trace page cache
//!
//! The two entry pages are shipped inside the application image, so the
//! first request for each (trace, page) pair reads the file out of the
//! live container, substitutes the placeholders, and keeps the bytes for
//! the rest of the process lifetime. A trace whose container has gone away
//! is simply unavailable; the router turns that into a 404.

use dashmap::DashMap;
use hyper::body::Bytes;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::ident::TraceId;
use crate::registry::TraceRegistry;
use crate::runtime::ContainerRuntime;

/// Protocol version between the entry pages and the application server
pub const PROTOCOL_VERSION: &str = "33";

/// Placeholder in the shipped HTML replaced with [`PROTOCOL_VERSION`]
const PROTOCOL_VERSION_TOKEN: &str = "__PROTOCOL_VERSION__";
/// Placeholder replaced with the configured static-asset base URL
const STATIC_BASE_TOKEN: &str = "__STATIC_BASE__";

/// The pages the lobby serves itself; everything else is the reverse
/// proxy's business. Kind-specific policy lives here as data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Index,
    SourceViewer,
}

impl ResourceKind {
    /// Last path segment that selects this page
    pub fn suffix(self) -> &'static str {
        match self {
            ResourceKind::Index => "index.html",
            ResourceKind::SourceViewer => "source-viewer.html",
        }
    }

    /// Where the page lives inside the application container
    pub fn container_path(self) -> &'static str {
        match self {
            ResourceKind::Index => "/app/html/index.html",
            ResourceKind::SourceViewer => "/app/html/source-viewer.html",
        }
    }

    /// Framing policy: the source viewer is embedded by the index page,
    /// the index page is never framed.
    pub fn frame_options(self) -> &'static str {
        match self {
            ResourceKind::Index => "DENY",
            ResourceKind::SourceViewer => "SAMEORIGIN",
        }
    }

    pub fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "index.html" => Some(ResourceKind::Index),
            "source-viewer.html" => Some(ResourceKind::SourceViewer),
            _ => None,
        }
    }
}

/// Fill-on-miss cache of rendered page bodies keyed by (trace, page)
pub struct PageCache {
    registry: Arc<TraceRegistry>,
    runtime: Arc<ContainerRuntime>,
    static_base_url: String,
    pages: DashMap<(TraceId, ResourceKind), Arc<OnceCell<Bytes>>>,
}

impl PageCache {
    pub fn new(
        registry: Arc<TraceRegistry>,
        runtime: Arc<ContainerRuntime>,
        static_base_url: String,
    ) -> Self {
        Self {
            registry,
            runtime,
            static_base_url,
            pages: DashMap::new(),
        }
    }

    /// Fetch the page body for a trace, filling the cache on first use.
    ///
    /// `None` means the trace is not registered or the container read
    /// failed; the caller answers 404 either way. Concurrent requests for
    /// the same key share one fill through the per-key cell, so at most one
    /// container read completes per key; a failed fill caches nothing and
    /// the next request retries.
    pub async fn get(&self, kind: ResourceKind, id: &TraceId) -> Option<Bytes> {
        let cell = self
            .pages
            .entry((id.clone(), kind))
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        cell.get_or_try_init(|| self.fill(kind, id))
            .await
            .ok()
            .cloned()
    }

    async fn fill(&self, kind: ResourceKind, id: &TraceId) -> Result<Bytes, ()> {
        // The lookup happens at fill time, not request time: once filled,
        // serving the page never touches the registry or the container.
        let entry = self.registry.lookup(id).ok_or(())?;

        let raw = self
            .runtime
            .read_file(&entry.container, kind.container_path())
            .await
            .map_err(|e| {
                warn!(trace = %id, page = kind.suffix(), error = %e, "Failed to read page from container");
            })?;

        let html = String::from_utf8_lossy(&raw);
        let rendered = substitute(&html, PROTOCOL_VERSION, &self.static_base_url);
        debug!(trace = %id, page = kind.suffix(), bytes = rendered.len(), "Cached page");
        Ok(Bytes::from(rendered))
    }
}

/// Replace the two literal placeholders the entry pages carry
fn substitute(html: &str, protocol_version: &str, static_base_url: &str) -> String {
    html.replace(PROTOCOL_VERSION_TOKEN, protocol_version)
        .replace(STATIC_BASE_TOKEN, static_base_url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TraceEntry;
    use crate::runtime::ContainerHandle;
    use std::fs;
    use std::path::{Path, PathBuf};

    #[test]
    fn test_substitute_replaces_both_tokens() {
        let html = "<script src=\"__STATIC_BASE__/app.js\"></script>\
                    <meta name=\"proto\" content=\"__PROTOCOL_VERSION__\">";
        let out = substitute(html, "33", "https://static.example.com");
        assert_eq!(
            out,
            "<script src=\"https://static.example.com/app.js\"></script>\
             <meta name=\"proto\" content=\"33\">"
        );
    }

    #[test]
    fn test_substitute_replaces_repeated_tokens() {
        let out = substitute("__STATIC_BASE__ __STATIC_BASE__", "1", "X");
        assert_eq!(out, "X X");
    }

    #[test]
    fn test_kind_policy() {
        assert_eq!(ResourceKind::Index.frame_options(), "DENY");
        assert_eq!(ResourceKind::SourceViewer.frame_options(), "SAMEORIGIN");
        assert_eq!(ResourceKind::from_suffix("index.html"), Some(ResourceKind::Index));
        assert_eq!(
            ResourceKind::from_suffix("source-viewer.html"),
            Some(ResourceKind::SourceViewer)
        );
        assert_eq!(ResourceKind::from_suffix("admin.html"), None);
        assert_eq!(ResourceKind::from_suffix(""), None);
    }

    #[cfg(unix)]
    fn fake_runtime(dir: &Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-runtime");
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path.to_str().unwrap().to_string()
    }

    #[cfg(unix)]
    fn registered(registry: &TraceRegistry) -> TraceId {
        let id = TraceId::from_uuid_bytes(&[9; 16]);
        registry
            .register(TraceEntry {
                id: id.clone(),
                dir: PathBuf::from("/traces/cached"),
                container: ContainerHandle {
                    id: "c9".to_string(),
                    name: "tracegate-c9".to_string(),
                },
            })
            .unwrap();
        id
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fill_once_then_serve_from_cache() {
        let tools = tempfile::tempdir().unwrap();
        let count = tools.path().join("execs");
        let runtime = Arc::new(ContainerRuntime::new(fake_runtime(
            tools.path(),
            &format!(
                "echo x >> {}\necho '<html>__PROTOCOL_VERSION__ __STATIC_BASE__</html>'",
                count.display()
            ),
        )));
        let registry = Arc::new(TraceRegistry::new());
        let id = registered(&registry);
        let cache = PageCache::new(registry, runtime, "https://static.example.com".to_string());

        let first = cache.get(ResourceKind::Index, &id).await.unwrap();
        assert_eq!(
            first.as_ref(),
            b"<html>33 https://static.example.com</html>\n"
        );

        let second = cache.get(ResourceKind::Index, &id).await.unwrap();
        assert_eq!(first, second);

        // Exactly one container read happened
        assert_eq!(fs::read_to_string(&count).unwrap().lines().count(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unregistered_trace_is_unavailable() {
        let tools = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ContainerRuntime::new(fake_runtime(
            tools.path(),
            "echo '<html></html>'",
        )));
        let registry = Arc::new(TraceRegistry::new());
        let cache = PageCache::new(registry, runtime, "https://static.example.com".to_string());

        let id = TraceId::from_uuid_bytes(&[1; 16]);
        assert!(cache.get(ResourceKind::Index, &id).await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_fill_retries_next_time() {
        let tools = tempfile::tempdir().unwrap();
        // Fails on the first invocation, succeeds afterwards
        let marker = tools.path().join("ran-once");
        let runtime = Arc::new(ContainerRuntime::new(fake_runtime(
            tools.path(),
            &format!(
                "if [ -f {m} ]; then echo '<html>ok</html>'; else touch {m}; exit 1; fi",
                m = marker.display()
            ),
        )));
        let registry = Arc::new(TraceRegistry::new());
        let id = registered(&registry);
        let cache = PageCache::new(registry, runtime, "https://static.example.com".to_string());

        assert!(cache.get(ResourceKind::Index, &id).await.is_none());
        let body = cache.get(ResourceKind::Index, &id).await.unwrap();
        assert_eq!(body.as_ref(), b"<html>ok</html>\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kinds_cached_independently() {
        let tools = tempfile::tempdir().unwrap();
        // Echo the requested path so the two kinds produce different bodies
        let runtime = Arc::new(ContainerRuntime::new(fake_runtime(
            tools.path(),
            r#"echo "<html>$4</html>""#,
        )));
        let registry = Arc::new(TraceRegistry::new());
        let id = registered(&registry);
        let cache = PageCache::new(registry, runtime, "https://static.example.com".to_string());

        let index = cache.get(ResourceKind::Index, &id).await.unwrap();
        let viewer = cache.get(ResourceKind::SourceViewer, &id).await.unwrap();
        assert_ne!(index, viewer);
        assert!(std::str::from_utf8(&index).unwrap().contains("index.html"));
        assert!(std::str::from_utf8(&viewer)
            .unwrap()
            .contains("source-viewer.html"));
    }
}
