//! Container lifecycle management via the configured runtime binary
//!
//! The lobby drives containers through a runtime CLI (`docker`, `podman`,
//! ...) with a fixed verb set: `run`, `stop`, `rm`, `exec`. Start and stop
//! are split from forced removal so a graceful stop can be attempted first
//! while `remove` guarantees nothing is left behind.

use std::path::Path;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cmd;
use crate::error::ToolError;
use crate::ident::TraceId;

/// Destination of the read-only trace mount inside the container
const TRACE_MOUNT: &str = "/trace";
/// Destination of the optional read-write persistent-storage mount
const STORAGE_MOUNT: &str = "/storage";

/// Handle to a running container.
///
/// `id` is the runtime-assigned identifier captured from `run`'s stdout and
/// is what the `stop`/`rm`/`exec` verbs operate on; `name` is the unique
/// name we generated, kept for logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
}

/// Launch parameters for a per-trace application container
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Application image to run
    pub image: String,
    /// Host directory bind-mounted read-write for persistent state;
    /// absent means the trace loses state across container restarts
    pub storage_dir: Option<std::path::PathBuf>,
    /// Environment variables injected into the container
    pub env: Vec<(String, String)>,
}

/// Invokes the container runtime binary
pub struct ContainerRuntime {
    binary: String,
}

impl ContainerRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Start the application container for one trace.
    ///
    /// The container gets a private tmpfs, default seccomp confinement
    /// disabled (the workload needs low-level tracing syscalls), the trace
    /// directory mounted read-only, and routing labels the reverse-proxy
    /// sidecar turns into a strip-prefix rule for `/debug/{id}/`.
    pub async fn start_trace(
        &self,
        id: &TraceId,
        source_dir: &Path,
        options: &LaunchOptions,
    ) -> Result<ContainerHandle, ToolError> {
        let name = format!("tracegate-{}", Uuid::new_v4().simple());

        let mut args: Vec<String> = vec![
            "run".into(),
            "--detach".into(),
            "--name".into(),
            name.clone(),
            "--tmpfs".into(),
            "/tmp".into(),
            "--security-opt".into(),
            "seccomp=unconfined".into(),
            "--mount".into(),
            format!(
                "type=bind,source={},destination={},readonly,bind-propagation=rslave",
                source_dir.display(),
                TRACE_MOUNT
            ),
        ];

        if let Some(storage) = &options.storage_dir {
            args.push("--mount".into());
            args.push(format!(
                "type=bind,source={},destination={},bind-propagation=rslave",
                storage.display(),
                STORAGE_MOUNT
            ));
        }

        for (key, value) in &options.env {
            args.push("--env".into());
            args.push(format!("{}={}", key, value));
        }

        for label in routing_labels(id) {
            args.push("--label".into());
            args.push(label);
        }

        args.push(options.image.clone());

        let stdout = cmd::checked_output(&self.binary, &args).await?;
        let id_line = String::from_utf8_lossy(&stdout).trim().to_string();
        if id_line.is_empty() {
            return Err(ToolError::Unparsable {
                program: self.binary.clone(),
                reason: "`run` printed no container id".to_string(),
            });
        }

        info!(trace = %id, container = %id_line, name, "Started trace container");
        Ok(ContainerHandle { id: id_line, name })
    }

    /// Start an arbitrary detached container (used for the reverse-proxy
    /// sidecar). `flags` go between `run --detach --name <name>` and the
    /// image.
    pub async fn run_detached(
        &self,
        name: &str,
        flags: &[String],
        image: &str,
        command: &[String],
    ) -> Result<ContainerHandle, ToolError> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "--detach".into(),
            "--name".into(),
            name.to_string(),
        ];
        args.extend_from_slice(flags);
        args.push(image.to_string());
        args.extend_from_slice(command);

        let stdout = cmd::checked_output(&self.binary, &args).await?;
        let id_line = String::from_utf8_lossy(&stdout).trim().to_string();
        if id_line.is_empty() {
            return Err(ToolError::Unparsable {
                program: self.binary.clone(),
                reason: "`run` printed no container id".to_string(),
            });
        }

        Ok(ContainerHandle {
            id: id_line,
            name: name.to_string(),
        })
    }

    /// Request graceful shutdown. Best-effort; the caller treats failure as
    /// non-fatal because `remove` is authoritative.
    pub async fn stop(&self, handle: &ContainerHandle) -> Result<(), ToolError> {
        cmd::checked_output(&self.binary, ["stop", handle.id.as_str()]).await?;
        debug!(container = %handle.id, name = %handle.name, "Stopped container");
        Ok(())
    }

    /// Force-remove the container and its volumes.
    ///
    /// Idempotent: a container that is already gone counts as success.
    pub async fn remove(&self, handle: &ContainerHandle) -> Result<(), ToolError> {
        match cmd::checked_output(
            &self.binary,
            ["rm", "--force", "--volumes", handle.id.as_str()],
        )
        .await
        {
            Ok(_) => {
                debug!(container = %handle.id, name = %handle.name, "Removed container");
                Ok(())
            }
            Err(ToolError::Failed { ref stderr, .. }) if is_already_gone(stderr) => {
                debug!(container = %handle.id, "Container already removed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Read a file from inside a running container
    pub async fn read_file(
        &self,
        handle: &ContainerHandle,
        path: &str,
    ) -> Result<Vec<u8>, ToolError> {
        cmd::checked_output(&self.binary, ["exec", handle.id.as_str(), "cat", path]).await
    }
}

/// Reverse-proxy routing labels for one trace container: a path-prefix rule
/// keyed by the identifier, raised above the default priority, with a
/// middleware that strips the prefix before forwarding.
fn routing_labels(id: &TraceId) -> Vec<String> {
    vec![
        "traefik.enable=true".to_string(),
        format!(
            "traefik.http.routers.{id}.rule=PathPrefix(`/debug/{id}/`)",
            id = id
        ),
        format!("traefik.http.routers.{id}.priority=20", id = id),
        format!("traefik.http.routers.{id}.middlewares={id}-strip", id = id),
        format!(
            "traefik.http.middlewares.{id}-strip.stripprefix.prefixes=/debug/{id}",
            id = id
        ),
    ]
}

/// Match the runtime's "container doesn't exist" errors (docker and podman
/// word it differently)
fn is_already_gone(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("no such container") || lower.contains("no container with")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_routing_labels_reference_identifier() {
        let id = TraceId::parse("AbCdEfGhIjKlMnOpQrStUv").unwrap();
        let labels = routing_labels(&id);
        assert!(labels
            .iter()
            .any(|l| l.contains("PathPrefix(`/debug/AbCdEfGhIjKlMnOpQrStUv/`)")));
        assert!(labels
            .iter()
            .any(|l| l.contains("stripprefix.prefixes=/debug/AbCdEfGhIjKlMnOpQrStUv")));
        assert!(labels.iter().any(|l| l.contains("priority=20")));
    }

    #[test]
    fn test_is_already_gone() {
        assert!(is_already_gone("Error: No such container: abc123"));
        assert!(is_already_gone("Error: no container with name or ID \"abc\" found"));
        assert!(!is_already_gone("permission denied"));
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
    #[tokio::test]
    async fn test_start_trace_builds_run_invocation() {
        let tools = tempfile::tempdir().unwrap();
        let log = tools.path().join("args.log");
        let runtime = ContainerRuntime::new(fake_runtime(
            tools.path(),
            &format!("echo \"$@\" >> {}\necho fake-container-id", log.display()),
        ));

        let id = TraceId::parse("AbCdEfGhIjKlMnOpQrStUv").unwrap();
        let options = LaunchOptions {
            image: "trace-appserver:latest".to_string(),
            storage_dir: Some(std::path::PathBuf::from("/var/lib/trace-storage/x")),
            env: vec![("TRACE_NOTIFY_TOPIC".to_string(), "traces-new".to_string())],
        };

        let handle = runtime
            .start_trace(&id, Path::new("/traces/demo"), &options)
            .await
            .unwrap();
        assert_eq!(handle.id, "fake-container-id");
        assert!(handle.name.starts_with("tracegate-"));

        let recorded = fs::read_to_string(&log).unwrap();
        assert!(recorded.starts_with("run --detach --name tracegate-"));
        assert!(recorded.contains("--security-opt seccomp=unconfined"));
        assert!(recorded.contains("--tmpfs /tmp"));
        assert!(recorded.contains(
            "type=bind,source=/traces/demo,destination=/trace,readonly,bind-propagation=rslave"
        ));
        assert!(recorded.contains(
            "type=bind,source=/var/lib/trace-storage/x,destination=/storage,bind-propagation=rslave"
        ));
        assert!(recorded.contains("--env TRACE_NOTIFY_TOPIC=traces-new"));
        assert!(recorded.contains("trace-appserver:latest"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_trace_unique_names() {
        let tools = tempfile::tempdir().unwrap();
        let runtime =
            ContainerRuntime::new(fake_runtime(tools.path(), "echo fake-container-id"));
        let id = TraceId::parse("AbCdEfGhIjKlMnOpQrStUv").unwrap();
        let options = LaunchOptions {
            image: "img".to_string(),
            storage_dir: None,
            env: Vec::new(),
        };

        let a = runtime
            .start_trace(&id, Path::new("/traces/a"), &options)
            .await
            .unwrap();
        let b = runtime
            .start_trace(&id, Path::new("/traces/a"), &options)
            .await
            .unwrap();
        assert_ne!(a.name, b.name);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let tools = tempfile::tempdir().unwrap();
        let runtime = ContainerRuntime::new(fake_runtime(
            tools.path(),
            "echo 'Error: No such container: gone' >&2; exit 1",
        ));
        let handle = ContainerHandle {
            id: "gone".to_string(),
            name: "tracegate-gone".to_string(),
        };

        runtime.remove(&handle).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_remove_surfaces_other_failures() {
        let tools = tempfile::tempdir().unwrap();
        let runtime = ContainerRuntime::new(fake_runtime(
            tools.path(),
            "echo 'permission denied' >&2; exit 1",
        ));
        let handle = ContainerHandle {
            id: "c".to_string(),
            name: "tracegate-c".to_string(),
        };

        assert!(runtime.remove(&handle).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_read_file_returns_stdout() {
        let tools = tempfile::tempdir().unwrap();
        let runtime = ContainerRuntime::new(fake_runtime(
            tools.path(),
            r#"[ "$1" = exec ] && [ "$3" = cat ] && echo "<html></html>""#,
        ));
        let handle = ContainerHandle {
            id: "c".to_string(),
            name: "tracegate-c".to_string(),
        };

        let bytes = runtime.read_file(&handle, "/app/html/index.html").await.unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap().trim(), "<html></html>");
    }
}
