//! Reverse-proxy sidecar management
//!
//! The proxy itself is a black box: a container started once at boot with
//! the runtime socket mounted so it can read the routing labels off the
//! trace containers, and torn down once at shutdown. The lobby only holds
//! its handle.

use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::ToolError;
use crate::runtime::{ContainerHandle, ContainerRuntime};

const RUNTIME_SOCKET: &str = "/var/run/docker.sock";

pub struct ProxySidecar {
    runtime: Arc<ContainerRuntime>,
    handle: ContainerHandle,
}

impl ProxySidecar {
    /// Launch the reverse proxy, publishing the configured public port and
    /// enabling label-based routing discovery.
    pub async fn start(runtime: Arc<ContainerRuntime>, config: &Config) -> Result<Self, ToolError> {
        let name = format!("tracegate-proxy-{}", Uuid::new_v4().simple());
        let flags = vec![
            "--publish".to_string(),
            format!("{}:80", config.server.public_port),
            "--mount".to_string(),
            format!(
                "type=bind,source={sock},destination={sock},readonly",
                sock = RUNTIME_SOCKET
            ),
        ];
        let command = vec![
            "--providers.docker=true".to_string(),
            "--providers.docker.exposedbydefault=false".to_string(),
            "--entrypoints.web.address=:80".to_string(),
        ];

        let handle = runtime
            .run_detached(&name, &flags, &config.runtime.proxy_image, &command)
            .await?;
        info!(container = %handle.id, image = %config.runtime.proxy_image, "Reverse-proxy sidecar started");

        Ok(Self { runtime, handle })
    }

    /// Stop and remove the sidecar; best-effort, the process is exiting
    /// either way.
    pub async fn stop(self) {
        if let Err(e) = self.runtime.stop(&self.handle).await {
            warn!(container = %self.handle.id, error = %e, "Failed to stop reverse-proxy sidecar");
        }
        if let Err(e) = self.runtime.remove(&self.handle).await {
            warn!(container = %self.handle.id, error = %e, "Failed to remove reverse-proxy sidecar");
        }
        info!("Reverse-proxy sidecar stopped");
    }

    pub fn handle(&self) -> &ContainerHandle {
        &self.handle
    }
}
