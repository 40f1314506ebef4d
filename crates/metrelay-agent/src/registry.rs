use std::collections::HashMap;

use metrelay_proto::ProxyMessage;
use metrelay_transport::TransportStream;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::AgentError;
use crate::rpc::ControlClient;

/// A registered path and where its metrics come from.
#[derive(Debug, Clone, PartialEq)]
pub struct PathContext {
    pub path_id: u64,
    pub path: String,
    pub url: String,
}

/// Paths this agent serves, keyed by the proxy-visible path. The map is
/// a local mirror of what the proxy has registered for the current
/// session.
pub struct PathRegistry {
    paths: RwLock<HashMap<String, PathContext>>,
}

impl PathRegistry {
    pub fn new() -> Self {
        Self {
            paths: RwLock::new(HashMap::new()),
        }
    }

    /// Looks up a path exactly as the proxy sends it in scrape
    /// requests.
    pub async fn lookup(&self, path: &str) -> Option<PathContext> {
        self.paths.read().await.get(path).cloned()
    }

    pub(crate) async fn clear(&self) {
        self.paths.write().await.clear();
    }

    pub(crate) async fn insert(&self, context: PathContext) {
        self.paths.write().await.insert(context.path.clone(), context);
    }

    /// Registers `path` with the proxy and records it locally. A
    /// leading slash is stripped, "/metrics" and "metrics" name the
    /// same path.
    pub(crate) async fn register<S: TransportStream>(
        &self,
        control: &ControlClient<S>,
        path: &str,
        url: &str,
    ) -> Result<u64, AgentError> {
        let path = normalize(path);
        let reply = control
            .call(ProxyMessage::RegisterPath {
                agent_id: String::new(),
                path: path.clone(),
            })
            .await?;
        match reply {
            ProxyMessage::RegisterPathAck {
                valid: true,
                path_id,
                ..
            } => {
                self.insert(PathContext {
                    path_id,
                    path: path.clone(),
                    url: url.to_string(),
                })
                .await;
                info!(path = %path, path_id, "path registered");
                Ok(path_id)
            }
            ProxyMessage::RegisterPathAck {
                valid: false,
                reason,
                ..
            } => Err(AgentError::PathRegistrationFailed { path, reason }),
            other => Err(AgentError::unexpected(&other)),
        }
    }

    /// Unregisters `path` on the proxy, then locally. A proxy refusal
    /// surfaces as an error and leaves the local entry in place;
    /// removing a path with no local entry is a no-op.
    pub(crate) async fn unregister<S: TransportStream>(
        &self,
        control: &ControlClient<S>,
        path: &str,
    ) -> Result<(), AgentError> {
        let path = normalize(path);
        let reply = control
            .call(ProxyMessage::UnregisterPath {
                agent_id: String::new(),
                path: path.clone(),
            })
            .await?;
        match reply {
            ProxyMessage::UnregisterPathAck { valid: true, .. } => {}
            ProxyMessage::UnregisterPathAck {
                valid: false,
                reason,
            } => {
                warn!(path = %path, reason = %reason, "proxy refused unregister");
                return Err(AgentError::PathUnregistrationFailed { path, reason });
            }
            other => return Err(AgentError::unexpected(&other)),
        }
        if self.paths.write().await.remove(&path).is_none() {
            debug!(path = %path, "path was not registered locally");
        }
        Ok(())
    }

    /// Asks the proxy how many paths it has mapped for this agent. The
    /// proxy's count is authoritative.
    pub(crate) async fn proxy_path_count<S: TransportStream>(
        &self,
        control: &ControlClient<S>,
    ) -> Result<u64, AgentError> {
        let reply = control
            .call(ProxyMessage::PathMapSize {
                agent_id: String::new(),
            })
            .await?;
        match reply {
            ProxyMessage::PathMapSizeAck { path_count } => Ok(path_count),
            other => Err(AgentError::unexpected(&other)),
        }
    }
}

impl Default for PathRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize(path: &str) -> String {
    path.strip_prefix('/').unwrap_or(path).to_string()
}
