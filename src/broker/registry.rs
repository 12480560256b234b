use std::{fmt, sync::Arc, time::Duration};

use dashmap::DashSet;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::collaborators::{PluginHandle, PluginTransport, TransportError};
use crate::config::SharedConfig;

/// Address of a plugin: the endpoint it listens on and the object path inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PluginRegistration {
    pub endpoint_id: String,
    pub path: String,
}

impl PluginRegistration {
    pub fn new(endpoint_id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            path: path.into(),
        }
    }
}

impl fmt::Display for PluginRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.endpoint_id, self.path)
    }
}

/// Outcome of connecting to one registered plugin.
pub struct ResolvedPlugin {
    pub registration: PluginRegistration,
    pub handle: Result<Arc<dyn PluginHandle>, TransportError>,
}

/// Set of plugins that announced themselves to the broker.
///
/// Registrations are never removed; a plugin that went away simply fails to
/// resolve.
pub struct PluginRegistry {
    registrations: DashSet<PluginRegistration>,
    transport: Arc<dyn PluginTransport>,
    config: SharedConfig,
}

impl PluginRegistry {
    pub fn new(transport: Arc<dyn PluginTransport>, config: SharedConfig) -> Self {
        Self {
            registrations: DashSet::new(),
            transport,
            config,
        }
    }

    /// Returns `true` if the registration was not known before.
    pub fn register(&self, endpoint_id: &str, path: &str) -> bool {
        let registration = PluginRegistration::new(endpoint_id, path);
        let inserted = self.registrations.insert(registration.clone());
        if inserted {
            info!(plugin = %registration, "plugin registered");
        } else {
            debug!(plugin = %registration, "plugin already registered");
        }
        inserted
    }

    pub fn list_registered(&self) -> Vec<PluginRegistration> {
        let mut registrations: Vec<_> = self
            .registrations
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        registrations.sort();
        registrations
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Connects to every registered plugin concurrently.
    ///
    /// `None` uses the configured connect timeout. Failures are logged and
    /// returned alongside the successes.
    pub async fn resolve(&self, retry_timeout: Option<Duration>) -> Vec<ResolvedPlugin> {
        let timeout = match retry_timeout {
            Some(timeout) => timeout,
            None => self.config.read().await.plugin_connect_timeout,
        };
        let registrations = self.list_registered();
        debug!(plugins = registrations.len(), ?timeout, "resolving plugins");

        let connections = registrations.into_iter().map(|registration| async move {
            let handle = self.transport.connect(&registration, timeout).await;
            if let Err(e) = &handle {
                warn!(plugin = %registration, error = %e, "failed to connect to plugin");
            }
            ResolvedPlugin {
                registration,
                handle,
            }
        });
        join_all(connections).await
    }
}
