pub mod broker;
pub mod cluster;

use crate::config::Config;
use crate::model::Credential;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub use broker::RestBroker;
pub use cluster::{MoRef, ViJsonClusterManager};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("учетные данные отклонены: {0}")]
    Auth(String),
    #[error("бэкенд ответил статусом {status}")]
    Http { status: u16 },
    #[error("бэкенд недоступен: {0}")]
    Unavailable(String),
    #[error("объект не найден: {0}")]
    NotFound(String),
    #[error("ответ бэкенда не распознан: {0}")]
    Protocol(String),
}

impl BackendError {
    pub(crate) fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BackendError::Unavailable(format!("timeout: {err}"))
        } else if err.is_decode() {
            BackendError::Protocol(err.to_string())
        } else {
            BackendError::Unavailable(err.to_string())
        }
    }

    pub(crate) fn from_body(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BackendError::Unavailable(format!("timeout: {err}"))
        } else {
            BackendError::Protocol(err.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PoolDescriptor {
    #[serde(default)]
    pub id: String,
    #[serde(default = "unnamed_pool")]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MachineDescriptor {
    #[serde(default)]
    pub desktop_pool_id: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
}

fn unnamed_pool() -> String {
    "N/A".to_string()
}

/// Raw counters of one host as the cluster manager reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostStats {
    pub memory_used_mb: u64,
    pub memory_size_bytes: u64,
    pub cpu_used_mhz: u64,
    pub cpu_mhz: u64,
    pub cpu_cores: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HostDescriptor {
    pub name: String,
    pub stats: Result<HostStats, BackendError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterDescriptor {
    pub backend_fqdn: String,
    pub backend_name: String,
    pub cluster_name: String,
    pub hosts: Vec<HostDescriptor>,
}

/// Bearer session with one broker. Obtained per refresh, never cached.
#[derive(Clone)]
pub struct BrokerConnection {
    pub base_url: String,
    pub(crate) access_token: String,
    pub(crate) refresh_token: Option<String>,
}

impl BrokerConnection {
    #[cfg(test)]
    pub fn new(base_url: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            access_token: access_token.into(),
            refresh_token: None,
        }
    }
}

impl fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

/// Logged-in cluster manager session. Immutable once created; clones share
/// the same server-side session.
#[derive(Clone)]
pub struct ClusterConnection {
    pub manager_id: String,
    pub host: String,
    pub product_name: String,
    pub(crate) session_key: String,
    pub(crate) root_folder: MoRef,
    pub(crate) view_manager: MoRef,
    pub(crate) session_manager: MoRef,
}

impl ClusterConnection {
    pub fn new(
        manager_id: impl Into<String>,
        host: impl Into<String>,
        product_name: impl Into<String>,
        session_key: impl Into<String>,
    ) -> Self {
        Self {
            manager_id: manager_id.into(),
            host: host.into(),
            product_name: product_name.into(),
            session_key: session_key.into(),
            root_folder: MoRef::default(),
            view_manager: MoRef::default(),
            session_manager: MoRef::default(),
        }
    }
}

impl fmt::Debug for ClusterConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterConnection")
            .field("manager_id", &self.manager_id)
            .field("host", &self.host)
            .field("product_name", &self.product_name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait BrokerBackend: Send + Sync {
    fn base_url(&self) -> &str;

    async fn authenticate(&self, credential: &Credential)
        -> Result<BrokerConnection, BackendError>;

    async fn list_pools(
        &self,
        conn: &BrokerConnection,
    ) -> Result<Vec<PoolDescriptor>, BackendError>;

    async fn list_machines(
        &self,
        conn: &BrokerConnection,
    ) -> Result<Vec<MachineDescriptor>, BackendError>;

    async fn logout(&self, conn: &BrokerConnection) -> Result<(), BackendError>;
}

#[async_trait]
pub trait ClusterBackend: Send + Sync {
    fn id(&self) -> &str;

    /// Name of the cluster this manager reports on.
    fn cluster_name(&self) -> &str;

    async fn authenticate(
        &self,
        credential: &Credential,
    ) -> Result<ClusterConnection, BackendError>;

    /// `NotFound` when no cluster of that exact name is reachable from the root folder.
    async fn fetch_cluster_inventory(
        &self,
        conn: &ClusterConnection,
        cluster_name: &str,
    ) -> Result<ClusterDescriptor, BackendError>;

    async fn logout(&self, conn: &ClusterConnection) -> Result<(), BackendError>;
}

/// Every configured backend, in configuration order.
#[derive(Clone)]
pub struct Backends {
    pub brokers: Vec<Arc<dyn BrokerBackend>>,
    pub clusters: Vec<Arc<dyn ClusterBackend>>,
}

impl Backends {
    pub fn from_config(cfg: &Config) -> Result<Self, BackendError> {
        let client = Client::builder()
            .user_agent("vmdash/0.1.0")
            .timeout(cfg.request_timeout())
            .connect_timeout(cfg.request_timeout())
            .danger_accept_invalid_certs(cfg.accept_invalid_certs)
            .build()
            .map_err(|err| BackendError::Unavailable(format!("http client: {err}")))?;

        let brokers = cfg
            .brokers
            .iter()
            .map(|b| Arc::new(RestBroker::new(client.clone(), &b.url)) as Arc<dyn BrokerBackend>)
            .collect();
        let clusters = cfg
            .cluster_managers
            .iter()
            .map(|m| {
                Arc::new(ViJsonClusterManager::from_config(
                    client.clone(),
                    m,
                    &cfg.vi_json_release,
                )) as Arc<dyn ClusterBackend>
            })
            .collect();

        Ok(Self { brokers, clusters })
    }
}
