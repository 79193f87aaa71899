pub mod clusters;
pub mod pools;

use crate::backends::{BackendError, Backends, BrokerBackend, ClusterConnection};
use crate::model::{ClusterEntry, CombinedSnapshot, Credential, PoolEntry};
use crate::session::{Session, SessionStore};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Queries every broker and every cluster manager of a session concurrently
/// and returns once all of them have answered or failed.
///
/// Brokers are logged in to afresh with the session credential; cluster
/// managers are read through the session's cached connections. A manager
/// without a usable connection is left out of `clusters_by_backend`.
pub async fn build_snapshot(backends: &Backends, session: &Session) -> CombinedSnapshot {
    let pool_tasks: Vec<(String, JoinHandle<Vec<PoolEntry>>)> = backends
        .brokers
        .iter()
        .map(|broker| {
            let broker = Arc::clone(broker);
            let credential = session.credential.clone();
            let url = broker.base_url().to_string();
            let task =
                tokio::spawn(async move { pools::collect_pools(broker.as_ref(), &credential).await });
            (url, task)
        })
        .collect();

    let cluster_tasks: Vec<(String, JoinHandle<Option<ClusterEntry>>)> = backends
        .clusters
        .iter()
        .filter_map(|backend| {
            let Some(conn) = session.cluster_connection(backend.id()).cloned() else {
                warn!(manager = %backend.id(), "нет кешированного подключения к менеджеру кластера, данные пропущены");
                return None;
            };
            let backend = Arc::clone(backend);
            let id = backend.id().to_string();
            let task =
                tokio::spawn(async move { clusters::collect_cluster(backend.as_ref(), &conn).await });
            Some((id, task))
        })
        .collect();

    let (pools_by_broker, clusters_by_backend) =
        tokio::join!(join_pools(pool_tasks), join_clusters(cluster_tasks));

    CombinedSnapshot {
        pools_by_broker,
        clusters_by_backend,
        fetched_at: SystemTime::now(),
    }
}

async fn join_pools(
    tasks: Vec<(String, JoinHandle<Vec<PoolEntry>>)>,
) -> Vec<(String, Vec<PoolEntry>)> {
    let mut out = Vec::with_capacity(tasks.len());
    for (url, task) in tasks {
        let entries = match task.await {
            Ok(entries) => entries,
            Err(err) => {
                error!(broker = %url, error = %err, "ошибка задачи сбора пулов");
                vec![PoolEntry::error("Internal error while collecting pools")]
            }
        };
        out.push((url, entries));
    }
    out
}

async fn join_clusters(
    tasks: Vec<(String, JoinHandle<Option<ClusterEntry>>)>,
) -> Vec<(String, ClusterEntry)> {
    let mut out = Vec::with_capacity(tasks.len());
    for (id, task) in tasks {
        match task.await {
            Ok(Some(entry)) => out.push((id, entry)),
            Ok(None) => {}
            Err(err) => error!(manager = %id, error = %err, "ошибка задачи сбора кластера"),
        }
    }
    out
}

/// Which side of a login attempt was rejected.
#[derive(Debug)]
pub struct LoginFailure {
    pub broker: Option<BackendError>,
    pub clusters: Vec<(String, BackendError)>,
}

impl LoginFailure {
    /// User-facing text. Names the failed side, never the failed field.
    pub fn message(&self) -> String {
        let mut message = "Invalid credentials. Please try again.".to_string();
        if !self.clusters.is_empty() {
            message.push_str(" (cluster manager login failed)");
        }
        if self.broker.is_some() {
            message.push_str(" (desktop broker login failed)");
        }
        message
    }

    pub fn outcome(&self) -> &'static str {
        match (self.broker.is_some(), !self.clusters.is_empty()) {
            (true, true) => "both_failed",
            (true, false) => "broker_failed",
            _ => "cluster_failed",
        }
    }
}

async fn check_broker(broker: &dyn BrokerBackend, credential: &Credential) -> Result<(), BackendError> {
    let conn = broker.authenticate(credential).await?;
    let listed = broker.list_pools(&conn).await.map(|_| ());
    if let Err(err) = broker.logout(&conn).await {
        debug!(broker = %broker.base_url(), error = %err, "не удалось выйти с брокера");
    }
    listed
}

/// Checks the credential against the first broker and opens a connection to
/// every cluster manager, all concurrently. Either every check passes and the
/// connections are returned, or nothing is kept: connections that did open
/// are logged out again.
pub async fn authenticate_all(
    backends: &Backends,
    credential: &Credential,
) -> Result<Vec<ClusterConnection>, LoginFailure> {
    let cluster_tasks: Vec<_> = backends
        .clusters
        .iter()
        .map(|backend| {
            let backend = Arc::clone(backend);
            let credential = credential.clone();
            tokio::spawn(async move { backend.authenticate(&credential).await })
        })
        .collect();

    let broker_check = async {
        match backends.brokers.first() {
            Some(broker) => check_broker(broker.as_ref(), credential).await,
            None => Ok(()),
        }
    };
    let cluster_logins = async {
        let mut results = Vec::with_capacity(cluster_tasks.len());
        for task in cluster_tasks {
            results.push(task.await.unwrap_or_else(|err| {
                Err(BackendError::Unavailable(format!("login task failed: {err}")))
            }));
        }
        results
    };
    let (broker_result, cluster_results) = tokio::join!(broker_check, cluster_logins);

    let mut connections = Vec::new();
    let mut failed_clusters = Vec::new();
    for (backend, result) in backends.clusters.iter().zip(cluster_results) {
        match result {
            Ok(conn) => connections.push(conn),
            Err(err) => {
                warn!(manager = %backend.id(), error = %err, "не удалось войти в менеджер кластера");
                failed_clusters.push((backend.id().to_string(), err));
            }
        }
    }
    if let Err(err) = &broker_result {
        warn!(error = %err, "проверка входа на брокер не прошла");
    }

    if broker_result.is_ok() && failed_clusters.is_empty() {
        return Ok(connections);
    }

    disconnect_clusters(backends, &connections).await;
    Err(LoginFailure {
        broker: broker_result.err(),
        clusters: failed_clusters,
    })
}

/// Runs the login and session creation on a task of its own, so a dropped
/// request cannot strand cluster manager connections: a failed login still
/// logs them out and a successful one still lands in the store, where the
/// idle sweep closes it.
pub async fn open_session(
    backends: Arc<Backends>,
    sessions: Arc<dyn SessionStore>,
    credential: Credential,
) -> Result<Arc<Session>, LoginFailure> {
    let task = tokio::spawn(async move {
        let connections = authenticate_all(&backends, &credential).await?;
        Ok::<_, LoginFailure>(sessions.create(credential, connections).await)
    });
    match task.await {
        Ok(result) => result,
        Err(err) => {
            error!(error = %err, "ошибка задачи входа");
            Err(LoginFailure {
                broker: Some(BackendError::Unavailable(format!("login task failed: {err}"))),
                clusters: Vec::new(),
            })
        }
    }
}

/// Best-effort logout of cluster manager connections, e.g. of an expired session.
pub async fn disconnect_clusters(backends: &Backends, connections: &[ClusterConnection]) {
    for conn in connections {
        let Some(backend) = backends.clusters.iter().find(|b| b.id() == conn.manager_id) else {
            continue;
        };
        if let Err(err) = backend.logout(conn).await {
            debug!(manager = %conn.manager_id, error = %err, "не удалось выйти из менеджера кластера");
        }
    }
}

/// Evicts idle sessions and closes their cluster connections. Returns how many were evicted.
pub async fn sweep_idle_sessions(sessions: &dyn SessionStore, backends: &Backends) -> usize {
    let evicted = sessions.evict_idle().await;
    for session in &evicted {
        let age_secs = session
            .created_at
            .elapsed()
            .map(|d| d.as_secs())
            .unwrap_or(0);
        debug!(age_secs, "сессия истекла, подключения закрываются");
        disconnect_clusters(backends, &session.cluster_connections).await;
    }
    if !evicted.is_empty() {
        info!(count = evicted.len(), "неактивные сессии истекли");
    }
    evicted.len()
}
