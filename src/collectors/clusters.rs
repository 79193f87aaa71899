use crate::backends::{BackendError, ClusterBackend, ClusterConnection, ClusterDescriptor, HostStats};
use crate::model::{load_percentage, ClusterEntry, ClusterSnapshot, HostMetric};
use tracing::warn;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
const MB_PER_GB: f64 = 1024.0;
const MHZ_PER_GHZ: f64 = 1000.0;

/// Host figures in MB/MHz, the units totals are accumulated in.
struct HostUsage {
    memory_used_mb: f64,
    memory_capacity_mb: f64,
    cpu_used_mhz: f64,
    cpu_capacity_mhz: f64,
}

impl From<&HostStats> for HostUsage {
    fn from(stats: &HostStats) -> Self {
        Self {
            memory_used_mb: stats.memory_used_mb as f64,
            memory_capacity_mb: stats.memory_size_bytes as f64 / BYTES_PER_MB,
            cpu_used_mhz: stats.cpu_used_mhz as f64,
            cpu_capacity_mhz: stats.cpu_mhz as f64 * stats.cpu_cores as f64,
        }
    }
}

impl HostUsage {
    fn metric(&self, name: &str) -> HostMetric {
        HostMetric {
            name: name.to_string(),
            used_memory_gb: self.memory_used_mb / MB_PER_GB,
            total_memory_gb: self.memory_capacity_mb / MB_PER_GB,
            free_memory_gb: (self.memory_capacity_mb - self.memory_used_mb) / MB_PER_GB,
            cpu_usage_ghz: self.cpu_used_mhz / MHZ_PER_GHZ,
            cpu_capacity_ghz: self.cpu_capacity_mhz / MHZ_PER_GHZ,
            cpu_free_ghz: (self.cpu_capacity_mhz - self.cpu_used_mhz) / MHZ_PER_GHZ,
        }
    }
}

/// Folds a cluster inventory into per-host metrics and cluster totals.
///
/// Hosts whose counters could not be read are listed in `unreadable_hosts`
/// and left out of the totals. Loads are not clamped, so a transient
/// overshoot above 100 is reported as is; zero capacity reports 0.
pub fn summarize_cluster(inventory: &ClusterDescriptor) -> ClusterSnapshot {
    let mut hosts = Vec::with_capacity(inventory.hosts.len());
    let mut unreadable_hosts = Vec::new();
    let mut memory_used_mb = 0.0;
    let mut memory_capacity_mb = 0.0;
    let mut cpu_used_mhz = 0.0;
    let mut cpu_capacity_mhz = 0.0;

    for host in &inventory.hosts {
        let stats = match &host.stats {
            Ok(stats) => stats,
            Err(err) => {
                warn!(cluster = %inventory.cluster_name, host = %host.name, error = %err, "хост пропущен");
                unreadable_hosts.push(host.name.clone());
                continue;
            }
        };
        let usage = HostUsage::from(stats);
        hosts.push(usage.metric(&host.name));
        memory_used_mb += usage.memory_used_mb;
        memory_capacity_mb += usage.memory_capacity_mb;
        cpu_used_mhz += usage.cpu_used_mhz;
        cpu_capacity_mhz += usage.cpu_capacity_mhz;
    }

    let total_used_gb = memory_used_mb / MB_PER_GB;
    let total_capacity_gb = memory_capacity_mb / MB_PER_GB;
    let total_cpu_usage_ghz = cpu_used_mhz / MHZ_PER_GHZ;
    let total_cpu_capacity_ghz = cpu_capacity_mhz / MHZ_PER_GHZ;

    ClusterSnapshot {
        vcenter_fqdn: inventory.backend_fqdn.clone(),
        vcenter_name: inventory.backend_name.clone(),
        cluster_name: inventory.cluster_name.clone(),
        hosts,
        total_used_gb,
        total_capacity_gb,
        total_free_gb: total_capacity_gb - total_used_gb,
        total_cpu_usage_ghz,
        total_cpu_capacity_ghz,
        total_cpu_free_ghz: total_cpu_capacity_ghz - total_cpu_usage_ghz,
        memory_load_percentage: load_percentage(total_used_gb, total_capacity_gb).unwrap_or(0.0),
        cpu_load_percentage: load_percentage(total_cpu_usage_ghz, total_cpu_capacity_ghz)
            .unwrap_or(0.0),
        unreadable_hosts,
    }
}

/// Reads the manager's configured cluster through a cached connection.
///
/// Returns `None` when the connection itself was rejected, so the caller can
/// omit that side instead of rendering a stale session as an error.
pub async fn collect_cluster(
    backend: &dyn ClusterBackend,
    conn: &ClusterConnection,
) -> Option<ClusterEntry> {
    let cluster = backend.cluster_name();
    match backend.fetch_cluster_inventory(conn, cluster).await {
        Ok(inventory) => Some(ClusterEntry::Snapshot(summarize_cluster(&inventory))),
        Err(BackendError::NotFound(_)) => {
            warn!(manager = %backend.id(), cluster = %cluster, "кластер не найден");
            Some(ClusterEntry::NotFound {})
        }
        Err(BackendError::Auth(reason)) => {
            warn!(manager = %backend.id(), reason = %reason, "кешированное подключение к менеджеру кластера отклонено, данные пропущены");
            None
        }
        Err(err) => {
            warn!(manager = %backend.id(), cluster = %cluster, error = %err, "не удалось прочитать кластер");
            Some(ClusterEntry::Unavailable {
                error: format!("Failed to read cluster {cluster}: {err}"),
            })
        }
    }
}
