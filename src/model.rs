use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::fmt;
use std::time::SystemTime;

/// Login credentials as typed into the login form.
///
/// Lives in memory only: for the duration of authentication and, when both
/// backends accept it, inside the session that owns it.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub domain: String,
    pub username: String,
    pub password: String,
}

impl Credential {
    pub fn new(
        domain: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            domain: domain.into(),
            username: username.into(),
            password: password.into(),
        }
    }

    /// `DOMAIN\user` for the cluster manager, bare `user` without a domain.
    pub fn qualified_username(&self) -> String {
        let domain = self.domain.trim();
        if domain.is_empty() {
            self.username.clone()
        } else {
            format!("{}\\{}", domain, self.username)
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("domain", &self.domain)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

const STATE_COUNT: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MachineState {
    Available,
    Connected,
    Disconnected,
    Deleting,
    Provisioning,
    Customizing,
    Error,
}

impl MachineState {
    /// Counting and display order.
    pub const ALL: [MachineState; STATE_COUNT] = [
        MachineState::Available,
        MachineState::Connected,
        MachineState::Disconnected,
        MachineState::Deleting,
        MachineState::Provisioning,
        MachineState::Customizing,
        MachineState::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MachineState::Available => "AVAILABLE",
            MachineState::Connected => "CONNECTED",
            MachineState::Disconnected => "DISCONNECTED",
            MachineState::Deleting => "DELETING",
            MachineState::Provisioning => "PROVISIONING",
            MachineState::Customizing => "CUSTOMIZING",
            MachineState::Error => "ERROR",
        }
    }

    /// Exact match against the broker's state names; anything else is not counted.
    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == raw)
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-state machine tally over the closed [`MachineState`] set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCounts([u32; STATE_COUNT]);

impl StateCounts {
    pub fn record(&mut self, state: MachineState) {
        let slot = &mut self.0[state.index()];
        *slot = slot.saturating_add(1);
    }

    pub fn get(&self, state: MachineState) -> u32 {
        self.0[state.index()]
    }

    #[cfg(test)]
    pub fn total(&self) -> u32 {
        self.0.iter().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (MachineState, u32)> + '_ {
        MachineState::ALL.into_iter().map(|s| (s, self.get(s)))
    }
}

impl Serialize for StateCounts {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(STATE_COUNT))?;
        for (state, count) in self.iter() {
            map.serialize_entry(state.as_str(), &count)?;
        }
        map.end()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolSnapshot {
    pub pool_name: String,
    pub state_counts: StateCounts,
}

/// One row of a broker's pool list: either a tallied pool or the sentinel
/// that replaces the whole list when the broker could not be read.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PoolEntry {
    Pool(PoolSnapshot),
    Error { error: String },
}

impl PoolEntry {
    pub fn error(message: impl Into<String>) -> Self {
        PoolEntry::Error {
            error: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostMetric {
    pub name: String,
    pub used_memory_gb: f64,
    pub total_memory_gb: f64,
    pub free_memory_gb: f64,
    pub cpu_usage_ghz: f64,
    pub cpu_capacity_ghz: f64,
    pub cpu_free_ghz: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterSnapshot {
    pub vcenter_fqdn: String,
    pub vcenter_name: String,
    pub cluster_name: String,
    pub hosts: Vec<HostMetric>,
    pub total_used_gb: f64,
    pub total_capacity_gb: f64,
    pub total_free_gb: f64,
    pub total_cpu_usage_ghz: f64,
    pub total_cpu_capacity_ghz: f64,
    pub total_cpu_free_ghz: f64,
    pub memory_load_percentage: f64,
    pub cpu_load_percentage: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unreadable_hosts: Vec<String>,
}

/// Result for one configured cluster. `NotFound` serializes as `{}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ClusterEntry {
    Snapshot(ClusterSnapshot),
    Unavailable { error: String },
    NotFound {},
}

#[derive(Debug, Clone, Serialize)]
pub struct CombinedSnapshot {
    #[serde(rename = "server_data", serialize_with = "ordered_map")]
    pub pools_by_broker: Vec<(String, Vec<PoolEntry>)>,
    #[serde(rename = "vcenter_data", serialize_with = "ordered_map")]
    pub clusters_by_backend: Vec<(String, ClusterEntry)>,
    #[serde(rename = "fetch_time", serialize_with = "rfc3339")]
    pub fetched_at: SystemTime,
}

impl CombinedSnapshot {
    pub fn fetch_time(&self) -> String {
        humantime::format_rfc3339_seconds(self.fetched_at).to_string()
    }
}

#[allow(clippy::ptr_arg)]
fn ordered_map<S, V>(entries: &Vec<(String, V)>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    V: Serialize,
{
    serializer.collect_map(entries.iter().map(|(k, v)| (k, v)))
}

fn rfc3339<S: Serializer>(ts: &SystemTime, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&humantime::format_rfc3339_seconds(*ts))
}

/// Load in percent; `None` when there is no capacity to divide by.
pub fn load_percentage(used: f64, capacity: f64) -> Option<f64> {
    if capacity > 0.0 {
        Some(used / capacity * 100.0)
    } else {
        None
    }
}
