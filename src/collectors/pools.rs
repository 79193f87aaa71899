use crate::backends::{BackendError, BrokerBackend, MachineDescriptor, PoolDescriptor};
use crate::model::{Credential, MachineState, PoolEntry, PoolSnapshot, StateCounts};
use tracing::{debug, warn};

/// Pools whose name contains this marker, in any case, are never reported.
const TEST_POOL_MARKER: &str = "test";

pub fn is_test_pool(name: &str) -> bool {
    name.to_lowercase().contains(TEST_POOL_MARKER)
}

/// Tallies the machines of one pool; states outside [`MachineState`] are dropped.
pub fn tally_pool(pool_id: &str, machines: &[MachineDescriptor]) -> StateCounts {
    let mut counts = StateCounts::default();
    for machine in machines {
        if machine.desktop_pool_id.as_deref() != Some(pool_id) {
            continue;
        }
        if let Some(state) = machine.state.as_deref().and_then(MachineState::parse) {
            counts.record(state);
        }
    }
    counts
}

/// One snapshot per non-test pool, in the broker's order. `machines` is
/// `None` when the machine listing failed; those pools report all zeroes.
pub fn summarize_pools(
    pools: &[PoolDescriptor],
    machines: Option<&[MachineDescriptor]>,
) -> Vec<PoolEntry> {
    pools
        .iter()
        .filter(|p| !is_test_pool(&p.name))
        .map(|pool| {
            let state_counts = machines
                .map(|m| tally_pool(&pool.id, m))
                .unwrap_or_default();
            PoolEntry::Pool(PoolSnapshot {
                pool_name: pool.name.clone(),
                state_counts,
            })
        })
        .collect()
}

fn login_error_text(err: &BackendError) -> String {
    match err {
        BackendError::Auth(_) | BackendError::Http { .. } => "Authentication failed".to_string(),
        BackendError::Protocol(_) => "Failed to get token".to_string(),
        other => unavailable_text(other),
    }
}

fn listing_error_text(err: &BackendError) -> String {
    match err {
        BackendError::Http { status } => format!("Failed to fetch pools (Status: {status})"),
        BackendError::Auth(_) => "Failed to fetch pools (Status: 401)".to_string(),
        other => unavailable_text(other),
    }
}

fn unavailable_text(err: &BackendError) -> String {
    match err {
        BackendError::Unavailable(detail) => format!("Backend unavailable: {detail}"),
        other => format!("Backend error: {other}"),
    }
}

/// Logs in to one broker, reads pools and machines, and tallies them.
/// Never fails: a broken broker yields a single sentinel entry.
pub async fn collect_pools(broker: &dyn BrokerBackend, credential: &Credential) -> Vec<PoolEntry> {
    let conn = match broker.authenticate(credential).await {
        Ok(conn) => conn,
        Err(err) => {
            warn!(broker = %broker.base_url(), error = %err, "не удалось войти на брокер");
            return vec![PoolEntry::error(login_error_text(&err))];
        }
    };

    let entries = match broker.list_pools(&conn).await {
        Ok(pools) => {
            let machines = if pools.iter().any(|p| !is_test_pool(&p.name)) {
                match broker.list_machines(&conn).await {
                    Ok(machines) => Some(machines),
                    Err(err) => {
                        warn!(broker = %broker.base_url(), error = %err, "не удалось получить список машин");
                        None
                    }
                }
            } else {
                Some(Vec::new())
            };
            summarize_pools(&pools, machines.as_deref())
        }
        Err(err) => {
            warn!(broker = %broker.base_url(), error = %err, "не удалось получить список пулов");
            vec![PoolEntry::error(listing_error_text(&err))]
        }
    };

    if let Err(err) = broker.logout(&conn).await {
        debug!(broker = %broker.base_url(), error = %err, "не удалось выйти с брокера");
    }
    entries
}
