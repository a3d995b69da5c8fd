//! Namespace scheme: the only place node paths are built.
//!
//! ```text
//! /service/{service_id}                        Service
//! /service/{service_id}/{service_state_id}     ServiceState
//! /scheduler/{host_id}                         (host bucket)
//! /scheduler/{host_id}/{service_state_id}      HostServiceState
//! /snapshot/requests/{request_id}              SnapshotRequest
//! /snapshot/state                              snapshot state
//! /pools/{pool_id}/leader                      leader election scope
//! ```
//!
//! Children of a service path are exactly its instances and children of a
//! host path are exactly that host's shadows, since identifiers cannot
//! contain `/`.

use crate::error::{StateError, StateResult};

pub const SERVICE_ROOT: &str = "/service";
pub const SCHEDULER_ROOT: &str = "/scheduler";
pub const SNAPSHOT_ROOT: &str = "/snapshot";
pub const SNAPSHOT_REQUESTS: &str = "/snapshot/requests";
pub const SNAPSHOT_STATE: &str = "/snapshot/state";
pub const POOLS_ROOT: &str = "/pools";

/// Roots created by [`ClusterState::init`](crate::ClusterState::init).
pub const ROOTS: [&str; 5] = [
    SERVICE_ROOT,
    SCHEDULER_ROOT,
    SNAPSHOT_ROOT,
    SNAPSHOT_REQUESTS,
    POOLS_ROOT,
];

/// Reject identifiers that would break the hierarchy.
pub fn validate_id(id: &str) -> StateResult<()> {
    if id.is_empty() || id.contains('/') || id == "." || id == ".." {
        return Err(StateError::InvalidId(id.to_string()));
    }
    Ok(())
}

pub fn service(service_id: &str) -> StateResult<String> {
    validate_id(service_id)?;
    Ok(format!("{SERVICE_ROOT}/{service_id}"))
}

pub fn service_state(service_id: &str, service_state_id: &str) -> StateResult<String> {
    validate_id(service_state_id)?;
    Ok(format!("{}/{service_state_id}", service(service_id)?))
}

pub fn host(host_id: &str) -> StateResult<String> {
    validate_id(host_id)?;
    Ok(format!("{SCHEDULER_ROOT}/{host_id}"))
}

pub fn host_service_state(host_id: &str, service_state_id: &str) -> StateResult<String> {
    validate_id(service_state_id)?;
    Ok(format!("{}/{service_state_id}", host(host_id)?))
}

pub fn snapshot_request(request_id: &str) -> StateResult<String> {
    validate_id(request_id)?;
    Ok(format!("{SNAPSHOT_REQUESTS}/{request_id}"))
}

/// Election scope for a pool's leader.
pub fn pool_leader(pool_id: &str) -> StateResult<String> {
    validate_id(pool_id)?;
    Ok(format!("{POOLS_ROOT}/{pool_id}/leader"))
}
