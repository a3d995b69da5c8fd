//! Typed leader records for host-scoped elections.

use std::sync::Arc;

use fleet_coord::{Connection, Leader, Version};
use serde::{Deserialize, Serialize};

use crate::error::ListenResult;

/// Payload advertised by whichever host holds a lead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostLeader {
    pub host_id: String,
    /// Store version of the leader node. Used to tell leaders apart, never
    /// written back.
    #[serde(skip)]
    pub version: Version,
}

/// Candidate for the election at `path`, advertising `host_id`.
pub fn new_host_leader(
    conn: Arc<dyn Connection>,
    host_id: &str,
    path: &str,
) -> ListenResult<Leader> {
    let payload = serde_json::to_vec(&HostLeader {
        host_id: host_id.to_string(),
        version: 0,
    })?;
    Ok(Leader::new(conn, path, payload))
}

/// The record of whoever currently leads, whether or not that is `leader`.
pub async fn current_leader(leader: &Leader) -> ListenResult<HostLeader> {
    let (data, version) = leader.current().await?;
    let mut record: HostLeader = serde_json::from_slice(&data)?;
    record.version = version;
    Ok(record)
}

/// Host id of the current leader.
pub async fn get_host_id(leader: &Leader) -> ListenResult<String> {
    Ok(current_leader(leader).await?.host_id)
}
