//! Explicit mutation commands for `load_and_update`.
//!
//! A mutation is a pure transform of a loaded entity. The entity store
//! knows nothing about what the transform does; callers either pass one of
//! the command enums below or any `FnOnce(&mut T)`.

use crate::types::{
    epoch_secs, DesiredState, HostServiceState, Service, ServiceState, SnapshotRequest,
};

/// A transform applied to a freshly loaded entity before it is written back.
pub trait Mutation<T> {
    fn apply(self, entity: &mut T);
}

impl<T, F> Mutation<T> for F
where
    F: FnOnce(&mut T),
{
    fn apply(self, entity: &mut T) {
        self(entity)
    }
}

/// Changes to a [`Service`] definition.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceMutation {
    SetDesiredState(DesiredState),
    SetInstances(u32),
    SetImage(String),
    SetStartup(String),
}

impl Mutation<Service> for ServiceMutation {
    fn apply(self, service: &mut Service) {
        match self {
            Self::SetDesiredState(state) => service.desired_state = state,
            Self::SetInstances(n) => service.instances = n,
            Self::SetImage(image) => service.image_id = image,
            Self::SetStartup(startup) => service.startup = startup,
        }
        service.updated_at = epoch_secs();
    }
}

/// Lifecycle reports against a [`ServiceState`].
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceStateMutation {
    /// The container came up.
    Started {
        container_id: String,
        private_ip: String,
    },
    /// Mark terminated now.
    Terminated,
    SetInSync(bool),
}

impl Mutation<ServiceState> for ServiceStateMutation {
    fn apply(self, state: &mut ServiceState) {
        match self {
            Self::Started {
                container_id,
                private_ip,
            } => {
                state.container_id = container_id;
                state.private_ip = private_ip;
                state.started = Some(epoch_secs());
                state.terminated = None;
            }
            Self::Terminated => state.terminated = Some(epoch_secs()),
            Self::SetInSync(in_sync) => state.in_sync = in_sync,
        }
    }
}

/// Changes to a host's shadow record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostStateMutation {
    SetDesiredState(DesiredState),
}

impl Mutation<HostServiceState> for HostStateMutation {
    fn apply(self, shadow: &mut HostServiceState) {
        match self {
            Self::SetDesiredState(state) => shadow.desired_state = state,
        }
    }
}

/// The single write a fulfiller makes to a [`SnapshotRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotMutation {
    Fulfill { label: String },
    Fail { error: String },
}

impl SnapshotMutation {
    pub fn from_result(result: Result<String, String>) -> Self {
        match result {
            Ok(label) => Self::Fulfill { label },
            Err(error) => Self::Fail { error },
        }
    }
}

impl Mutation<SnapshotRequest> for SnapshotMutation {
    fn apply(self, request: &mut SnapshotRequest) {
        match self {
            Self::Fulfill { label } => {
                request.snapshot_label = label;
                request.snapshot_error.clear();
            }
            Self::Fail { error } => {
                request.snapshot_error = error;
                request.snapshot_label.clear();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SnapshotOutcome;

    #[test]
    fn service_mutation_sets_desired_state() {
        let mut service = Service::new("web");
        service.desired_state = DesiredState::Run;
        ServiceMutation::SetDesiredState(DesiredState::Stop).apply(&mut service);
        assert_eq!(service.desired_state, DesiredState::Stop);
    }

    #[test]
    fn started_clears_previous_termination() {
        let mut state = Service::new("web").new_service_state("h1");
        state.terminated = Some(1);
        ServiceStateMutation::Started {
            container_id: "c1".to_string(),
            private_ip: "10.0.0.2".to_string(),
        }
        .apply(&mut state);
        assert_eq!(state.container_id, "c1");
        assert!(state.started.is_some());
        assert!(state.terminated.is_none());
    }

    #[test]
    fn snapshot_mutation_writes_exactly_one_field() {
        let mut request = SnapshotRequest::new("svc");
        SnapshotMutation::from_result(Err("disk full".to_string())).apply(&mut request);
        assert_eq!(request.outcome(), SnapshotOutcome::Failed("disk full".to_string()));
        assert!(request.snapshot_label.is_empty());
    }

    #[test]
    fn closures_are_mutations() {
        let mut shadow = HostServiceState::from(&Service::new("web").new_service_state("h1"));
        (|s: &mut HostServiceState| s.desired_state = DesiredState::Restart).apply(&mut shadow);
        assert_eq!(shadow.desired_state, DesiredState::Restart);
    }
}
