//! ClusterState: the typed facade over services, their instances and the
//! per-host shadows of those instances.

use std::sync::Arc;
use std::time::Duration;

use fleet_coord::{Connection, Version, Watch};
use tracing::{debug, info, warn};

use crate::entity::{EntityStore, Versioned};
use crate::error::{StateError, StateResult};
use crate::mutation::{HostStateMutation, Mutation, ServiceMutation, ServiceStateMutation};
use crate::paths;
use crate::types::{DesiredState, HostServiceState, RunningService, Service, ServiceState};

/// Fixed ceilings used by the waiting operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// How long `remove_service` waits for the child set to change.
    pub drain: Duration,
    /// Ceiling on waiting for a snapshot outcome.
    pub snapshot_wait: Duration,
    /// Longest gap between two reloads of a pending snapshot request.
    pub snapshot_poll: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            drain: Duration::from_secs(30),
            snapshot_wait: Duration::from_secs(60),
            snapshot_poll: Duration::from_secs(1),
        }
    }
}

/// Cluster state over one long-lived coordination session.
#[derive(Clone)]
pub struct ClusterState {
    pub(crate) entities: EntityStore,
    pub(crate) timeouts: Timeouts,
}

impl ClusterState {
    /// Wrap a connection. Does not touch the store.
    pub fn new(conn: Arc<dyn Connection>) -> Self {
        Self {
            entities: EntityStore::new(conn),
            timeouts: Timeouts::default(),
        }
    }

    /// Wrap a connection and make sure the fixed roots exist.
    pub async fn init(conn: Arc<dyn Connection>) -> StateResult<Self> {
        let state = Self::new(conn);
        for root in paths::ROOTS {
            state.entities.ensure_path(root).await?;
        }
        debug!("cluster state roots ready");
        Ok(state)
    }

    /// Override the default ceilings.
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    /// The versioned entity store this facade writes through.
    pub fn entities(&self) -> &EntityStore {
        &self.entities
    }

    // ── Services ──────────────────────────────────────────────────

    pub async fn add_service(&self, service: &Service) -> StateResult<()> {
        let path = paths::service(&service.id)?;
        self.entities.create(&path, service).await?;
        info!(service_id = %service.id, name = %service.name, "service added");
        Ok(())
    }

    /// Overwrite a service at its current version, creating it if absent.
    pub async fn update_service(&self, service: &Service) -> StateResult<Version> {
        let path = paths::service(&service.id)?;
        match self.entities.load::<Service>(&path).await {
            Ok(current) => self.entities.update(&path, service, current.version).await,
            Err(e) if e.is_not_found() => {
                info!(%path, "service missing on update, creating it");
                self.add_service(service).await?;
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn load_service(&self, service_id: &str) -> StateResult<Versioned<Service>> {
        self.entities.load(&paths::service(service_id)?).await
    }

    pub async fn load_service_w(
        &self,
        service_id: &str,
    ) -> StateResult<(Versioned<Service>, Watch)> {
        self.entities.load_w(&paths::service(service_id)?).await
    }

    pub async fn load_and_update_service(
        &self,
        service_id: &str,
        mutation: impl Mutation<Service>,
    ) -> StateResult<Versioned<Service>> {
        self.entities
            .load_and_update(&paths::service(service_id)?, mutation)
            .await
    }

    /// Stop a service, wait for its instances to drain, then delete it.
    ///
    /// Fails with [`StateError::Timeout`] if instances remain and the child
    /// set does not change for `Timeouts::drain`.
    pub async fn remove_service(&self, service_id: &str) -> StateResult<()> {
        let path = paths::service(service_id)?;
        self.load_and_update_service(service_id, ServiceMutation::SetDesiredState(DesiredState::Stop))
            .await?;

        loop {
            let (children, watch) = self.entities.children_w(&path).await?;
            if children.is_empty() {
                break;
            }
            debug!(%path, remaining = children.len(), "waiting for instances to drain");
            match tokio::time::timeout(self.timeouts.drain, watch).await {
                Ok(event) => debug!(%path, ?event, "service children changed"),
                Err(_) => {
                    warn!(%path, remaining = children.len(), "gave up waiting for instances to drain");
                    return Err(StateError::Timeout {
                        op: "remove_service",
                        path,
                        waited: self.timeouts.drain,
                    });
                }
            }
        }

        let current = self.entities.load::<Service>(&path).await?;
        self.entities.delete(&path, current.version).await?;
        info!(%path, "service removed");
        Ok(())
    }

    // ── Service states ────────────────────────────────────────────

    /// Create an instance and its host shadow.
    ///
    /// The two creates are not atomic. If the shadow cannot be written the
    /// instance is left in place and the error is returned.
    pub async fn add_service_state(&self, state: &ServiceState) -> StateResult<()> {
        let primary = paths::service_state(&state.service_id, &state.id)?;
        let shadow = paths::host_service_state(&state.host_id, &state.id)?;

        self.entities.create(&primary, state).await?;

        let shadowed = async {
            self.entities
                .ensure_path(&paths::host(&state.host_id)?)
                .await?;
            self.entities
                .create(&shadow, &HostServiceState::from(state))
                .await?;
            Ok::<_, StateError>(())
        };
        if let Err(e) = shadowed.await {
            warn!(%primary, %shadow, error = %e, "instance created without its host shadow");
            return Err(e);
        }
        info!(service_id = %state.service_id, host_id = %state.host_id, id = %state.id, "service state added");
        Ok(())
    }

    /// Overwrite an instance at its current version.
    pub async fn update_service_state(&self, state: &ServiceState) -> StateResult<Version> {
        let path = paths::service_state(&state.service_id, &state.id)?;
        let current = self.entities.load::<ServiceState>(&path).await?;
        self.entities.update(&path, state, current.version).await
    }

    pub async fn load_service_state(
        &self,
        service_id: &str,
        service_state_id: &str,
    ) -> StateResult<Versioned<ServiceState>> {
        self.entities
            .load(&paths::service_state(service_id, service_state_id)?)
            .await
    }

    /// Every instance of the given services, in service order.
    pub async fn service_states(&self, service_ids: &[&str]) -> StateResult<Vec<ServiceState>> {
        let mut states = Vec::new();
        for service_id in service_ids {
            let path = paths::service(service_id)?;
            for child in self.entities.children(&path).await? {
                let loaded = self.load_service_state(service_id, &child).await?;
                states.push(loaded.value);
            }
        }
        Ok(states)
    }

    pub async fn load_and_update_service_state(
        &self,
        service_id: &str,
        service_state_id: &str,
        mutation: impl Mutation<ServiceState>,
    ) -> StateResult<Versioned<ServiceState>> {
        self.entities
            .load_and_update(&paths::service_state(service_id, service_state_id)?, mutation)
            .await
    }

    /// Mark an instance terminated now.
    pub async fn reset_service_state(
        &self,
        service_id: &str,
        service_state_id: &str,
    ) -> StateResult<()> {
        self.load_and_update_service_state(
            service_id,
            service_state_id,
            ServiceStateMutation::Terminated,
        )
        .await?;
        Ok(())
    }

    /// Delete an instance and then its host shadow, each at its current
    /// version. A failure on the shadow is returned, not rolled back.
    pub async fn remove_service_state(
        &self,
        service_id: &str,
        service_state_id: &str,
    ) -> StateResult<()> {
        let primary = paths::service_state(service_id, service_state_id)?;
        let state = self.entities.load::<ServiceState>(&primary).await?;
        self.entities.delete(&primary, state.version).await?;

        let shadow = paths::host_service_state(&state.value.host_id, service_state_id)?;
        let removed = async {
            let current = self.entities.load::<HostServiceState>(&shadow).await?;
            self.entities.delete(&shadow, current.version).await?;
            Ok::<_, StateError>(())
        };
        if let Err(e) = removed.await {
            warn!(%primary, %shadow, error = %e, "instance removed but its host shadow was not");
            return Err(e);
        }
        info!(%primary, "service state removed");
        Ok(())
    }

    // ── Host shadows ──────────────────────────────────────────────

    pub async fn load_host_service_state(
        &self,
        host_id: &str,
        service_state_id: &str,
    ) -> StateResult<Versioned<HostServiceState>> {
        self.entities
            .load(&paths::host_service_state(host_id, service_state_id)?)
            .await
    }

    pub async fn load_host_service_state_w(
        &self,
        host_id: &str,
        service_state_id: &str,
    ) -> StateResult<(Versioned<HostServiceState>, Watch)> {
        self.entities
            .load_w(&paths::host_service_state(host_id, service_state_id)?)
            .await
    }

    pub async fn load_and_update_host_service_state(
        &self,
        host_id: &str,
        service_state_id: &str,
        mutation: impl Mutation<HostServiceState>,
    ) -> StateResult<Versioned<HostServiceState>> {
        self.entities
            .load_and_update(&paths::host_service_state(host_id, service_state_id)?, mutation)
            .await
    }

    /// Tell the agent on `host_id` to stop an instance.
    pub async fn terminate_host_service(
        &self,
        host_id: &str,
        service_state_id: &str,
    ) -> StateResult<()> {
        self.load_and_update_host_service_state(
            host_id,
            service_state_id,
            HostStateMutation::SetDesiredState(DesiredState::Stop),
        )
        .await?;
        debug!(%host_id, %service_state_id, "host service terminated");
        Ok(())
    }

    // ── Running services ──────────────────────────────────────────

    pub async fn running_service(
        &self,
        service_id: &str,
        service_state_id: &str,
    ) -> StateResult<RunningService> {
        let service = self.load_service(service_id).await?;
        let state = self.load_service_state(service_id, service_state_id).await?;
        Ok(RunningService::new(&service.value, &state.value))
    }

    /// Everything the shadows on `host_id` say should be running there.
    pub async fn running_services_for_host(&self, host_id: &str) -> StateResult<Vec<RunningService>> {
        let host = paths::host(host_id)?;
        let mut running = Vec::new();
        for id in self.entities.children(&host).await? {
            let shadow = self.load_host_service_state(host_id, &id).await?.value;
            running.push(
                self.running_service(&shadow.service_id, &shadow.service_state_id)
                    .await?,
            );
        }
        Ok(running)
    }

    pub async fn running_services_for_service(
        &self,
        service_id: &str,
    ) -> StateResult<Vec<RunningService>> {
        let service = self.load_service(service_id).await?.value;
        let states = self.service_states(&[service_id]).await?;
        Ok(states
            .iter()
            .map(|state| RunningService::new(&service, state))
            .collect())
    }

    pub async fn all_running_services(&self) -> StateResult<Vec<RunningService>> {
        let mut running = Vec::new();
        for service_id in self.entities.children(paths::SERVICE_ROOT).await? {
            running.extend(self.running_services_for_service(&service_id).await?);
        }
        Ok(running)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use fleet_coord::CoordStore;
    use tokio::time::Instant;

    pub(crate) async fn cluster() -> ClusterState {
        let session = CoordStore::open_in_memory().unwrap().connect();
        ClusterState::init(Arc::new(session)).await.unwrap()
    }

    async fn add_running_service(state: &ClusterState) -> Service {
        let mut service = Service::new("web");
        service.desired_state = DesiredState::Run;
        service.instances = 2;
        state.add_service(&service).await.unwrap();
        service
    }

    #[tokio::test]
    async fn add_and_load_service() {
        let state = cluster().await;
        let service = add_running_service(&state).await;

        let loaded = state.load_service(&service.id).await.unwrap();
        assert_eq!(loaded.value, service);
        assert!(state.add_service(&service).await.unwrap_err().to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn update_service_creates_when_missing() {
        let state = cluster().await;
        let mut service = Service::new("db");
        state.update_service(&service).await.unwrap();
        assert!(state.load_service(&service.id).await.is_ok());

        service.instances = 3;
        let version = state.update_service(&service).await.unwrap();
        assert_eq!(version, 1);
        assert_eq!(state.load_service(&service.id).await.unwrap().value.instances, 3);
    }

    #[tokio::test]
    async fn service_state_and_shadow_live_together() {
        let state = cluster().await;
        let service = add_running_service(&state).await;
        let instance = service.new_service_state("host-1");
        state.add_service_state(&instance).await.unwrap();

        let shadow = state
            .load_host_service_state("host-1", &instance.id)
            .await
            .unwrap()
            .value;
        assert_eq!(shadow.service_state_id, instance.id);
        assert_eq!(shadow.service_id, service.id);
        assert_eq!(shadow.desired_state, DesiredState::Run);
        assert_eq!(
            state.entities.children("/scheduler/host-1").await.unwrap(),
            vec![instance.id.clone()]
        );

        state
            .remove_service_state(&service.id, &instance.id)
            .await
            .unwrap();
        assert!(state
            .load_service_state(&service.id, &instance.id)
            .await
            .unwrap_err()
            .is_not_found());
        assert!(state
            .load_host_service_state("host-1", &instance.id)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn missing_shadow_surfaces_after_primary_delete() {
        let state = cluster().await;
        let service = add_running_service(&state).await;
        let instance = service.new_service_state("host-1");
        state.add_service_state(&instance).await.unwrap();

        let shadow = paths::host_service_state("host-1", &instance.id).unwrap();
        state.entities.delete(&shadow, 0).await.unwrap();

        let err = state
            .remove_service_state(&service.id, &instance.id)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(state
            .load_service_state(&service.id, &instance.id)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn failed_shadow_leaves_the_instance_in_place() {
        let state = cluster().await;
        let service = add_running_service(&state).await;
        let instance = service.new_service_state("host-1");

        let shadow = paths::host_service_state("host-1", &instance.id).unwrap();
        state.entities.ensure_path(&shadow).await.unwrap();

        let err = state.add_service_state(&instance).await.unwrap_err();
        assert!(matches!(err, StateError::AlreadyExists { ref path, .. } if *path == shadow));

        let primary = paths::service_state(&service.id, &instance.id).unwrap();
        assert!(state.entities.exists(&primary).await.unwrap());
        assert_eq!(
            state
                .load_service_state(&service.id, &instance.id)
                .await
                .unwrap()
                .value,
            instance
        );
    }

    #[tokio::test]
    async fn lifecycle_mutations() {
        let state = cluster().await;
        let service = add_running_service(&state).await;
        let instance = service.new_service_state("host-1");
        state.add_service_state(&instance).await.unwrap();

        state
            .terminate_host_service("host-1", &instance.id)
            .await
            .unwrap();
        let shadow = state
            .load_host_service_state("host-1", &instance.id)
            .await
            .unwrap();
        assert_eq!(shadow.value.desired_state, DesiredState::Stop);
        assert_eq!(shadow.version, 1);

        state
            .reset_service_state(&service.id, &instance.id)
            .await
            .unwrap();
        let reloaded = state
            .load_service_state(&service.id, &instance.id)
            .await
            .unwrap();
        assert!(reloaded.value.terminated.is_some());

        let mut changed = reloaded.value.clone();
        changed.container_id = "c-42".to_string();
        state.update_service_state(&changed).await.unwrap();
        assert_eq!(
            state
                .load_service_state(&service.id, &instance.id)
                .await
                .unwrap()
                .value
                .container_id,
            "c-42"
        );
    }

    #[tokio::test]
    async fn running_services_join_service_and_state() {
        let state = cluster().await;
        let web = add_running_service(&state).await;
        let db = add_running_service(&state).await;
        let a = web.new_service_state("host-1");
        let b = web.new_service_state("host-2");
        let c = db.new_service_state("host-1");
        for instance in [&a, &b, &c] {
            state.add_service_state(instance).await.unwrap();
        }

        let one = state.running_service(&web.id, &a.id).await.unwrap();
        assert_eq!(one.id, a.id);
        assert_eq!(one.name, "web");
        assert_eq!(one.desired_state, DesiredState::Run);

        let mut on_host: Vec<_> = state
            .running_services_for_host("host-1")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        on_host.sort();
        let mut expected = vec![a.id.clone(), c.id.clone()];
        expected.sort();
        assert_eq!(on_host, expected);

        assert_eq!(state.running_services_for_service(&web.id).await.unwrap().len(), 2);
        assert_eq!(state.all_running_services().await.unwrap().len(), 3);
        assert_eq!(state.service_states(&[web.id.as_str(), db.id.as_str()]).await.unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn remove_service_without_instances_is_immediate() {
        let state = cluster().await;
        let service = add_running_service(&state).await;

        let started = Instant::now();
        state.remove_service(&service.id).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(state.load_service(&service.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn remove_service_waits_for_instances_to_drain() {
        let state = cluster().await;
        let service = add_running_service(&state).await;
        let a = service.new_service_state("host-1");
        let b = service.new_service_state("host-2");
        state.add_service_state(&a).await.unwrap();
        state.add_service_state(&b).await.unwrap();

        let reaper = state.clone();
        let service_id = service.id.clone();
        tokio::spawn(async move {
            for instance in [a, b] {
                tokio::time::sleep(Duration::from_secs(10)).await;
                let stopped = reaper.load_service(&service_id).await.unwrap().value;
                assert_eq!(stopped.desired_state, DesiredState::Stop);
                reaper
                    .remove_service_state(&service_id, &instance.id)
                    .await
                    .unwrap();
            }
        });

        let started = Instant::now();
        state.remove_service(&service.id).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(20));
        assert!(state.load_service(&service.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn remove_service_times_out_with_instances_left() {
        let state = cluster().await;
        let service = add_running_service(&state).await;
        state
            .add_service_state(&service.new_service_state("host-1"))
            .await
            .unwrap();

        let started = Instant::now();
        let err = state.remove_service(&service.id).await.unwrap_err();
        let waited = started.elapsed();
        assert!(err.is_timeout());
        assert!(err.to_string().contains(&format!("/service/{}", service.id)));
        assert!(waited >= Duration::from_secs(30) && waited < Duration::from_secs(31));

        let kept = state.load_service(&service.id).await.unwrap().value;
        assert_eq!(kept.desired_state, DesiredState::Stop);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_window_is_configurable() {
        let state = cluster().await.with_timeouts(Timeouts {
            drain: Duration::from_secs(2),
            ..Timeouts::default()
        });
        let service = add_running_service(&state).await;
        state
            .add_service_state(&service.new_service_state("host-1"))
            .await
            .unwrap();

        let started = Instant::now();
        assert!(state.remove_service(&service.id).await.unwrap_err().is_timeout());
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
