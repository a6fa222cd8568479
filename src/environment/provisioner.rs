//! Browser container lifecycle: prune, allocate, start, wait, open sessions,
//! destroy.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::{
    ContainerHandle, ContainerRuntime, ContainerSpec, PortAllocator, PortPair, ProvisionError,
    Readiness, RemoveOutcome, SELENIUM_CONTAINER_PORT,
};
use crate::browser::{BrowserSession, SessionConnector, SessionPool};
use crate::config::DockerConfig;
use crate::retry::{poll_until, retry};

/// A ready container plus the sessions opened against it.
pub struct Environment {
    pub handle: ContainerHandle,
    pub sessions: SessionPool,
}

pub struct ContainerProvisioner {
    runtime: Arc<dyn ContainerRuntime>,
    connector: Arc<dyn SessionConnector>,
    allocator: PortAllocator,
    config: DockerConfig,
    /// Ports of handles this process has handed out and not yet destroyed.
    /// A just-started container may not show up in the runtime's listing yet.
    reserved: Mutex<HashSet<u16>>,
}

impl ContainerProvisioner {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        connector: Arc<dyn SessionConnector>,
        config: DockerConfig,
    ) -> Self {
        Self {
            runtime,
            connector,
            allocator: PortAllocator::from_config(&config),
            config,
            reserved: Mutex::new(HashSet::new()),
        }
    }

    /// Start a browser container and open `sessions` sessions against it.
    ///
    /// Any container started here is destroyed before an error is returned.
    pub async fn provision(&self, sessions: usize) -> Result<Environment, ProvisionError> {
        let ports = self.reserve_ports().await?;
        let name = ContainerSpec::container_name(ports);
        let spec = ContainerSpec {
            name: name.clone(),
            image: self.config.image.clone(),
            network: self.config.network.clone(),
            ports,
            memory_bytes: self.config.memory_limit,
            shm_bytes: self.config.shm_size,
        };

        info!(container = %name, selenium_port = ports.selenium, display_port = ports.display, "starting browser container");
        let mut handle = ContainerHandle {
            name: name.clone(),
            id: String::new(),
            ports,
            readiness: Readiness::Creating,
        };

        match self.runtime.start(&spec).await {
            Ok(id) => handle.id = id,
            Err(e) => {
                error!(container = %name, error = %e, "container start failed");
                self.destroy(&handle).await;
                return Err(e);
            }
        }

        if let Err(e) = self.wait_running(&mut handle).await {
            self.destroy(&handle).await;
            return Err(e);
        }

        match self.open_sessions(&handle, sessions.max(1)).await {
            Ok(opened) => {
                info!(container = %name, sessions = opened.len(), "browser environment ready");
                Ok(Environment {
                    handle,
                    sessions: SessionPool::new(opened),
                })
            }
            Err(e) => {
                handle.readiness = Readiness::Unreachable;
                self.destroy(&handle).await;
                Err(e)
            }
        }
    }

    /// Stop and remove the container. Never fails.
    pub async fn destroy(&self, handle: &ContainerHandle) {
        match self.runtime.remove(&handle.name).await {
            Ok(RemoveOutcome::Removed) => {
                info!(container = %handle.name, "browser container removed");
            }
            Ok(RemoveOutcome::NotFound) => {
                warn!(container = %handle.name, "browser container already gone");
            }
            Err(e) => {
                error!(container = %handle.name, error = %e, "failed to remove browser container");
            }
        }

        let mut reserved = self.reserved.lock().await;
        reserved.remove(&handle.ports.selenium);
        reserved.remove(&handle.ports.display);
    }

    /// Session endpoint for a container.
    pub fn endpoint(&self, handle: &ContainerHandle) -> String {
        match &self.config.network {
            Some(_) => format!("http://{}:{}", handle.name, SELENIUM_CONTAINER_PORT),
            None => format!(
                "http://{}:{}",
                self.config.webdriver_host, handle.ports.selenium
            ),
        }
    }

    async fn reserve_ports(&self) -> Result<PortPair, ProvisionError> {
        let mut reserved = self.reserved.lock().await;

        match self.runtime.prune_exited().await {
            Ok(0) => {}
            Ok(n) => info!(pruned = n, "removed exited containers"),
            Err(e) => warn!(error = %e, "failed to prune exited containers"),
        }

        let mut occupied = self.runtime.published_ports().await?;
        occupied.extend(reserved.iter().copied());

        let ports = self.allocator.allocate(&occupied)?;
        reserved.insert(ports.selenium);
        reserved.insert(ports.display);
        Ok(ports)
    }

    async fn wait_running(&self, handle: &mut ContainerHandle) -> Result<(), ProvisionError> {
        tokio::time::sleep(self.config.startup_delay()).await;

        let runtime = &self.runtime;
        let name = handle.name.as_str();
        let ready = poll_until(
            self.config.ready_timeout(),
            self.config.ready_poll_interval(),
            move || async move {
                runtime
                    .is_running(name)
                    .await
                    .map(|running| running.then_some(()))
            },
        )
        .await;

        match ready {
            Ok(()) => {
                handle.readiness = Readiness::Ready;
                Ok(())
            }
            Err(deadline) => {
                handle.readiness = Readiness::Unreachable;
                error!(container = %handle.name, waited = ?deadline.waited, "container never reached running state");
                Err(ProvisionError::ContainerNotReady {
                    name: handle.name.clone(),
                    waited_secs: deadline.waited.as_secs(),
                })
            }
        }
    }

    async fn open_sessions(
        &self,
        handle: &ContainerHandle,
        count: usize,
    ) -> Result<Vec<Arc<dyn BrowserSession>>, ProvisionError> {
        tokio::time::sleep(self.config.session_warmup()).await;

        let endpoint = self.endpoint(handle);
        let connector = &self.connector;
        let mut opened: Vec<Arc<dyn BrowserSession>> = Vec::with_capacity(count);

        for _ in 0..count {
            let result = retry(
                self.config.session_attempts,
                self.config.session_backoff(),
                |attempt| {
                    let endpoint = endpoint.clone();
                    async move {
                        info!(%endpoint, attempt, "opening browser session");
                        connector.connect(&endpoint).await
                    }
                },
            )
            .await;

            match result {
                Ok(session) => opened.push(session),
                Err(exhausted) => {
                    for session in opened {
                        if let Err(e) = session.quit().await {
                            warn!(error = %e, "failed to close browser session");
                        }
                    }
                    return Err(ProvisionError::SessionUnavailable {
                        attempts: exhausted.attempts,
                        last_error: exhausted.last.to_string(),
                    });
                }
            }
        }

        Ok(opened)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory container runtime and session connector.

    use super::*;
    use crate::browser::testing::FakeSession;
    use crate::browser::SessionError;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone)]
    pub struct FakeContainer {
        pub ports: PortPair,
        pub running: bool,
    }

    #[derive(Default)]
    pub struct FakeRuntime {
        pub containers: std::sync::Mutex<HashMap<String, FakeContainer>>,
        /// Started containers never report running.
        pub never_ready: bool,
        pub removals: AtomicU32,
        pub pruned: AtomicU32,
    }

    impl FakeRuntime {
        pub fn with_exited(self, ports: PortPair) -> Self {
            self.containers.lock().unwrap().insert(
                ContainerSpec::container_name(ports),
                FakeContainer {
                    ports,
                    running: false,
                },
            );
            self
        }

        pub fn removals(&self) -> u32 {
            self.removals.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn prune_exited(&self) -> Result<usize, ProvisionError> {
            let mut containers = self.containers.lock().unwrap();
            let before = containers.len();
            containers.retain(|_, c| c.running);
            let n = before - containers.len();
            self.pruned.fetch_add(n as u32, Ordering::SeqCst);
            Ok(n)
        }

        async fn published_ports(&self) -> Result<HashSet<u16>, ProvisionError> {
            Ok(self
                .containers
                .lock()
                .unwrap()
                .values()
                .filter(|c| c.running)
                .flat_map(|c| [c.ports.selenium, c.ports.display])
                .collect())
        }

        async fn start(&self, spec: &ContainerSpec) -> Result<String, ProvisionError> {
            let mut containers = self.containers.lock().unwrap();
            if containers.contains_key(&spec.name) {
                return Err(ProvisionError::ContainerStart {
                    name: spec.name.clone(),
                    reason: "name already in use".to_string(),
                });
            }
            containers.insert(
                spec.name.clone(),
                FakeContainer {
                    ports: spec.ports,
                    running: !self.never_ready,
                },
            );
            Ok(format!("id-{}", spec.name))
        }

        async fn is_running(&self, name: &str) -> Result<bool, ProvisionError> {
            Ok(self
                .containers
                .lock()
                .unwrap()
                .get(name)
                .map(|c| c.running)
                .unwrap_or(false))
        }

        async fn remove(&self, name: &str) -> Result<RemoveOutcome, ProvisionError> {
            self.removals.fetch_add(1, Ordering::SeqCst);
            match self.containers.lock().unwrap().remove(name) {
                Some(_) => Ok(RemoveOutcome::Removed),
                None => Ok(RemoveOutcome::NotFound),
            }
        }
    }

    #[derive(Default)]
    pub struct FakeConnector {
        pub always_fail: bool,
        pub attempts: AtomicU32,
    }

    impl FakeConnector {
        pub fn failing() -> Self {
            Self {
                always_fail: true,
                ..Default::default()
            }
        }

        pub fn attempts(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl SessionConnector for FakeConnector {
        async fn connect(&self, endpoint: &str) -> Result<Arc<dyn BrowserSession>, SessionError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.always_fail {
                return Err(SessionError::Transport(format!("{endpoint} refused connection")));
            }
            Ok(Arc::new(FakeSession::default()))
        }
    }

    pub fn fast_config() -> DockerConfig {
        DockerConfig {
            startup_delay_secs: 0,
            ready_timeout_secs: 3,
            ready_poll_interval_ms: 500,
            session_warmup_secs: 0,
            session_attempts: 3,
            session_backoff_secs: 1,
            ..DockerConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn provisioner(runtime: Arc<FakeRuntime>, connector: Arc<FakeConnector>) -> ContainerProvisioner {
        ContainerProvisioner::new(runtime, connector, fast_config())
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_provisions_get_disjoint_ports() {
        let runtime = Arc::new(FakeRuntime::default());
        let prov = Arc::new(provisioner(runtime.clone(), Arc::new(FakeConnector::default())));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..6 {
            let prov = prov.clone();
            tasks.spawn(async move { prov.provision(1).await.map(|env| env.handle) });
        }

        let mut seen = HashSet::new();
        while let Some(res) = tasks.join_next().await {
            let handle = res.unwrap().unwrap();
            assert!(seen.insert(handle.ports.selenium), "selenium port reused");
            assert!(seen.insert(handle.ports.display), "display port reused");
            assert_eq!(handle.readiness, Readiness::Ready);
        }
        assert_eq!(seen.len(), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exited_container_ports_are_reclaimed() {
        let base = PortPair {
            selenium: 4444,
            display: 5900,
        };
        let runtime = Arc::new(FakeRuntime::default().with_exited(base));
        let prov = provisioner(runtime.clone(), Arc::new(FakeConnector::default()));

        let env = prov.provision(1).await.unwrap();
        assert_eq!(env.handle.ports, base);
        assert_eq!(runtime.pruned.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_retry_is_bounded_and_destroys_once() {
        let runtime = Arc::new(FakeRuntime::default());
        let connector = Arc::new(FakeConnector::failing());
        let prov = provisioner(runtime.clone(), connector.clone());

        let err = prov.provision(1).await.err().unwrap();
        assert!(matches!(
            err,
            ProvisionError::SessionUnavailable { attempts: 3, .. }
        ));
        assert_eq!(connector.attempts(), 3);
        assert_eq!(runtime.removals(), 1);
        assert!(runtime.containers.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_ready_container_is_destroyed() {
        let runtime = Arc::new(FakeRuntime {
            never_ready: true,
            ..Default::default()
        });
        let connector = Arc::new(FakeConnector::default());
        let prov = provisioner(runtime.clone(), connector.clone());

        let err = prov.provision(1).await.err().unwrap();
        assert!(matches!(err, ProvisionError::ContainerNotReady { waited_secs: 3, .. }));
        assert_eq!(runtime.removals(), 1);
        assert_eq!(connector.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_releases_ports_and_tolerates_missing_container() {
        let runtime = Arc::new(FakeRuntime::default());
        let prov = provisioner(runtime.clone(), Arc::new(FakeConnector::default()));

        let env = prov.provision(1).await.unwrap();
        prov.destroy(&env.handle).await;
        prov.destroy(&env.handle).await;
        assert_eq!(runtime.removals(), 2);

        let again = prov.provision(1).await.unwrap();
        assert_eq!(again.handle.ports, env.handle.ports);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_session_per_worker() {
        let connector = Arc::new(FakeConnector::default());
        let prov = provisioner(Arc::new(FakeRuntime::default()), connector.clone());
        let env = prov.provision(3).await.unwrap();
        assert_eq!(env.sessions.size(), 3);
        assert_eq!(connector.attempts(), 3);
    }

    #[test]
    fn test_endpoint_prefers_container_name_on_network() {
        let mut config = fast_config();
        let handle = ContainerHandle {
            name: "selenium_vnc_4445_5901".into(),
            id: "x".into(),
            ports: PortPair {
                selenium: 4445,
                display: 5901,
            },
            readiness: Readiness::Ready,
        };

        let prov = ContainerProvisioner::new(
            Arc::new(FakeRuntime::default()),
            Arc::new(FakeConnector::default()),
            config.clone(),
        );
        assert_eq!(prov.endpoint(&handle), "http://127.0.0.1:4445");

        config.network = Some("grid".into());
        let prov = ContainerProvisioner::new(
            Arc::new(FakeRuntime::default()),
            Arc::new(FakeConnector::default()),
            config,
        );
        assert_eq!(prov.endpoint(&handle), "http://selenium_vnc_4445_5901:4444");
    }
}
