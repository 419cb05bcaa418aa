use std::{collections::HashSet, sync::Arc};

use futures::future::join_all;
use thiserror::Error;
use tokio::{
    sync::mpsc::{self, Receiver},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    Defaults, SupervisorSettings, Tunnel, TunnelSpec,
    forwarder::Forwarder,
    health::{HealthChecker, RestartRequest},
    worker,
};
use crate::dashboard::{Dashboard, DashboardError};

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("forwarding configuration is empty")]
    EmptyConfiguration,
    #[error("listen port {0} is used by more than one tunnel")]
    DuplicateListenPort(u16),
    #[error("dashboard error: {0}")]
    Dashboard(#[from] DashboardError),
}

/// Starts one worker per tunnel plus a single health checker, and is the
/// only component that restarts a worker once it has stopped.
#[derive(Clone)]
pub(crate) struct Supervisor {
    tunnels: Vec<Tunnel>,
    defaults: Arc<Defaults>,
    forwarder: Arc<dyn Forwarder>,
    settings: SupervisorSettings,
}

impl Supervisor {
    pub fn new(
        specs: Vec<TunnelSpec>,
        defaults: Defaults,
        forwarder: Arc<dyn Forwarder>,
        settings: SupervisorSettings,
    ) -> Result<Self, SupervisorError> {
        if specs.is_empty() {
            return Err(SupervisorError::EmptyConfiguration);
        }
        let mut ports = HashSet::new();
        for spec in &specs {
            if !ports.insert(spec.listen_port) {
                return Err(SupervisorError::DuplicateListenPort(spec.listen_port));
            }
        }
        Ok(Supervisor {
            tunnels: specs.into_iter().map(Tunnel::new).collect(),
            defaults: Arc::new(defaults),
            forwarder,
            settings,
        })
    }

    pub fn tunnels(&self) -> &[Tunnel] {
        &self.tunnels
    }

    /// launches every task and returns a handle used to stop them
    pub fn start(&self) -> SupervisorHandle {
        let shutdown = CancellationToken::new();
        let (restart_tx, restart_rx) = mpsc::channel(self.tunnels.len());

        let workers = self
            .tunnels
            .iter()
            .map(|tunnel| self.spawn_worker(tunnel, &shutdown))
            .collect();
        info!("started {} tunnel workers", self.tunnels.len());

        let checker = HealthChecker::new(
            self.tunnels.clone(),
            self.settings.probe_interval,
            self.settings.probe_timeout,
            restart_tx,
        );
        let health = tokio::spawn(checker.run(shutdown.clone()));
        let control = tokio::spawn(self.clone().control(workers, restart_rx, shutdown.clone()));

        SupervisorHandle {
            shutdown,
            health,
            control,
        }
    }

    /// starts everything, runs the dashboard in the foreground and tears
    /// the tunnels down once it returns
    pub async fn run<D: Dashboard>(&self, dashboard: &mut D) -> Result<(), SupervisorError> {
        let handle = self.start();
        let result = dashboard.run(self.tunnels()).await;
        handle.shutdown().await;
        result?;
        Ok(())
    }

    fn spawn_worker(&self, tunnel: &Tunnel, shutdown: &CancellationToken) -> JoinHandle<()> {
        tokio::spawn(worker::run(
            tunnel.clone(),
            self.defaults.clone(),
            self.forwarder.clone(),
            self.settings.idle_timeout,
            shutdown.child_token(),
        ))
    }

    async fn control(
        self,
        mut workers: Vec<JoinHandle<()>>,
        mut restarts: Receiver<RestartRequest>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                request = restarts.recv() => {
                    let Some(RestartRequest { index }) = request else { break };
                    let (Some(worker), Some(tunnel)) =
                        (workers.get_mut(index), self.tunnels.get(index))
                    else {
                        warn!("restart requested for unknown tunnel #{}", index);
                        continue;
                    };
                    // a running worker still owns the tunnel
                    if !worker.is_finished() {
                        continue;
                    }
                    info!("respawning worker for :{}", tunnel.spec.listen_port);
                    *worker = self.spawn_worker(tunnel, &shutdown);
                }
            }
        }
        debug!("waiting for {} workers to stop", workers.len());
        join_all(workers).await;
    }
}

/// running supervisor tasks; dropping it leaves them running until process exit
pub(crate) struct SupervisorHandle {
    shutdown: CancellationToken,
    health: JoinHandle<()>,
    control: JoinHandle<()>,
}

impl SupervisorHandle {
    /// cancels every worker and the health checker and waits for them to stop
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.health.await {
            warn!("health checker ended abnormally: {}", e);
        }
        if let Err(e) = self.control.await {
            warn!("supervisor control loop ended abnormally: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;
    use tokio::net::TcpListener;

    use super::*;
    use crate::forwarding::{
        forwarder::{ForwardError, ForwardOutcome, ForwardTarget, MockForwarder},
        idle::IdleWindow,
    };

    fn fast_settings() -> SupervisorSettings {
        SupervisorSettings {
            idle_timeout: Duration::from_secs(60),
            probe_interval: Duration::from_millis(50),
            probe_timeout: Duration::from_millis(200),
        }
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    /// fails every invocation, counting them
    #[derive(Default)]
    struct RefusingForwarder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Forwarder for RefusingForwarder {
        async fn forward(
            &self,
            _target: &ForwardTarget,
            _idle: IdleWindow,
        ) -> Result<ForwardOutcome, ForwardError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ForwardError::Remote(String::from("connection refused")))
        }
    }

    /// binds the listen port and holds it until the idle window closes
    #[derive(Default)]
    struct ListeningForwarder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Forwarder for ListeningForwarder {
        async fn forward(
            &self,
            target: &ForwardTarget,
            idle: IdleWindow,
        ) -> Result<ForwardOutcome, ForwardError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _listener = TcpListener::bind(("127.0.0.1", target.listen_port)).await?;
            idle.expired().await;
            Ok(ForwardOutcome::IdleExpired)
        }
    }

    /// never binds the listen port; only returns once the idle window closes
    #[derive(Default)]
    struct StalledForwarder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Forwarder for StalledForwarder {
        async fn forward(
            &self,
            _target: &ForwardTarget,
            idle: IdleWindow,
        ) -> Result<ForwardOutcome, ForwardError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            idle.expired().await;
            Ok(ForwardOutcome::IdleExpired)
        }
    }

    struct TimedDashboard {
        duration: Duration,
        seen: usize,
    }

    #[async_trait]
    impl Dashboard for TimedDashboard {
        async fn run(&mut self, tunnels: &[Tunnel]) -> Result<(), DashboardError> {
            self.seen = tunnels.len();
            tokio::time::sleep(self.duration).await;
            Ok(())
        }
    }

    #[test]
    fn empty_configuration_is_rejected() {
        let forwarder = MockForwarder::new();
        let result = Supervisor::new(
            vec![],
            Defaults::new("root", "node-1"),
            Arc::new(forwarder),
            SupervisorSettings::default(),
        );
        let err = result.err().unwrap();
        assert!(matches!(err, SupervisorError::EmptyConfiguration));
        assert_eq!(err.to_string(), "forwarding configuration is empty");
    }

    #[test]
    fn duplicate_listen_ports_are_rejected() {
        let result = Supervisor::new(
            vec![TunnelSpec::new(8080), TunnelSpec::new(9090), TunnelSpec::new(8080)],
            Defaults::new("root", "node-1"),
            Arc::new(MockForwarder::new()),
            SupervisorSettings::default(),
        );
        assert!(matches!(
            result.err().unwrap(),
            SupervisorError::DuplicateListenPort(8080)
        ));
    }

    #[tokio::test]
    async fn healthy_tunnels_are_not_respawned() {
        let port = closed_port().await;
        let forwarder = Arc::new(ListeningForwarder::default());
        let supervisor = Supervisor::new(
            vec![TunnelSpec::new(port)],
            Defaults::new("root", "node-1"),
            forwarder.clone(),
            fast_settings(),
        )
        .unwrap();

        let handle = supervisor.start();
        tokio::time::sleep(Duration::from_millis(500)).await;
        let status = supervisor.tunnels()[0].state.snapshot();
        assert!(status.healthy);
        assert_eq!(forwarder.calls.load(Ordering::SeqCst), 1);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn failed_worker_is_respawned_after_probe_failure() {
        let port = closed_port().await;
        let forwarder = Arc::new(RefusingForwarder::default());
        let supervisor = Supervisor::new(
            vec![TunnelSpec::new(port)],
            Defaults::new("root", "node-1"),
            forwarder.clone(),
            fast_settings(),
        )
        .unwrap();

        let handle = supervisor.start();
        let respawned = tokio::time::timeout(Duration::from_secs(5), async {
            while forwarder.calls.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(respawned.is_ok());
        assert!(!supervisor.tunnels()[0].state.snapshot().healthy);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn running_worker_is_not_duplicated_while_port_is_closed() {
        let port = closed_port().await;
        let forwarder = Arc::new(StalledForwarder::default());
        let settings = SupervisorSettings {
            probe_interval: Duration::from_millis(20),
            ..fast_settings()
        };
        let supervisor = Supervisor::new(
            vec![TunnelSpec::new(port)],
            Defaults::new("root", "node-1"),
            forwarder.clone(),
            settings,
        )
        .unwrap();

        let handle = supervisor.start();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(forwarder.calls.load(Ordering::SeqCst), 1);
        assert!(!supervisor.tunnels()[0].state.snapshot().healthy);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn run_shuts_down_after_dashboard_returns() {
        let ports = [closed_port().await, closed_port().await];
        let forwarder = Arc::new(ListeningForwarder::default());
        let supervisor = Supervisor::new(
            ports.iter().map(|p| TunnelSpec::new(*p)).collect(),
            Defaults::new("root", "node-1"),
            forwarder.clone(),
            fast_settings(),
        )
        .unwrap();
        let mut dashboard = TimedDashboard {
            duration: Duration::from_millis(200),
            seen: 0,
        };

        let result = tokio::time::timeout(Duration::from_secs(5), supervisor.run(&mut dashboard)).await;
        assert!(result.unwrap().is_ok());
        assert_eq!(dashboard.seen, 2);
        assert_eq!(forwarder.calls.load(Ordering::SeqCst), 2);
    }
}
