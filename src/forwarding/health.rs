use std::time::Duration;

use tokio::{
    net::TcpStream,
    sync::mpsc::Sender,
    task::JoinSet,
    time::{MissedTickBehavior, interval, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::Tunnel;

/// a tunnel (by index) whose listen port did not answer the last probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RestartRequest {
    pub index: usize,
}

/// Periodically dials every tunnel's local listen port. The checker only
/// reports: it writes the probe result into the tunnel state and asks the
/// supervisor for a restart when a port is unreachable.
pub(crate) struct HealthChecker {
    tunnels: Vec<Tunnel>,
    period: Duration,
    probe_timeout: Duration,
    restarts: Sender<RestartRequest>,
}

impl HealthChecker {
    pub fn new(
        tunnels: Vec<Tunnel>,
        period: Duration,
        probe_timeout: Duration,
        restarts: Sender<RestartRequest>,
    ) -> Self {
        HealthChecker {
            tunnels,
            period,
            probe_timeout,
            restarts,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("health checker shutting down");
                    return;
                }
                _ = ticker.tick() => self.probe_all().await,
            }
        }
    }

    /// probes every tunnel concurrently and waits for all of them
    pub async fn probe_all(&self) {
        let mut probes = JoinSet::new();
        for (index, tunnel) in self.tunnels.iter().enumerate() {
            let tunnel = tunnel.clone();
            let restarts = self.restarts.clone();
            let probe_timeout = self.probe_timeout;
            probes.spawn(async move {
                let port = tunnel.spec.listen_port;
                match probe(port, probe_timeout).await {
                    Ok(()) => tunnel.state.mark_healthy(),
                    Err(e) => {
                        warn!("probe of localhost:{} failed: {}", port, e);
                        tunnel.state.mark_failed(&e);
                        if restarts.send(RestartRequest { index }).await.is_err() {
                            debug!("restart request for :{} dropped, supervisor gone", port);
                        }
                    }
                }
            });
        }
        while probes.join_next().await.is_some() {}
    }
}

async fn probe(port: u16, probe_timeout: Duration) -> Result<(), String> {
    match timeout(probe_timeout, TcpStream::connect(("localhost", port))).await {
        Ok(Ok(_stream)) => Ok(()),
        Ok(Err(e)) => Err(format!("dial tcp localhost:{port}: {e}")),
        Err(_) => Err(format!("dial tcp localhost:{port}: i/o timeout")),
    }
}

#[cfg(test)]
mod tests {
    use tokio::{net::TcpListener, sync::mpsc};

    use super::*;
    use crate::forwarding::TunnelSpec;

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn reachable_port_is_healthy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let tunnel = Tunnel::new(TunnelSpec::new(port));
        tunnel.state.mark_failed("stale");
        let (tx, mut rx) = mpsc::channel(4);

        let checker = HealthChecker::new(
            vec![tunnel.clone()],
            Duration::from_secs(2),
            Duration::from_secs(1),
            tx,
        );
        checker.probe_all().await;

        let status = tunnel.state.snapshot();
        assert!(status.healthy);
        assert!(status.last_error.is_none());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unreachable_port_requests_restart() {
        let port = closed_port().await;
        let healthy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let tunnels = vec![
            Tunnel::new(TunnelSpec::new(healthy.local_addr().unwrap().port())),
            Tunnel::new(TunnelSpec::new(port)),
        ];
        let (tx, mut rx) = mpsc::channel(4);

        let checker = HealthChecker::new(
            tunnels.clone(),
            Duration::from_secs(2),
            Duration::from_secs(1),
            tx,
        );
        checker.probe_all().await;

        assert!(tunnels[0].state.snapshot().healthy);
        let status = tunnels[1].state.snapshot();
        assert!(!status.healthy);
        assert!(status.last_error.unwrap().contains(&port.to_string()));
        assert_eq!(rx.recv().await, Some(RestartRequest { index: 1 }));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn port_going_down_is_noticed_within_one_period() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let tunnel = Tunnel::new(TunnelSpec::new(port));
        let (tx, mut rx) = mpsc::channel(16);
        let period = Duration::from_millis(100);
        let checker = HealthChecker::new(vec![tunnel.clone()], period, Duration::from_millis(500), tx);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(checker.run(shutdown.clone()));

        tokio::time::sleep(period * 2).await;
        assert!(tunnel.state.snapshot().healthy);

        drop(listener);
        let request = tokio::time::timeout(period * 3, rx.recv()).await.unwrap();
        assert_eq!(request, Some(RestartRequest { index: 0 }));
        assert!(!tunnel.state.snapshot().healthy);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
