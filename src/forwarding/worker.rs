use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{
    Defaults, Tunnel,
    forwarder::{ForwardOutcome, Forwarder},
    idle::IdleWindow,
};

/// Keeps one tunnel forwarding. Every invocation gets a fresh idle window;
/// when it closes the tunnel is reported healthy and forwarding starts over.
/// Any error is recorded on the tunnel and ends the worker for good, the
/// supervisor decides whether a new worker is started.
pub(crate) async fn run(
    tunnel: Tunnel,
    defaults: Arc<Defaults>,
    forwarder: Arc<dyn Forwarder>,
    idle_timeout: Duration,
    shutdown: CancellationToken,
) {
    let port = tunnel.spec.listen_port;
    loop {
        let target = defaults.resolve(&tunnel.spec);
        let idle = IdleWindow::start(idle_timeout);
        tunnel.state.record_invocation();
        debug!(
            "forwarding :{} -> {} via {}",
            port,
            target.remote_address(),
            target.login()
        );

        let result = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("worker for :{} shutting down", port);
                return;
            }
            result = forwarder.forward(&target, idle) => result,
        };

        match result {
            Ok(ForwardOutcome::IdleExpired) => {
                info!("tunnel :{} reached its idle window, restarting", port);
                tunnel.state.mark_healthy();
            }
            Ok(ForwardOutcome::Ended) => {
                info!("tunnel :{} ended without error, restarting", port);
                tunnel.state.mark_healthy();
            }
            Err(e) => {
                error!("tunnel :{} failed: {}", port, e);
                tunnel.state.mark_failed(e);
                return;
            }
        }
    }
}
