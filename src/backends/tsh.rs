use std::process::Stdio;

use async_trait::async_trait;
use tokio::{io::AsyncReadExt, process::Command};
use tracing::debug;

use crate::{
    config::TshConfig,
    forwarding::{
        forwarder::{ForwardError, ForwardOutcome, ForwardTarget, Forwarder},
        idle::IdleWindow,
    },
};

/// Drives the teleport `tsh` client: one `tsh ssh -N -L` process per
/// invocation, killed once the idle window closes.
pub(crate) struct TshForwarder {
    binary: String,
    proxy: String,
    auth_connector: Option<String>,
}

impl TshForwarder {
    pub fn new(config: &TshConfig) -> Self {
        TshForwarder {
            binary: config.binary.clone(),
            proxy: config.proxy.clone(),
            auth_connector: config.auth_connector.clone(),
        }
    }

    /// arguments shared by every tsh invocation
    pub fn proxy_args(&self) -> Vec<String> {
        let mut args = vec![format!("--proxy={}", self.proxy)];
        if let Some(connector) = &self.auth_connector {
            args.push(format!("--auth={connector}"));
        }
        args
    }

    pub fn forward_args(&self, target: &ForwardTarget) -> Vec<String> {
        let mut args = self.proxy_args();
        args.extend([
            String::from("ssh"),
            String::from("-N"),
            String::from("-L"),
            format!("{}:{}", target.listen_port, target.remote_address()),
            target.login(),
        ]);
        args
    }

    pub fn command(&self) -> Command {
        Command::new(&self.binary)
    }
}

#[async_trait]
impl Forwarder for TshForwarder {
    async fn forward(
        &self,
        target: &ForwardTarget,
        idle: IdleWindow,
    ) -> Result<ForwardOutcome, ForwardError> {
        let mut child = self
            .command()
            .args(self.forward_args(target))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ForwardError::Spawn(self.binary.clone(), e.to_string()))?;
        debug!("spawned {} for :{}", self.binary, target.listen_port);

        let stderr = child.stderr.take();
        let collector = tokio::spawn(async move {
            let mut output = String::new();
            if let Some(mut stderr) = stderr {
                if let Err(e) = stderr.read_to_string(&mut output).await {
                    debug!("cannot read tsh stderr: {}", e);
                }
            }
            output
        });

        tokio::select! {
            _ = idle.expired() => {
                child.kill().await?;
                collector.abort();
                Ok(ForwardOutcome::IdleExpired)
            }
            status = child.wait() => {
                let status = status?;
                let output = collector.await.unwrap_or_default();
                if status.success() {
                    Ok(ForwardOutcome::Ended)
                } else {
                    Err(ForwardError::Remote(failure_message(&output, &status.to_string())))
                }
            }
        }
    }
}

/// last meaningful line tsh printed, or the exit status when it printed nothing
fn failure_message(stderr: &str, status: &str) -> String {
    stderr
        .lines()
        .map(str::trim)
        .rev()
        .find(|line| !line.is_empty())
        .map(String::from)
        .unwrap_or_else(|| format!("tsh {status}"))
}
