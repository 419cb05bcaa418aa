use std::{
    io::{self, Write},
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::{MissedTickBehavior, interval};

use crate::forwarding::{Tunnel, state::TunnelStatus};

const REFRESH: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum DashboardError {
    #[error("io error: {1}")]
    Io(std::io::Error, String),
}
impl From<std::io::Error> for DashboardError {
    fn from(value: std::io::Error) -> Self {
        let str = value.to_string();
        Self::Io(value, str)
    }
}

/// Foreground view of the tunnels. Returning from `run` ends the
/// forwarding session.
#[async_trait]
pub(crate) trait Dashboard: Send {
    async fn run(&mut self, tunnels: &[Tunnel]) -> Result<(), DashboardError>;
}

/// redraws a status table on stdout until ctrl-c
pub(crate) struct TerminalDashboard {
    env: String,
}

impl TerminalDashboard {
    pub fn new(env: impl Into<String>) -> Self {
        TerminalDashboard { env: env.into() }
    }

    fn render(&self, tunnels: &[Tunnel]) -> String {
        let mut out = String::from("\x1b[2J\x1b[H");
        out.push_str(&format!(
            "forwarding through {} (ctrl-c to quit)\n\n",
            self.env
        ));
        out.push_str(&format!(
            "{:<8} {:<28} {:<9} {:>6}  {}\n",
            "PORT", "REMOTE", "STATUS", "RUNS", "ERROR"
        ));
        for tunnel in tunnels {
            out.push_str(&render_row(
                tunnel.spec.listen_port,
                &tunnel.spec.remote_address(),
                &tunnel.state.snapshot(),
            ));
        }
        out
    }
}

fn render_row(port: u16, remote: &str, status: &TunnelStatus) -> String {
    let health = if status.healthy { "up" } else { "down" };
    format!(
        "{:<8} {:<28} {:<9} {:>6}  {}\n",
        port,
        remote,
        health,
        status.invocations,
        status.last_error.as_deref().unwrap_or("")
    )
}

#[async_trait]
impl Dashboard for TerminalDashboard {
    async fn run(&mut self, tunnels: &[Tunnel]) -> Result<(), DashboardError> {
        let mut ticker = interval(REFRESH);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let interrupted = tokio::signal::ctrl_c();
        tokio::pin!(interrupted);
        loop {
            tokio::select! {
                result = &mut interrupted => {
                    result?;
                    println!();
                    return Ok(());
                }
                _ = ticker.tick() => {
                    let frame = self.render(tunnels);
                    let mut stdout = io::stdout().lock();
                    stdout.write_all(frame.as_bytes())?;
                    stdout.flush()?;
                }
            }
        }
    }
}
