use async_trait::async_trait;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use super::idle::IdleWindow;

/// effective arguments of one forward invocation, after defaults were applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ForwardTarget {
    pub user: String,
    pub host: String,
    pub listen_port: u16,
    pub destination: String,
    pub remote_port: u16,
}

impl ForwardTarget {
    pub fn remote_address(&self) -> String {
        format!("{}:{}", self.destination, self.remote_port)
    }
    pub fn login(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// how a forward invocation gave control back without failing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ForwardOutcome {
    /// the idle window closed; the tunnel was fine and should be restarted
    IdleExpired,
    /// the forwarding ended on its own without reporting an error
    Ended,
}

/// anything a backend reports other than a clean outcome; never retried by the worker
#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("{0}")]
    Remote(String),
    #[error("io error: {1}")]
    Io(std::io::Error, String),
    #[error("cannot listen on port {0}: {1}")]
    Bind(u16, String),
    #[error("cannot start {0}: {1}")]
    Spawn(String, String),
    #[error("ssh error: {0}")]
    Ssh(String),
    #[error("authentication rejected for {0}")]
    AuthRejected(String),
    #[error("host key for {0} has changed!")]
    HostKeyChanged(String),
    #[error("private key error: {0}")]
    PrivateKey(String),
    #[error("known hosts storage error: {0}")]
    Storage(String),
    #[error("env variable for private key error: {0}")]
    EnvError(String),
}

impl From<std::io::Error> for ForwardError {
    fn from(value: std::io::Error) -> Self {
        let str = value.to_string();
        Self::Io(value, str)
    }
}
impl From<russh::Error> for ForwardError {
    fn from(value: russh::Error) -> Self {
        Self::Ssh(value.to_string())
    }
}
impl From<russh::keys::Error> for ForwardError {
    fn from(value: russh::keys::Error) -> Self {
        Self::PrivateKey(value.to_string())
    }
}

/// The facility that performs the actual forwarding for one target. An
/// invocation blocks for the tunnel's active lifetime and must give control
/// back with [`ForwardOutcome::IdleExpired`] once `idle` has expired.
#[cfg_attr(test, automock)]
#[async_trait]
pub(crate) trait Forwarder: Send + Sync {
    async fn forward(
        &self,
        target: &ForwardTarget,
        idle: IdleWindow,
    ) -> Result<ForwardOutcome, ForwardError>;
}
