use std::{sync::Arc, time::Duration};

use forwarder::ForwardTarget;
use state::TunnelState;

pub(crate) mod forwarder;
pub(crate) mod health;
pub(crate) mod idle;
pub(crate) mod state;
pub(crate) mod supervisor;
pub(crate) mod worker;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(3 * 60);
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// one forwarding rule, fixed for the whole process lifetime
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TunnelSpec {
    /// local port the tunnel listens on
    pub listen_port: u16,
    /// overrides the default host when set
    pub remote_host: Option<String>,
    /// overrides the default user when set
    pub user_login: Option<String>,
    /// address the remote end connects to (localhost when unset)
    pub destination: Option<String>,
    /// port on the destination (the listen port when unset)
    pub remote_port: Option<u16>,
}

impl TunnelSpec {
    #[cfg(test)]
    pub fn new(listen_port: u16) -> Self {
        TunnelSpec {
            listen_port,
            remote_host: None,
            user_login: None,
            destination: None,
            remote_port: None,
        }
    }
    pub fn destination(&self) -> &str {
        self.destination.as_deref().unwrap_or("localhost")
    }
    pub fn remote_port(&self) -> u16 {
        self.remote_port.unwrap_or(self.listen_port)
    }
    pub fn remote_address(&self) -> String {
        format!("{}:{}", self.destination(), self.remote_port())
    }
}

/// user and host applied to every spec that leaves them empty
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Defaults {
    pub user: String,
    pub host: String,
}

impl Defaults {
    pub fn new(user: impl Into<String>, host: impl Into<String>) -> Self {
        Defaults {
            user: user.into(),
            host: host.into(),
        }
    }
    pub fn resolve(&self, spec: &TunnelSpec) -> ForwardTarget {
        let user = non_empty(&spec.user_login).unwrap_or(&self.user);
        let host = non_empty(&spec.remote_host).unwrap_or(&self.host);
        ForwardTarget {
            user: user.to_owned(),
            host: host.to_owned(),
            listen_port: spec.listen_port,
            destination: spec.destination().to_owned(),
            remote_port: spec.remote_port(),
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&String> {
    value.as_ref().filter(|v| !v.is_empty())
}

/// a spec paired with the health record shared by its worker, the
/// health checker and the dashboard
#[derive(Debug, Clone)]
pub(crate) struct Tunnel {
    pub spec: Arc<TunnelSpec>,
    pub state: TunnelState,
}

impl Tunnel {
    pub fn new(spec: TunnelSpec) -> Self {
        Tunnel {
            spec: Arc::new(spec),
            state: TunnelState::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SupervisorSettings {
    /// how long a forward invocation may run before it is restarted
    pub idle_timeout: Duration,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        SupervisorSettings {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            probe_interval: DEFAULT_PROBE_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_empty_fields() {
        let defaults = Defaults::new("root", "node-1");
        let mut spec = TunnelSpec::new(8080);
        spec.remote_host = Some(String::new());
        let target = defaults.resolve(&spec);
        assert_eq!(target.user, "root");
        assert_eq!(target.host, "node-1");
        assert_eq!(target.remote_address(), "localhost:8080");
    }

    #[test]
    fn spec_values_take_precedence() {
        let defaults = Defaults::new("root", "node-1");
        let spec = TunnelSpec {
            listen_port: 5432,
            remote_host: Some(String::from("db-1")),
            user_login: Some(String::from("postgres")),
            destination: Some(String::from("10.0.0.7")),
            remote_port: Some(6432),
        };
        let target = defaults.resolve(&spec);
        assert_eq!(target.user, "postgres");
        assert_eq!(target.host, "db-1");
        assert_eq!(target.listen_port, 5432);
        assert_eq!(target.remote_address(), "10.0.0.7:6432");
    }
}
