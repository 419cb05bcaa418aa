use thiserror::Error;
use tokio::process::Command;
use tracing::info;

use crate::{
    backends::tsh::TshForwarder,
    config::{self, BackendConfig, ConfigError, SshConfig},
};

#[derive(Error, Debug)]
pub enum LoginError {
    #[error("cannot start {0}: {1}")]
    Spawn(String, String),
    #[error("{0} exited with {1}")]
    Exited(String, String),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// Interactive session on `user@host` through the bastion, attached to the
/// current terminal.
pub(crate) async fn login(backend: &BackendConfig, user: &str, host: &str) -> Result<(), LoginError> {
    let mut command = login_command(backend, user, host)?;
    let program = command.as_std().get_program().to_string_lossy().into_owned();
    info!("login using {} {}", user, host);
    let status = command
        .status()
        .await
        .map_err(|e| LoginError::Spawn(program.clone(), e.to_string()))?;
    if !status.success() {
        return Err(LoginError::Exited(program, status.to_string()));
    }
    Ok(())
}

fn login_command(backend: &BackendConfig, user: &str, host: &str) -> Result<Command, LoginError> {
    let login = format!("{user}@{host}");
    match backend {
        BackendConfig::Tsh(config) => {
            let tsh = TshForwarder::new(config);
            let mut command = tsh.command();
            command.args(tsh.proxy_args()).arg("ssh").arg(login);
            Ok(command)
        }
        BackendConfig::Ssh(config) => {
            let mut command = Command::new("ssh");
            command.args(ssh_args(config)?).arg(login);
            Ok(command)
        }
    }
}

fn ssh_args(config: &SshConfig) -> Result<Vec<String>, ConfigError> {
    let key = config::expand_home(&config.private_key_path)?;
    Ok(vec![
        String::from("-J"),
        format!(
            "{}@{}:{}",
            config.bastion_user, config.bastion_address, config.bastion_port
        ),
        String::from("-p"),
        config.target_ssh_port.to_string(),
        String::from("-i"),
        key.display().to_string(),
    ])
}
