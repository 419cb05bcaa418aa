use clap::Parser;
use cli::PortkeeperCli;
use config::{ConfigError, PortkeeperConfig, ProxyConfig};
use dashboard::TerminalDashboard;
use forwarding::{
    Defaults, SupervisorSettings,
    forwarder::ForwardError,
    supervisor::{Supervisor, SupervisorError},
};
use login::LoginError;
use thiserror::Error;

mod backends;
mod cli;
mod config;
mod dashboard;
mod forwarding;
mod login;
mod storage;

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Forward(#[from] ForwardError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Login(#[from] LoginError),
    #[error("pick at least one host to login")]
    NoHost,
    #[error("user login must not be empty")]
    NoUser,
}

#[tokio::main]
pub async fn main() -> Result<(), AppError> {
    let cli = PortkeeperCli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.log_level())
        .with_writer(std::io::stderr)
        .init();

    let config = PortkeeperConfig::load(cli.config.clone())?;
    let proxy = config.find_proxy(&cli.env)?;
    let host = pick(&cli.host, &proxy.default_host).ok_or(AppError::NoHost)?;
    let user = pick(&cli.user, &proxy.default_user).ok_or(AppError::NoUser)?;

    if cli.forwarding {
        forward(&config, proxy, Defaults::new(user, host)).await
    } else {
        Ok(login::login(&proxy.backend, &user, &host).await?)
    }
}

async fn forward(
    config: &PortkeeperConfig,
    proxy: &ProxyConfig,
    defaults: Defaults,
) -> Result<(), AppError> {
    let settings = SupervisorSettings::try_from(config.settings)?;
    let forwarder = backends::get_forwarder(&proxy.backend).await?;
    let supervisor = Supervisor::new(proxy.tunnel_specs(), defaults, forwarder, settings)?;
    let mut dashboard = TerminalDashboard::new(&proxy.env);
    supervisor.run(&mut dashboard).await?;
    Ok(())
}

/// flag value first, then the config default; empty strings count as unset
fn pick(flag: &Option<String>, default: &Option<String>) -> Option<String> {
    flag.iter()
        .chain(default.iter())
        .find(|v| !v.is_empty())
        .cloned()
}
