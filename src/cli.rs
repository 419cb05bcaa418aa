use clap::{ArgAction, Parser};
use tracing::Level;

#[derive(Parser)]
#[command(version, about = "Portkeeper logs you into hosts behind a bastion and keeps local ports forwarded through it", long_about = None)]
pub(crate) struct PortkeeperCli {
    /// environment (proxy) to use, as named in the config file
    pub env: String,
    /// keep the environment's forwarding list running instead of logging in
    #[arg(short = 'L', long)]
    pub forwarding: bool,
    /// user to log in with
    #[arg(short, long)]
    pub user: Option<String>,
    /// host to log in to
    #[arg(short = 'H', long)]
    pub host: Option<String>,
    /// custom config file
    #[arg(short, long)]
    pub config: Option<String>,
    /// more logging, repeat for more
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl PortkeeperCli {
    pub fn log_level(&self) -> Level {
        match self.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    }
}
