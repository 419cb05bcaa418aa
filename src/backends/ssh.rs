use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use russh::{
    Disconnect,
    client::{self, Handle},
    keys::{PrivateKey, PrivateKeyWithHashAlg, load_secret_key},
};
use tokio::{
    io::{AsyncRead, AsyncWrite, copy_bidirectional},
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tracing::{debug, info, warn};

use super::handler::HostKeyHandler;
use crate::{
    config::{self, EnvOrValue, SshConfig},
    forwarding::{
        forwarder::{ForwardError, ForwardOutcome, ForwardTarget, Forwarder},
        idle::IdleWindow,
    },
    storage::{self, Storage},
};

/// Forwards over native SSH: one session to the bastion, a second one to
/// the target host tunnelled through it, then a local listener whose
/// connections are opened as `direct-tcpip` channels from the target.
pub(crate) struct SshForwarder {
    /// public address of the machine used as bastion
    bastion_address: String,
    bastion_port: u16,
    bastion_user: String,
    /// ssh port of the hosts behind the bastion
    target_ssh_port: u16,
    /// key used for both hops
    private_key: Arc<PrivateKey>,
    storage: Arc<dyn Storage>,
}

impl SshForwarder {
    pub async fn new(config: &SshConfig) -> Result<Self, ForwardError> {
        let private_key =
            SshForwarder::load_private_key(&config.private_key_path, &config.private_key_passphrase)?;
        let known_hosts = known_hosts_path(config)?;
        let storage = storage::get_storage(&known_hosts).await?;
        Ok(SshForwarder {
            bastion_address: config.bastion_address.clone(),
            bastion_port: config.bastion_port,
            bastion_user: config.bastion_user.clone(),
            target_ssh_port: config.target_ssh_port,
            private_key: Arc::new(private_key),
            storage: Arc::from(storage),
        })
    }

    async fn connect_bastion(&self) -> Result<Handle<HostKeyHandler>, ForwardError> {
        let config = Arc::new(client::Config::default());
        let mut session = client::connect(
            config,
            (self.bastion_address.to_owned(), self.bastion_port),
            HostKeyHandler::new(&self.bastion_address, self.bastion_port, self.storage.clone()),
        )
        .await?;
        self.authenticate(&mut session, &self.bastion_user).await?;
        Ok(session)
    }

    /// opens a session to `host` through an authenticated bastion session
    async fn connect_target(
        &self,
        bastion: &Handle<HostKeyHandler>,
        target: &ForwardTarget,
    ) -> Result<Handle<HostKeyHandler>, ForwardError> {
        let channel = bastion
            .channel_open_direct_tcpip(
                target.host.to_owned(),
                self.target_ssh_port as u32,
                "127.0.0.1",
                0,
            )
            .await?;
        let config = Arc::new(client::Config::default());
        let mut session = client::connect_stream(
            config,
            channel.into_stream(),
            HostKeyHandler::new(&target.host, self.target_ssh_port, self.storage.clone()),
        )
        .await?;
        self.authenticate(&mut session, &target.user).await?;
        Ok(session)
    }

    async fn authenticate(
        &self,
        session: &mut Handle<HostKeyHandler>,
        user: &str,
    ) -> Result<(), ForwardError> {
        let hash_alg = session.best_supported_rsa_hash().await?.flatten();
        let auth_res = session
            .authenticate_publickey(
                user.to_owned(),
                PrivateKeyWithHashAlg::new(self.private_key.clone(), hash_alg),
            )
            .await?;
        if !auth_res.success() {
            return Err(ForwardError::AuthRejected(user.to_owned()));
        }
        Ok(())
    }

    fn load_private_key(
        key_path: &str,
        passphrase: &Option<EnvOrValue>,
    ) -> Result<PrivateKey, ForwardError> {
        let key_path = config::expand_home(key_path)
            .map_err(|e| ForwardError::PrivateKey(e.to_string()))?;
        match passphrase {
            Some(passphrase) => {
                let secret = passphrase
                    .get()
                    .map_err(|e| ForwardError::EnvError(e.to_string()))?;
                Ok(load_secret_key(key_path, Some(secret.as_str()))?)
            }
            None => Ok(load_secret_key(key_path, None)?),
        }
    }
}

fn known_hosts_path(config: &SshConfig) -> Result<PathBuf, ForwardError> {
    let raw = config
        .known_hosts_path
        .as_deref()
        .unwrap_or(config::DEFAULT_KNOWN_HOSTS_PATH);
    config::expand_home(raw).map_err(|e| ForwardError::Storage(e.to_string()))
}

#[async_trait]
impl Forwarder for SshForwarder {
    async fn forward(
        &self,
        target: &ForwardTarget,
        idle: IdleWindow,
    ) -> Result<ForwardOutcome, ForwardError> {
        let bastion = self.connect_bastion().await?;
        let session = self.connect_target(&bastion, target).await?;
        let listener = TcpListener::bind(("127.0.0.1", target.listen_port))
            .await
            .map_err(|e| ForwardError::Bind(target.listen_port, e.to_string()))?;
        info!(
            "forwarding 127.0.0.1:{} -> {} via {}",
            target.listen_port,
            target.remote_address(),
            target.login()
        );

        let session = Arc::new(session);
        let opener = Arc::new(DirectTcpip {
            session: session.clone(),
            destination: target.destination.clone(),
            remote_port: target.remote_port,
        });
        let outcome = tokio::select! {
            _ = idle.expired() => Ok(ForwardOutcome::IdleExpired),
            result = accept_loop(&listener, opener) => result,
        };

        for handle in [session.as_ref(), &bastion] {
            if let Err(e) = handle
                .disconnect(Disconnect::ByApplication, "", "en")
                .await
            {
                debug!("failed to disconnect gracefully: {}", e);
            }
        }
        outcome
    }
}

/// consecutive channel failures after which the target session is considered dead
const MAX_CONSECUTIVE_FAILURES: usize = 3;

/// opens the remote end of one forwarded connection
#[async_trait]
trait ChannelOpener: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn open(&self, peer: SocketAddr) -> Result<Self::Stream, ForwardError>;
}

struct DirectTcpip {
    session: Arc<Handle<HostKeyHandler>>,
    destination: String,
    remote_port: u16,
}

#[async_trait]
impl ChannelOpener for DirectTcpip {
    type Stream = russh::ChannelStream<client::Msg>;

    async fn open(&self, peer: SocketAddr) -> Result<Self::Stream, ForwardError> {
        let channel = self
            .session
            .channel_open_direct_tcpip(
                self.destination.to_owned(),
                self.remote_port as u32,
                peer.ip().to_string(),
                peer.port() as u32,
            )
            .await?;
        Ok(channel.into_stream())
    }
}

/// Accepts local connections and relays each one over its own channel.
/// A channel that cannot be opened only drops that connection; the loop
/// gives up when the listener breaks or several channels in a row fail.
async fn accept_loop<O: ChannelOpener>(
    listener: &TcpListener,
    opener: Arc<O>,
) -> Result<ForwardOutcome, ForwardError> {
    let (report_tx, mut reports) = mpsc::unbounded_channel::<bool>();
    let mut failures = 0;
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = accepted?;
                debug!("accepted connection from {}", peer_addr);
                let opener = opener.clone();
                let report_tx = report_tx.clone();
                tokio::spawn(async move {
                    let channel = match opener.open(peer_addr).await {
                        Ok(channel) => channel,
                        Err(e) => {
                            warn!("cannot open channel for {}: {}", peer_addr, e);
                            let _ = report_tx.send(false);
                            return;
                        }
                    };
                    let _ = report_tx.send(true);
                    if let Err(e) = relay(stream, channel).await {
                        debug!("forwarded connection ended: {}", e);
                    }
                });
            }
            Some(opened) = reports.recv() => {
                if opened {
                    failures = 0;
                    continue;
                }
                failures += 1;
                if failures >= MAX_CONSECUTIVE_FAILURES {
                    return Err(ForwardError::Ssh(format!(
                        "session appears dead after {failures} consecutive channel failures"
                    )));
                }
            }
        }
    }
}

async fn relay<S>(mut stream: TcpStream, mut channel: S) -> Result<(), std::io::Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (from_local, from_remote) = copy_bidirectional(&mut stream, &mut channel).await?;
    debug!(
        "forwarded connection closed: {} bytes sent, {} bytes received",
        from_local, from_remote
    );
    Ok(())
}
