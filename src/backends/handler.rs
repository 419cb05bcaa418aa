use std::sync::Arc;

use russh::client::Handler;
use tracing::info;

use crate::{forwarding::forwarder::ForwardError, storage::Storage};

/// russh client handler verifying host keys trust-on-first-use
pub(super) struct HostKeyHandler {
    /// key under which the fingerprint is stored (host:port)
    server: String,
    storage: Arc<dyn Storage>,
}
impl HostKeyHandler {
    pub fn new(server_address: &str, server_port: u16, storage: Arc<dyn Storage>) -> Self {
        HostKeyHandler {
            server: format!("{server_address}:{server_port}"),
            storage,
        }
    }
}
impl Handler for HostKeyHandler {
    type Error = ForwardError;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        let server_fingerprint = server_public_key
            .fingerprint(Default::default())
            .to_string();
        info!("{} got server key: {}", self.server, server_fingerprint);

        match self.storage.get_server_fingerprint(&self.server).await? {
            Some(stored_fingerprint) => {
                if server_fingerprint != stored_fingerprint {
                    tracing::error!("{:?} host key has changed!", self.server);
                    return Err(ForwardError::HostKeyChanged(self.server.clone()));
                }
                tracing::info!("host key for {:?} matches the stored one", self.server);
            }
            None => {
                // tofu: store the key!
                self.storage
                    .store_server_fingerprint(&self.server, &server_fingerprint)
                    .await?;
            }
        }
        Ok(true)
    }
}
