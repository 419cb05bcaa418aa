use std::sync::Arc;

use ssh::SshForwarder;
use tsh::TshForwarder;

use crate::{
    config::BackendConfig,
    forwarding::forwarder::{ForwardError, Forwarder},
};

mod handler;
pub(crate) mod ssh;
pub(crate) mod tsh;

pub(crate) async fn get_forwarder(backend: &BackendConfig) -> Result<Arc<dyn Forwarder>, ForwardError> {
    match backend {
        BackendConfig::Tsh(config) => Ok(Arc::new(TshForwarder::new(config))),
        BackendConfig::Ssh(config) => Ok(Arc::new(SshForwarder::new(config).await?)),
    }
}
