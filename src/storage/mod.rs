use std::path::Path;

use async_trait::async_trait;
use local::LocalStorage;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use crate::forwarding::forwarder::ForwardError;

pub(crate) mod local;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("sqlite returned an error: {1}")]
    LocalSqlite(rusqlite::Error, String),
    #[error("cannot prepare {0}: {1}")]
    Directory(String, String),
}

/// known host fingerprints, used for trust-on-first-use host key checks
#[cfg_attr(test, automock)]
#[async_trait]
pub(crate) trait Storage: Send + Sync {
    async fn get_server_fingerprint(&self, address: &str) -> Result<Option<String>, StorageError>;
    async fn store_server_fingerprint(
        &self,
        address: &str,
        fingerprint: &str,
    ) -> Result<(), StorageError>;
    async fn ensure(&self) -> Result<(), StorageError>;
}

pub(crate) async fn get_storage(path: &Path) -> Result<Box<dyn Storage>, StorageError> {
    let storage = LocalStorage::open(path)?;
    storage.ensure().await?;
    Ok(Box::new(storage))
}

impl From<StorageError> for ForwardError {
    fn from(err: StorageError) -> Self {
        ForwardError::Storage(err.to_string())
    }
}
