use std::{
    path::Path,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension};

use super::{Storage, StorageError};

pub struct LocalStorage {
    connection: Arc<Mutex<rusqlite::Connection>>,
}
impl LocalStorage {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::Directory(parent.display().to_string(), e.to_string())
            })?;
        }
        Ok(LocalStorage {
            connection: Arc::new(Mutex::new(Connection::open(path)?)),
        })
    }
    #[cfg(test)]
    pub fn in_memory() -> Result<Self, StorageError> {
        Ok(LocalStorage {
            connection: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        })
    }
    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
#[async_trait]
impl Storage for LocalStorage {
    async fn get_server_fingerprint(&self, address: &str) -> Result<Option<String>, StorageError> {
        let conn = self.lock();
        let fingerprint = conn
            .query_row(
                "select fingerprint from known_hosts where hostname = ?1",
                [address],
                |row| row.get(0),
            )
            .optional()?;
        Ok(fingerprint)
    }
    async fn store_server_fingerprint(
        &self,
        address: &str,
        fingerprint: &str,
    ) -> Result<(), StorageError> {
        let conn = self.lock();
        tracing::info!("storing fingerprint for {:?}", address);
        conn.execute(
            "insert into known_hosts values (?1, ?2)",
            (address, fingerprint),
        )?;
        Ok(())
    }
    async fn ensure(&self) -> Result<(), StorageError> {
        let conn = self.lock();
        conn.execute(r#"
            create table if not exists known_hosts(hostname varchar(255) primary key, fingerprint varchar(255) not null);
        "#, ())?;
        Ok(())
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(value: rusqlite::Error) -> Self {
        let str_value = value.to_string();
        StorageError::LocalSqlite(value, str_value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stores_and_reads_fingerprints() {
        let storage = LocalStorage::in_memory().unwrap();
        storage.ensure().await.unwrap();
        assert_eq!(storage.get_server_fingerprint("bastion").await.unwrap(), None);

        storage
            .store_server_fingerprint("bastion", "SHA256:abc")
            .await
            .unwrap();
        assert_eq!(
            storage.get_server_fingerprint("bastion").await.unwrap(),
            Some(String::from("SHA256:abc"))
        );
    }

    #[tokio::test]
    async fn duplicate_host_is_rejected() {
        let storage = LocalStorage::in_memory().unwrap();
        storage.ensure().await.unwrap();
        storage
            .store_server_fingerprint("bastion", "SHA256:abc")
            .await
            .unwrap();
        let again = storage.store_server_fingerprint("bastion", "SHA256:def").await;
        assert!(matches!(again, Err(StorageError::LocalSqlite(_, _))));
    }
}
