//! Pre-flight checks run before any metadata is read or written

use crate::common::{major_minor, Error, RepairOptions, Result};
use crate::metadata::{MetadataStore, ProcessKind, ServerInfo};
use tracing::debug;

/// Guards that must hold before a repair may touch the store.
///
/// Each check fails fast with [`Error::Preflight`].
#[async_trait::async_trait]
pub trait PreconditionCheck: Send + Sync {
    async fn check_store_exists(&self, name: &str) -> Result<()>;

    async fn check_not_routing_layer(&self) -> Result<()>;

    async fn check_replica_set_mode(&self) -> Result<()>;

    async fn check_server_version(&self, supported: &[String]) -> Result<()>;

    /// Run every check in order
    async fn check_all(&self, options: &RepairOptions) -> Result<()> {
        self.check_store_exists(&options.store_name).await?;
        self.check_not_routing_layer().await?;
        self.check_replica_set_mode().await?;
        self.check_server_version(&options.supported_versions).await?;
        Ok(())
    }
}

/// Checks backed by the server facts a [`MetadataStore`] reports
pub struct ServerPreflight<'a, S: MetadataStore> {
    store: &'a S,
}

impl<'a, S: MetadataStore> ServerPreflight<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    async fn info(&self) -> Result<ServerInfo> {
        self.store
            .server_info()
            .await
            .map_err(|e| Error::Preflight(format!("cannot query server: {}", e)))
    }
}

#[async_trait::async_trait]
impl<'a, S: MetadataStore> PreconditionCheck for ServerPreflight<'a, S> {
    async fn check_store_exists(&self, name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(Error::Preflight("store name is empty".into()));
        }
        let info = self.info().await?;
        if !info.databases.iter().any(|db| db == name) {
            return Err(Error::Preflight(format!(
                "database '{}' does not exist on this server",
                name
            )));
        }
        debug!(store = name, "store exists");
        Ok(())
    }

    async fn check_not_routing_layer(&self) -> Result<()> {
        if self.info().await?.process == ProcessKind::Router {
            return Err(Error::Preflight(
                "connected to a query router; connect to a config server replica set member directly"
                    .into(),
            ));
        }
        Ok(())
    }

    async fn check_replica_set_mode(&self) -> Result<()> {
        match self.info().await?.replica_set {
            Some(name) if !name.is_empty() => {
                debug!(replica_set = %name, "replica set mode");
                Ok(())
            }
            _ => Err(Error::Preflight(
                "server is not running as a replica set member".into(),
            )),
        }
    }

    async fn check_server_version(&self, supported: &[String]) -> Result<()> {
        let version = self.info().await?.version;
        let release = major_minor(&version);
        if supported.iter().any(|v| major_minor(v) == release) {
            debug!(%version, "server version supported");
            return Ok(());
        }
        Err(Error::Preflight(format!(
            "server version {} is not supported (supported: {})",
            version,
            supported.join(", ")
        )))
    }
}
