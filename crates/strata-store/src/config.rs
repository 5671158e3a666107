use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strata_backend::{
    BackendDriver, BucketMap, Credentials, FilesystemBackend, FilesystemConfig,
    HttpObjectStorage, HttpStorageConfig, RemoteBackend, RemoteConfig,
};
use strata_mapping::{JournalConfig, MappingTable, SyncMode};
use url::Url;

use crate::error::{StoreError, StoreResult};

/// Element store configuration, usually read from a TOML file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub mapping: MappingConfig,
    pub backend: BackendConfig,
}

/// Where mapping rows live.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingConfig {
    /// Journal file; the table is in-memory when absent.
    pub journal: Option<PathBuf>,
    pub sync: SyncMode,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    Filesystem {
        root: PathBuf,
        #[serde(default)]
        hard_links: bool,
    },
    Remote(RemoteSettings),
}

/// Settings of the remote object-storage backend.
#[derive(Clone, Serialize, Deserialize)]
pub struct RemoteSettings {
    pub endpoint: Url,
    #[serde(default = "default_region")]
    pub region: String,
    /// Bucket for organizations without their own entry in `buckets`.
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub buckets: BTreeMap<String, String>,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    #[serde(default)]
    pub session_token: Option<String>,
    #[serde(default = "default_true")]
    pub path_style: bool,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_restore_days")]
    pub restore_days: u32,
    #[serde(default = "default_true")]
    pub versioning: bool,
}

fn default_region() -> String {
    "us-east-1".into()
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_restore_days() -> u32 {
    2
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            mapping: MappingConfig::default(),
            backend: BackendConfig::Filesystem {
                root: PathBuf::from("objects"),
                hard_links: false,
            },
        }
    }
}

impl StoreConfig {
    pub fn from_toml_str(s: &str) -> StoreResult<Self> {
        toml::from_str(s).map_err(|e| StoreError::Config(e.to_string()))
    }

    pub fn from_file(path: &Path) -> StoreResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Days a restored copy stays readable when none is given explicitly.
    pub fn restore_days(&self) -> u32 {
        match &self.backend {
            BackendConfig::Remote(remote) => remote.restore_days,
            BackendConfig::Filesystem { .. } => default_restore_days(),
        }
    }

    pub fn open_mapping(&self) -> StoreResult<MappingTable> {
        match &self.mapping.journal {
            Some(path) => Ok(MappingTable::open(
                path,
                JournalConfig {
                    sync_mode: self.mapping.sync,
                },
            )?),
            None => Ok(MappingTable::in_memory()),
        }
    }

    pub fn open_backend(&self) -> StoreResult<Arc<dyn BackendDriver>> {
        match &self.backend {
            BackendConfig::Filesystem { root, hard_links } => {
                let config = FilesystemConfig::new(root).with_hard_links(*hard_links);
                Ok(Arc::new(FilesystemBackend::new(config)?))
            }
            BackendConfig::Remote(remote) => {
                let buckets = remote.bucket_map()?;
                let client = HttpObjectStorage::new(HttpStorageConfig {
                    endpoint: remote.endpoint.clone(),
                    region: remote.region.clone(),
                    credentials: remote.credentials()?,
                    path_style: remote.path_style,
                    connect_timeout: Duration::from_millis(remote.connect_timeout_ms),
                    max_retries: remote.max_retries,
                })?;
                let config = RemoteConfig {
                    buckets,
                    restore_days: remote.restore_days,
                    versioning: remote.versioning,
                };
                Ok(Arc::new(RemoteBackend::new(Arc::new(client), config)?))
            }
        }
    }
}

impl RemoteSettings {
    pub fn bucket_map(&self) -> StoreResult<BucketMap> {
        let mut map = match &self.bucket {
            Some(bucket) => BucketMap::single(bucket.clone()),
            None => BucketMap::default(),
        };
        for (organization, bucket) in &self.buckets {
            map = map.with(organization.clone(), bucket.clone());
        }
        if map.is_empty() {
            return Err(StoreError::Config(
                "remote backend needs `bucket` or `buckets`".into(),
            ));
        }
        Ok(map)
    }

    /// Configured credentials, else the `AWS_*` environment variables.
    pub fn credentials(&self) -> StoreResult<Credentials> {
        match (&self.access_key_id, &self.secret_access_key) {
            (Some(id), Some(secret)) => Ok(Credentials {
                access_key_id: id.clone(),
                secret_access_key: secret.clone(),
                session_token: self.session_token.clone(),
            }),
            (None, None) => Credentials::from_env().ok_or_else(|| {
                StoreError::Config(
                    "no credentials configured and AWS_ACCESS_KEY_ID/AWS_SECRET_ACCESS_KEY unset"
                        .into(),
                )
            }),
            _ => Err(StoreError::Config(
                "access_key_id and secret_access_key must be set together".into(),
            )),
        }
    }
}

impl std::fmt::Debug for RemoteSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSettings")
            .field("endpoint", &self.endpoint.as_str())
            .field("region", &self.region)
            .field("bucket", &self.bucket)
            .field("buckets", &self.buckets)
            .field("access_key_id", &self.access_key_id)
            .field("path_style", &self.path_style)
            .field("versioning", &self.versioning)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let c = StoreConfig::default();
        assert!(c.mapping.journal.is_none());
        assert_eq!(c.mapping.sync, SyncMode::OsDefault);
        assert!(matches!(c.backend, BackendConfig::Filesystem { hard_links: false, .. }));
        assert_eq!(c.restore_days(), 2);
    }

    #[test]
    fn filesystem_config() {
        let c = StoreConfig::from_toml_str(
            r#"
            [mapping]
            journal = "/var/lib/strata/mappings.journal"
            sync = "every-write"

            [backend]
            kind = "filesystem"
            root = "/var/lib/strata/objects"
            hard_links = true
            "#,
        )
        .unwrap();
        assert_eq!(
            c.mapping.journal.as_deref(),
            Some(Path::new("/var/lib/strata/mappings.journal"))
        );
        assert_eq!(c.mapping.sync, SyncMode::EveryWrite);
        match c.backend {
            BackendConfig::Filesystem { root, hard_links } => {
                assert_eq!(root, PathBuf::from("/var/lib/strata/objects"));
                assert!(hard_links);
            }
            other => panic!("unexpected backend {other:?}"),
        }
    }

    #[test]
    fn remote_config_defaults() {
        let c = StoreConfig::from_toml_str(
            r#"
            [backend]
            kind = "remote"
            endpoint = "https://s3.eu-west-1.amazonaws.com"
            region = "eu-west-1"
            bucket = "archive"
            buckets = { org2 = "org2-archive" }
            access_key_id = "AKIDEXAMPLE"
            secret_access_key = "secret"
            "#,
        )
        .unwrap();
        let BackendConfig::Remote(remote) = &c.backend else {
            panic!("expected remote backend");
        };
        assert!(remote.path_style);
        assert!(remote.versioning);
        assert_eq!(remote.connect_timeout_ms, 10_000);
        assert_eq!(remote.max_retries, 3);
        assert_eq!(c.restore_days(), 2);

        let buckets = remote.bucket_map().unwrap();
        assert_eq!(buckets.resolve("org1").unwrap(), "archive");
        assert_eq!(buckets.resolve("org2").unwrap(), "org2-archive");
        assert_eq!(remote.credentials().unwrap().access_key_id, "AKIDEXAMPLE");
        assert!(!format!("{remote:?}").contains("secret"));
    }

    #[test]
    fn remote_without_buckets_is_rejected() {
        let c = StoreConfig::from_toml_str(
            r#"
            [backend]
            kind = "remote"
            endpoint = "http://localhost:9000"
            access_key_id = "a"
            secret_access_key = "b"
            "#,
        )
        .unwrap();
        assert!(matches!(c.open_backend(), Err(StoreError::Config(_))));
    }

    #[test]
    fn half_configured_credentials_are_rejected() {
        let c = StoreConfig::from_toml_str(
            r#"
            [backend]
            kind = "remote"
            endpoint = "http://localhost:9000"
            bucket = "archive"
            access_key_id = "a"
            "#,
        )
        .unwrap();
        let BackendConfig::Remote(remote) = &c.backend else {
            panic!("expected remote backend");
        };
        assert!(matches!(remote.credentials(), Err(StoreError::Config(_))));
    }

    #[test]
    fn unknown_backend_kind() {
        let err = StoreConfig::from_toml_str("[backend]\nkind = \"tape\"\n").unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
        assert!(StoreConfig::from_toml_str("[backend]\nkind = \"filesystem\"\n").is_err());
    }

    #[test]
    fn opens_filesystem_store_parts() {
        let dir = tempfile::tempdir().unwrap();
        let c = StoreConfig {
            mapping: MappingConfig {
                journal: Some(dir.path().join("mappings.journal")),
                sync: SyncMode::EveryWrite,
            },
            backend: BackendConfig::Filesystem {
                root: dir.path().join("objects"),
                hard_links: true,
            },
        };
        assert!(c.open_mapping().unwrap().is_durable());
        assert_eq!(c.open_backend().unwrap().name(), "filesystem");
    }
}
