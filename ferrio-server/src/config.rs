//! Per-role configuration, loaded from YAML with `FERRIO`-prefixed
//! environment overrides.

use ferrio_core::{net, FerrioError, Result, DEFAULT_TOKEN};
use ferrio_meta::CacheConfig;
use serde::Deserialize;
use std::path::PathBuf;

pub const DEFAULT_REGISTRY_PORT: u16 = 5367;
pub const DEFAULT_NAMENODE_PORT: u16 = 5368;
pub const DEFAULT_DATANODE_PORT: u16 = 5369;

fn load<T: serde::de::DeserializeOwned>(path: &str) -> Result<T> {
    let settings = ::config::Config::builder()
        .add_source(::config::File::with_name(path).required(false))
        .add_source(::config::Environment::with_prefix("FERRIO"))
        .build()
        .map_err(|e| FerrioError::Config(e.to_string()))?;

    settings
        .try_deserialize()
        .map_err(|e| FerrioError::Config(e.to_string()))
}

/// `registry.addresses` accepts either a YAML list or one comma-joined
/// string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AddressList {
    List(Vec<String>),
    Joined(String),
}

impl AddressList {
    pub fn resolve(&self) -> Result<Vec<String>> {
        match self {
            AddressList::List(entries) => {
                let mut parsed = Vec::new();
                for entry in entries {
                    parsed.push(net::parse_host_port(entry)?);
                }
                if parsed.is_empty() {
                    return Err(FerrioError::Config(
                        "registry.addresses is empty".to_string(),
                    ));
                }
                Ok(parsed)
            }
            AddressList::Joined(raw) => net::parse_address_list(raw),
        }
    }
}

fn default_registry_addresses() -> AddressList {
    AddressList::Joined(format!("localhost:{}", DEFAULT_REGISTRY_PORT))
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistrySection {
    #[serde(default = "default_registry_addresses")]
    pub addresses: AddressList,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            addresses: default_registry_addresses(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    #[serde(default = "default_token")]
    pub token: String,
}

fn default_token() -> String {
    DEFAULT_TOKEN.to_string()
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            token: default_token(),
        }
    }
}

// --- registry role ---

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub server: RegistryServerSection,
    #[serde(default)]
    pub heartbeat: HeartbeatSection,
    #[serde(default)]
    pub auth: AuthSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryServerSection {
    #[serde(default = "default_registry_port")]
    pub port: u16,
}

fn default_registry_port() -> u16 {
    DEFAULT_REGISTRY_PORT
}

impl Default for RegistryServerSection {
    fn default() -> Self {
        Self {
            port: DEFAULT_REGISTRY_PORT,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatSection {
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_heartbeat_timeout_ms() -> u64 {
    30_000
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            timeout_ms: default_heartbeat_timeout_ms(),
        }
    }
}

impl RegistryConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        load(path)
    }
}

// --- name service role ---

#[derive(Debug, Clone, Deserialize)]
pub struct NamenodeConfig {
    #[serde(default)]
    pub server: NamenodeServerSection,
    #[serde(default)]
    pub registry: RegistrySection,
    #[serde(default)]
    pub metadata: MetadataSection,
    #[serde(default)]
    pub auth: AuthSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamenodeServerSection {
    #[serde(default = "default_namenode_port")]
    pub port: u16,
    #[serde(default)]
    pub advertised_host: Option<String>,
}

fn default_namenode_port() -> u16 {
    DEFAULT_NAMENODE_PORT
}

impl Default for NamenodeServerSection {
    fn default() -> Self {
        Self {
            port: DEFAULT_NAMENODE_PORT,
            advertised_host: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataMode {
    File,
    Sqlite,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetadataSection {
    #[serde(default = "default_metadata_mode")]
    pub mode: MetadataMode,
    #[serde(default)]
    pub file: FileBackendSection,
    #[serde(default)]
    pub sqlite: SqliteBackendSection,
    #[serde(default)]
    pub cache: CacheSection,
}

fn default_metadata_mode() -> MetadataMode {
    MetadataMode::File
}

impl Default for MetadataSection {
    fn default() -> Self {
        Self {
            mode: MetadataMode::File,
            file: FileBackendSection::default(),
            sqlite: SqliteBackendSection::default(),
            cache: CacheSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileBackendSection {
    #[serde(default = "default_file_log_path")]
    pub path: PathBuf,
}

fn default_file_log_path() -> PathBuf {
    PathBuf::from("namenode_meta.log")
}

impl Default for FileBackendSection {
    fn default() -> Self {
        Self {
            path: default_file_log_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SqliteBackendSection {
    #[serde(default = "default_sqlite_path")]
    pub path: PathBuf,
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("namenode_meta.sqlite3")
}

impl Default for SqliteBackendSection {
    fn default() -> Self {
        Self {
            path: default_sqlite_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,
    #[serde(default = "default_cache_max_size")]
    pub max_size: usize,
    #[serde(default = "default_cache_write_policy")]
    pub write_policy: String,
}

fn default_cache_enabled() -> bool {
    true
}

fn default_cache_max_size() -> usize {
    100_000
}

fn default_cache_write_policy() -> String {
    "sync".to_string()
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            max_size: default_cache_max_size(),
            write_policy: default_cache_write_policy(),
        }
    }
}

impl CacheSection {
    pub fn to_cache_config(&self) -> Result<CacheConfig> {
        if self.write_policy != "sync" {
            return Err(FerrioError::Config(format!(
                "metadata.cache.write_policy '{}' is not supported (only 'sync')",
                self.write_policy
            )));
        }
        Ok(CacheConfig {
            enabled: self.enabled,
            max_size: self.max_size,
        })
    }
}

impl NamenodeConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        load(path)
    }

    pub fn advertised_addr(&self) -> String {
        let host = self
            .server
            .advertised_host
            .clone()
            .unwrap_or_else(net::local_ip);
        format!("{}:{}", host, self.server.port)
    }
}

// --- data service role ---

#[derive(Debug, Clone, Deserialize)]
pub struct DatanodeConfig {
    #[serde(default)]
    pub server: DatanodeServerSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub registry: RegistrySection,
    #[serde(default)]
    pub auth: AuthSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatanodeServerSection {
    #[serde(default = "default_datanode_port")]
    pub port: u16,
    #[serde(default)]
    pub advertised_host: Option<String>,
}

fn default_datanode_port() -> u16 {
    DEFAULT_DATANODE_PORT
}

impl Default for DatanodeServerSection {
    fn default() -> Self {
        Self {
            port: DEFAULT_DATANODE_PORT,
            advertised_host: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_storage_paths")]
    pub paths: Vec<PathBuf>,
}

fn default_storage_paths() -> Vec<PathBuf> {
    vec![PathBuf::from("datanode_files")]
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            paths: default_storage_paths(),
        }
    }
}

impl DatanodeConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        load(path)
    }

    pub fn advertised_addr(&self) -> String {
        let host = self
            .server
            .advertised_host
            .clone()
            .unwrap_or_else(net::local_ip);
        format!("{}:{}", host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_list_accepts_both_shapes() {
        let joined = AddressList::Joined("a:1,b:2".to_string());
        assert_eq!(joined.resolve().unwrap(), vec!["a:1", "b:2"]);

        let list = AddressList::List(vec!["c:3".to_string()]);
        assert_eq!(list.resolve().unwrap(), vec!["c:3"]);

        assert!(AddressList::List(Vec::new()).resolve().is_err());
        assert!(AddressList::Joined("nonsense".to_string()).resolve().is_err());
    }

    #[test]
    fn cache_section_rejects_async_policy() {
        let mut section = CacheSection::default();
        assert!(section.to_cache_config().is_ok());

        section.write_policy = "async".to_string();
        assert!(section.to_cache_config().is_err());
    }

    #[test]
    fn defaults_cover_missing_files() {
        let registry = RegistryConfig::from_file("/nonexistent/registry.yaml").unwrap();
        assert_eq!(registry.server.port, DEFAULT_REGISTRY_PORT);
        assert_eq!(registry.heartbeat.timeout_ms, 30_000);

        let namenode = NamenodeConfig::from_file("/nonexistent/namenode.yaml").unwrap();
        assert_eq!(namenode.metadata.mode, MetadataMode::File);
        assert!(namenode.advertised_addr().ends_with(":5368"));

        let datanode = DatanodeConfig::from_file("/nonexistent/datanode.yaml").unwrap();
        assert_eq!(datanode.storage.paths, vec![PathBuf::from("datanode_files")]);
    }
}
