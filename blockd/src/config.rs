//! Configuration for blockd.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backend::{Backend, FileBackend, MemoryBackend};
use crate::error::ConfigError;
use crate::server::{Export, ServerOptions};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub server: ServerOptions,
    #[serde(default)]
    pub exports: Vec<ExportConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    /// Listen transport.
    pub network: Network,
    /// `host:port` for tcp, a filesystem path for unix.
    pub address: String,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            network: Network::Tcp,
            address: format!("127.0.0.1:{}", nbd::NBD_DEFAULT_PORT),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Tcp,
    Unix,
}

impl std::str::FromStr for Network {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "unix" => Ok(Self::Unix),
            _ => Err(ConfigError::InvalidValue {
                field: "listen.network",
                reason: "must be `tcp` or `unix`",
            }),
        }
    }
}

/// One export entry: a name plus its storage.
///
/// Exactly one of `file` and `size_bytes` must be set. A `file` export
/// serves the file at that path; a `size_bytes` export serves zeroed memory,
/// which is handy for scratch devices and tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub size_bytes: Option<u64>,
}

impl ExportConfig {
    /// Open the storage and build the export.
    pub fn build(&self, read_only: bool) -> Result<Export, ConfigError> {
        let backend: Arc<dyn Backend> = match (&self.file, self.size_bytes) {
            (Some(path), None) => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(!read_only)
                    .open(path)
                    .map_err(|source| ConfigError::OpenExport {
                        path: path.display().to_string(),
                        source,
                    })?;
                Arc::new(FileBackend::new(file))
            }
            (None, Some(size)) => Arc::new(MemoryBackend::zeroed(size as usize)),
            _ => {
                return Err(ConfigError::InvalidValue {
                    field: "exports",
                    reason: "exactly one of `file` and `size_bytes` must be set",
                });
            }
        };

        Ok(Export {
            name: self.name.clone(),
            description: self.description.clone(),
            backend,
        })
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;

        if self.exports.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "exports",
                reason: "at least one export is required",
            });
        }
        for (i, export) in self.exports.iter().enumerate() {
            if export.name.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "exports.name",
                    reason: "must not be empty",
                });
            }
            if self.exports[..i].iter().any(|e| e.name == export.name) {
                return Err(ConfigError::DuplicateExport {
                    name: export.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Build every configured export.
    pub fn build_exports(&self) -> Result<Vec<Export>, ConfigError> {
        self.exports
            .iter()
            .map(|e| e.build(self.server.read_only))
            .collect()
    }
}
