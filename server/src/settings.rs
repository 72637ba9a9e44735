use datagrid_cluster::{LocatorConfig, DEFAULT_LOCATOR_PORT};
use datagrid_common::MembershipConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Prefix of environment overrides, e.g. `DATAGRID_MEMBERSHIP__MEMBER_TIMEOUT_MS`
pub const ENV_PREFIX: &str = "DATAGRID";

/// Everything the binary can be configured with
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub membership: MembershipConfig,
    pub locator: LocatorSettings,
    pub http: HttpSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocatorSettings {
    pub port: u16,
    pub state_file: Option<PathBuf>,
    pub host_member: bool,
}

impl Default for LocatorSettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_LOCATOR_PORT,
            state_file: None,
            host_member: true,
        }
    }
}

impl LocatorSettings {
    pub fn to_config(&self) -> LocatorConfig {
        LocatorConfig {
            port: self.port,
            bind_address: None,
            state_file: Some(
                self.state_file
                    .clone()
                    .unwrap_or_else(|| datagrid_cluster::LocatorStateFile::default_name(self.port)),
            ),
            host_member: self.host_member,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub enabled: bool,
    pub bind: SocketAddr,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
        }
    }
}

impl ServerSettings {
    /// Layer defaults, an optional file and `DATAGRID_*` variables
    pub fn load(file: Option<&Path>) -> anyhow::Result<Self> {
        let defaults = config::Config::try_from(&ServerSettings::default())?;
        let mut builder = config::Config::builder().add_source(defaults);

        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        Ok(settings)
    }
}
