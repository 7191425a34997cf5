use std::{
    collections::BTreeMap,
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use clap::Parser;
use edge_autogw_controller::resources::default_gateway_selector;
use http::Uri;
use kube::config::{KubeConfigOptions, Kubeconfig};
use serde::Deserialize;

use crate::{Error, Result};

pub const DEFAULT_CONFIG_FILE: &str = "/etc/edgeautogw/config/edge-auto-gw.yaml";

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, env = "EDGE_AUTOGW_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    pub config_file: PathBuf,

    /// Metrics and readiness listener
    #[arg(long, default_value = "0.0.0.0:9090")]
    pub metrics_address: SocketAddr,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AutoGwConfig {
    #[serde(rename = "kubeAPIConfig")]
    pub kube_api_config: KubeApiConfig,

    pub modules: Modules,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KubeApiConfig {
    /// API server URL, overrides the one from the kubeconfig or the in-cluster environment.
    pub master: Option<String>,

    /// Path to a kubeconfig file. The config is inferred when unset.
    pub kube_config: Option<PathBuf>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Modules {
    pub edge_auto_gw: EdgeAutoGwModule,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EdgeAutoGwModule {
    pub enable: bool,

    /// Labels of the gateway proxy pods the generated Gateways select.
    pub gateway_selector: BTreeMap<String, String>,
}

impl Default for EdgeAutoGwModule {
    fn default() -> Self {
        Self {
            enable: true,
            gateway_selector: default_gateway_selector(),
        }
    }
}

impl AutoGwConfig {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::ConfigNotFound(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };
        raw.parse()
    }

    pub fn validate(&self) -> Result<()> {
        let module = &self.modules.edge_auto_gw;
        if module.enable && module.gateway_selector.is_empty() {
            return Err(Error::InvalidConfig(
                "modules.edgeAutoGw.gatewaySelector must not be empty".into(),
            ));
        }
        self.kube_api_config.master_uri()?;
        Ok(())
    }
}

impl std::str::FromStr for AutoGwConfig {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        let config = if raw.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str::<Self>(raw)?
        };
        config.validate()?;
        Ok(config)
    }
}

impl KubeApiConfig {
    fn master_uri(&self) -> Result<Option<Uri>> {
        match self.master.as_deref().map(str::trim) {
            Some(master) if !master.is_empty() => Ok(Some(master.parse()?)),
            _ => Ok(None),
        }
    }

    fn kubeconfig_path(&self) -> Option<&Path> {
        self.kube_config
            .as_deref()
            .filter(|path| !path.as_os_str().is_empty())
    }

    pub async fn client(&self) -> Result<kube::Client> {
        let mut config = match self.kubeconfig_path() {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path)?;
                kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await?
            }
            None => kube::Config::infer().await?,
        };
        if let Some(master) = self.master_uri()? {
            config.cluster_url = master;
        }
        Ok(kube::Client::try_from(config)?)
    }
}
