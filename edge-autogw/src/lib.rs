pub mod config;
pub mod controller;
pub mod http;

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("failed to create config from kubeconfig: {0}")]
    KubeConfig(#[from] kube::config::KubeconfigError),

    #[error("failed to infer kube config: {0}")]
    InferConfig(#[from] kube::config::InferConfigError),

    #[error("invalid API server address: {0}")]
    InvalidUri(#[from] ::http::uri::InvalidUri),

    #[error("failed to parse config file: {0}")]
    YamlConversion(#[from] serde_yaml::Error),

    #[error("config file {} not found", .0.display())]
    ConfigNotFound(PathBuf),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("controller error: {0}")]
    Controller(#[from] edge_autogw_controller::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
