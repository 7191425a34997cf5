use std::collections::BTreeMap;

use kube::CustomResource;
use kube::KubeSchema;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(
    CustomResource, KubeSchema, Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug,
)]
#[kube(
    group = "networking.istio.io",
    version = "v1alpha3",
    kind = "Gateway",
    derive = "Default",
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySpec {
    /// Listeners exposed by the gateway proxy
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<Server>,
    /// Labels selecting the gateway proxy pods that serve these listeners
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub selector: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug, JsonSchema)]
pub struct Server {
    pub port: Port,
    pub hosts: Vec<String>,
}

#[derive(Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug, JsonSchema)]
pub struct Port {
    pub number: u32,
    pub protocol: String,
    pub name: String,
}
