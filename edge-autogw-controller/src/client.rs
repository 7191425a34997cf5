use std::fmt;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    Api, Client, Resource, ResourceExt,
    api::{DeleteParams, PostParams},
};
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

use edge_autogw_crds::v1alpha3::{DestinationRule, Gateway, VirtualService};

pub const FIELD_MANAGER: &str = "edge-auto-gateway-manager";

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("{kind} {name} has no namespace")]
    MissingNamespace { kind: ResourceKind, name: String },

    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: ResourceKind,
        namespace: String,
        name: String,
    },

    #[error("{0}")]
    Other(String),
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    DestinationRule,
    VirtualService,
    Gateway,
}

impl ResourceKind {
    /// Order in which resources are written.
    pub const ALL: [ResourceKind; 3] = [
        ResourceKind::DestinationRule,
        ResourceKind::VirtualService,
        ResourceKind::Gateway,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::DestinationRule => "DestinationRule",
            ResourceKind::VirtualService => "VirtualService",
            ResourceKind::Gateway => "Gateway",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RoutingResource {
    DestinationRule(DestinationRule),
    VirtualService(VirtualService),
    Gateway(Gateway),
}

impl RoutingResource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            RoutingResource::DestinationRule(_) => ResourceKind::DestinationRule,
            RoutingResource::VirtualService(_) => ResourceKind::VirtualService,
            RoutingResource::Gateway(_) => ResourceKind::Gateway,
        }
    }

    pub fn name(&self) -> String {
        match self {
            RoutingResource::DestinationRule(r) => r.name_any(),
            RoutingResource::VirtualService(r) => r.name_any(),
            RoutingResource::Gateway(r) => r.name_any(),
        }
    }

    pub fn namespace(&self) -> Option<String> {
        match self {
            RoutingResource::DestinationRule(r) => r.namespace(),
            RoutingResource::VirtualService(r) => r.namespace(),
            RoutingResource::Gateway(r) => r.namespace(),
        }
    }

    fn require_namespace(&self) -> ClientResult<String> {
        self.namespace().ok_or_else(|| ClientError::MissingNamespace {
            kind: self.kind(),
            name: self.name(),
        })
    }
}

/// Remote operations on the routing resources, keyed by namespace and name.
#[async_trait]
pub trait RoutingClient: Send + Sync {
    async fn create(&self, resource: &RoutingResource) -> ClientResult<()>;

    /// Replaces the whole resource. Fails with [`ClientError::NotFound`] when it does not exist.
    async fn update(&self, resource: &RoutingResource) -> ClientResult<()>;

    /// Returns `None` when the resource does not exist.
    async fn get(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> ClientResult<Option<RoutingResource>>;

    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> ClientResult<()>;
}

#[derive(Clone)]
pub struct KubeRoutingClient {
    client: Client,
}

impl KubeRoutingClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// PUT of the desired object over the current one, under the current resourceVersion.
    async fn replace<K>(
        &self,
        kind: ResourceKind,
        namespace: &str,
        desired: &K,
    ) -> ClientResult<()>
    where
        K: Resource<Scope = NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Serialize
            + fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api = self.api::<K>(namespace);
        let name = desired.name_any();
        let current = api
            .get_opt(&name)
            .await?
            .ok_or_else(|| ClientError::NotFound {
                kind,
                namespace: namespace.to_string(),
                name: name.clone(),
            })?;
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.into()),
            ..Default::default()
        };
        api.replace(&name, &params, &replacement_for(desired, &current)).await?;
        Ok(())
    }
}

fn replacement_for<K: Resource + Clone>(desired: &K, current: &K) -> K {
    let mut replacement = desired.clone();
    replacement.meta_mut().resource_version = current.meta().resource_version.clone();
    replacement
}

#[async_trait]
impl RoutingClient for KubeRoutingClient {
    async fn create(&self, resource: &RoutingResource) -> ClientResult<()> {
        let ns = resource.require_namespace()?;
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.into()),
            ..Default::default()
        };
        match resource {
            RoutingResource::DestinationRule(dr) => {
                self.api::<DestinationRule>(&ns).create(&params, dr).await?;
            }
            RoutingResource::VirtualService(vs) => {
                self.api::<VirtualService>(&ns).create(&params, vs).await?;
            }
            RoutingResource::Gateway(gw) => {
                self.api::<Gateway>(&ns).create(&params, gw).await?;
            }
        }
        Ok(())
    }

    async fn update(&self, resource: &RoutingResource) -> ClientResult<()> {
        let ns = resource.require_namespace()?;
        match resource {
            RoutingResource::DestinationRule(dr) => {
                self.replace(ResourceKind::DestinationRule, &ns, dr).await
            }
            RoutingResource::VirtualService(vs) => {
                self.replace(ResourceKind::VirtualService, &ns, vs).await
            }
            RoutingResource::Gateway(gw) => self.replace(ResourceKind::Gateway, &ns, gw).await,
        }
    }

    async fn get(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> ClientResult<Option<RoutingResource>> {
        let resource = match kind {
            ResourceKind::DestinationRule => self
                .api::<DestinationRule>(namespace)
                .get_opt(name)
                .await?
                .map(RoutingResource::DestinationRule),
            ResourceKind::VirtualService => self
                .api::<VirtualService>(namespace)
                .get_opt(name)
                .await?
                .map(RoutingResource::VirtualService),
            ResourceKind::Gateway => self
                .api::<Gateway>(namespace)
                .get_opt(name)
                .await?
                .map(RoutingResource::Gateway),
        };
        Ok(resource)
    }

    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> ClientResult<()> {
        let params = DeleteParams::default();
        match kind {
            ResourceKind::DestinationRule => {
                self.api::<DestinationRule>(namespace)
                    .delete(name, &params)
                    .await?;
            }
            ResourceKind::VirtualService => {
                self.api::<VirtualService>(namespace)
                    .delete(name, &params)
                    .await?;
            }
            ResourceKind::Gateway => {
                self.api::<Gateway>(namespace).delete(name, &params).await?;
            }
        }
        Ok(())
    }
}
