//! Reconciles the routing resources of a Service against its exposure label.
//!
//! Every Add, Update and Delete runs under one manager-wide lock, so at most one
//! reconciliation touches the remote API at any time, whatever the Service.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    Error, Result,
    client::{ResourceKind, RoutingClient},
    dispatcher::{Dispatcher, EventKind, ServiceEventHandler},
    label::{DecodeError, ExposureSpec, Protocol},
    metrics::ControllerMetrics,
    resources::{DesiredResources, ResourceBuilder},
};

pub const MANAGER_NAME: &str = "edge-auto-gateway-manager";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// All three resources were written.
    Applied,
    /// The Service does not carry the exposure label.
    Skipped,
}

#[derive(Debug, Clone, Copy)]
enum WriteMode {
    Create,
    Update,
}

pub struct AutoGatewayManager<C> {
    lock: Mutex<()>,
    client: C,
    builder: ResourceBuilder,
    metrics: ControllerMetrics,
}

impl<C: RoutingClient + 'static> AutoGatewayManager<C> {
    pub fn new(client: C, builder: ResourceBuilder, metrics: ControllerMetrics) -> Self {
        Self {
            lock: Mutex::new(()),
            client,
            builder,
            metrics,
        }
    }

    /// Registers the manager's event handlers under [`MANAGER_NAME`].
    pub fn register(self: Arc<Self>, dispatcher: &mut Dispatcher) -> Result<()> {
        dispatcher.register(MANAGER_NAME, self)
    }

    /// Creates the routing resources of a newly observed Service.
    ///
    /// Stops at the first failed create; resources created before it are kept.
    #[instrument(skip_all, fields(service = %service_ref(service)))]
    pub async fn add(&self, service: &Service) -> Result<Outcome> {
        let _guard = self.lock.lock().await;
        let _timer = self.metrics.count_and_measure(EventKind::Add);
        self.write(service, WriteMode::Create).await
    }

    /// Replaces the routing resources of a changed Service.
    ///
    /// A Service whose label no longer decodes is only logged; its resources are kept.
    #[instrument(skip_all, fields(service = %service_ref(service)))]
    pub async fn update(&self, service: &Service) -> Result<Outcome> {
        let _guard = self.lock.lock().await;
        let _timer = self.metrics.count_and_measure(EventKind::Update);
        self.write(service, WriteMode::Update).await
    }

    /// Removes whichever routing resources of the Service still exist.
    ///
    /// Each kind is handled independently: a failure is recorded and the next kind is
    /// still attempted. Resources that are already gone are not an error.
    #[instrument(skip_all, fields(service = %service_ref(service)))]
    pub async fn delete(&self, service: &Service) -> Result<()> {
        let _guard = self.lock.lock().await;
        let _timer = self.metrics.count_and_measure(EventKind::Delete);
        let (namespace, name) = identity(service)?;

        let mut failures = Vec::new();
        for kind in ResourceKind::ALL {
            if let Err(error) = self.delete_resource(kind, &namespace, &name).await {
                warn!(%error, "failed to clean up {kind} {namespace}/{name}");
                failures.push(error);
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::CleanupFailed {
                namespace,
                name,
                failures,
            })
        }
    }

    async fn write(&self, service: &Service, mode: WriteMode) -> Result<Outcome> {
        let (namespace, name) = identity(service)?;
        let Some(desired) = self.desired(service, &namespace, &name)? else {
            return Ok(Outcome::Skipped);
        };

        for resource in desired.into_resources() {
            let kind = resource.kind();
            match mode {
                WriteMode::Create => {
                    self.client.create(&resource).await.map_err(|source| {
                        Error::RemoteCreateFailed {
                            kind,
                            namespace: namespace.clone(),
                            name: name.clone(),
                            source,
                        }
                    })?;
                    info!("created {kind} {namespace}/{name}");
                }
                WriteMode::Update => {
                    self.client.update(&resource).await.map_err(|source| {
                        Error::RemoteUpdateFailed {
                            kind,
                            namespace: namespace.clone(),
                            name: name.clone(),
                            source,
                        }
                    })?;
                    info!("updated {kind} {namespace}/{name}");
                }
            }
        }
        Ok(Outcome::Applied)
    }

    fn desired(
        &self,
        service: &Service,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DesiredResources>> {
        let spec = match ExposureSpec::from_labels(service.labels()) {
            Ok(spec) => spec,
            Err(DecodeError::NotConfigured) => {
                debug!("Service {namespace}/{name} does not request gateway exposure");
                return Ok(None);
            }
            Err(source) => {
                return Err(Error::MalformedExposure {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                    source,
                });
            }
        };

        for rule in spec.iter() {
            if let Protocol::Other(protocol) = &rule.protocol {
                warn!(
                    "Service {namespace}/{name} exposes unsupported protocol {protocol} on gateway port {}, listener will have no route",
                    rule.gateway_port
                );
            }
        }
        debug!(exposure = %spec, "building routing resources for {namespace}/{name}");
        Ok(Some(self.builder.build(name, namespace, &spec)))
    }

    async fn delete_resource(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<()> {
        let existing = self
            .client
            .get(kind, namespace, name)
            .await
            .map_err(|source| Error::RemoteGetFailed {
                kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
                source,
            })?;
        if existing.is_none() {
            debug!("{kind} {namespace}/{name} already absent");
            return Ok(());
        }

        self.client
            .delete(kind, namespace, name)
            .await
            .map_err(|source| Error::RemoteDeleteFailed {
                kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
                source,
            })?;
        info!("deleted {kind} {namespace}/{name}");
        Ok(())
    }

    fn report(&self, event: EventKind, error: &Error) {
        self.metrics.count_failure(event, error);
        error!(%error, "{} reconciliation failed", event.as_str());
    }
}

#[async_trait]
impl<C: RoutingClient + 'static> ServiceEventHandler for AutoGatewayManager<C> {
    async fn on_add(&self, service: Arc<Service>) {
        if let Err(error) = self.add(&service).await {
            self.report(EventKind::Add, &error);
        }
    }

    async fn on_update(&self, _old: Arc<Service>, new: Arc<Service>) {
        if let Err(error) = self.update(&new).await {
            self.report(EventKind::Update, &error);
        }
    }

    async fn on_delete(&self, service: Arc<Service>) {
        if let Err(error) = self.delete(&service).await {
            self.report(EventKind::Delete, &error);
        }
    }
}

fn identity(service: &Service) -> Result<(String, String)> {
    let name = service.name_any();
    let namespace = service
        .namespace()
        .ok_or_else(|| Error::MissingNamespace(name.clone()))?;
    Ok((namespace, name))
}

fn service_ref(service: &Service) -> String {
    format!(
        "{}/{}",
        service.namespace().unwrap_or_default(),
        service.name_any()
    )
}
