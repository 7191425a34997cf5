use std::{collections::BTreeMap, sync::Arc};

use k8s_openapi::api::core::v1::Service;
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    Result,
    client::KubeRoutingClient,
    dispatcher::Dispatcher,
    manager::{AutoGatewayManager, MANAGER_NAME},
    metrics::ControllerMetrics,
    resources::ResourceBuilder,
};

/// Watches exposed Services cluster-wide and keeps their Istio routing resources in sync
/// until `cancel` fires. `synced` is cancelled once the initial Service list is handled.
pub async fn start_autogw_controller(
    client: Client,
    gateway_selector: BTreeMap<String, String>,
    synced: CancellationToken,
    cancel: CancellationToken,
) -> Result<()> {
    let metrics = ControllerMetrics::new("edge-auto-gateway");
    let manager = Arc::new(AutoGatewayManager::new(
        KubeRoutingClient::new(client.clone()),
        ResourceBuilder::new(gateway_selector),
        metrics,
    ));

    let mut dispatcher = Dispatcher::new();
    manager.register(&mut dispatcher)?;
    info!("starting {MANAGER_NAME}");

    let services: Api<Service> = Api::all(client);
    dispatcher
        .run(
            edge_autogw_k8s_utils::watch_services(services),
            synced,
            cancel,
        )
        .await
}
