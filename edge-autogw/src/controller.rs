use edge_autogw_controller::start_autogw_controller;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{Result, config::AutoGwConfig};

pub async fn start(
    config: AutoGwConfig,
    ready: CancellationToken,
    cancel: CancellationToken,
) -> Result<()> {
    let module = config.modules.edge_auto_gw;
    if !module.enable {
        info!("edgeAutoGw module is disabled");
        ready.cancel();
        cancel.cancelled().await;
        return Ok(());
    }

    let client = config.kube_api_config.client().await?;
    start_autogw_controller(client, module.gateway_selector, ready, cancel).await?;
    Ok(())
}
