use futures::Stream;
use k8s_openapi::api::core::v1::Service;
use kube::Api;
use kube::core::{Expression, Selector};
use kube::runtime::{WatchStreamExt, watcher};

use edge_autogw_crds::{EXPOSURE_LABEL, NO_PROXY_LABEL, SERVICE_PROXY_NAME_LABEL};

/// Selects Services that request gateway exposure and are not owned by another proxy.
pub fn exposure_selector() -> Selector {
    [
        Expression::DoesNotExist(NO_PROXY_LABEL.into()),
        Expression::DoesNotExist(SERVICE_PROXY_NAME_LABEL.into()),
        Expression::Exists(EXPOSURE_LABEL.into()),
    ]
    .into_iter()
    .collect()
}

pub fn service_watch_config() -> watcher::Config {
    watcher::Config::default().labels_from(&exposure_selector())
}

/// Watch stream for exposed Services. The stream restarts itself with backoff on errors,
/// so consumers only see errors for logging.
pub fn watch_services(
    api: Api<Service>,
) -> impl Stream<Item = Result<watcher::Event<Service>, watcher::Error>> + Send {
    watcher(api, service_watch_config()).default_backoff()
}
