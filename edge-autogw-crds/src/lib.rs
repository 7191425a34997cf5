pub mod v1alpha3;

/// Service label carrying the exposure rules, e.g. `TCP-8080-30080.HTTP-9090-30090`.
pub const EXPOSURE_LABEL: &str = "kubeedge.io/edgemesh-gateway";

/// Services carrying this label opted out of proxying entirely.
pub const NO_PROXY_LABEL: &str = "noproxy";

/// Services claimed by an alternative service proxy.
pub const SERVICE_PROXY_NAME_LABEL: &str = "service.edgemesh.kubeedge.io/service-proxy-name";
