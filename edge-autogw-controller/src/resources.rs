//! Builds the Istio resources that expose a Service on the edge gateway.

use std::collections::BTreeMap;

use edge_autogw_crds::v1alpha3::{
    DestinationRule, DestinationRuleSpec, Gateway, GatewaySpec, VirtualService,
    VirtualServiceSpec,
    destinationrule::{LoadBalancerSettings, SimpleLb, TrafficPolicy},
    gateway::{Port, Server},
    virtualservice::{
        Destination, HttpMatchRequest, HttpRoute, PortSelector, RouteDestination, StringMatch,
        TcpRoute,
    },
};

use crate::{
    client::RoutingResource,
    label::{ExposureSpec, Protocol},
};

const ANY_HOST: &str = "*";
const ROOT_PREFIX: &str = "/";

pub const DEFAULT_GATEWAY_SELECTOR_KEY: &str = "kubeedge";
pub const DEFAULT_GATEWAY_SELECTOR_VALUE: &str = "edgemesh-gateway";

pub fn default_gateway_selector() -> BTreeMap<String, String> {
    BTreeMap::from([(
        DEFAULT_GATEWAY_SELECTOR_KEY.to_string(),
        DEFAULT_GATEWAY_SELECTOR_VALUE.to_string(),
    )])
}

/// The three resources desired for one Service, all named after it.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredResources {
    pub destination_rule: DestinationRule,
    pub virtual_service: VirtualService,
    pub gateway: Gateway,
}

impl DesiredResources {
    /// Resources in write order.
    pub fn into_resources(self) -> [RoutingResource; 3] {
        [
            RoutingResource::DestinationRule(self.destination_rule),
            RoutingResource::VirtualService(self.virtual_service),
            RoutingResource::Gateway(self.gateway),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct ResourceBuilder {
    /// Labels of the gateway proxy pods, the same for every Gateway written.
    gateway_selector: BTreeMap<String, String>,
}

impl Default for ResourceBuilder {
    fn default() -> Self {
        Self::new(default_gateway_selector())
    }
}

impl ResourceBuilder {
    pub fn new(gateway_selector: BTreeMap<String, String>) -> Self {
        Self { gateway_selector }
    }

    pub fn build(&self, name: &str, namespace: &str, spec: &ExposureSpec) -> DesiredResources {
        DesiredResources {
            destination_rule: self.destination_rule(name, namespace),
            virtual_service: self.virtual_service(name, namespace, spec),
            gateway: self.gateway(name, namespace, spec),
        }
    }

    pub fn destination_rule(&self, name: &str, namespace: &str) -> DestinationRule {
        let mut dr = DestinationRule::new(
            name,
            DestinationRuleSpec {
                host: name.to_string(),
                traffic_policy: Some(TrafficPolicy {
                    load_balancer: Some(LoadBalancerSettings {
                        simple: Some(SimpleLb::Random),
                    }),
                }),
            },
        );
        dr.metadata.namespace = Some(namespace.to_string());
        dr
    }

    /// One route per TCP or HTTP rule; rules with other protocols get no route.
    pub fn virtual_service(
        &self,
        name: &str,
        namespace: &str,
        spec: &ExposureSpec,
    ) -> VirtualService {
        let mut http = Vec::new();
        let mut tcp = Vec::new();
        for rule in spec {
            let route = vec![RouteDestination {
                destination: Destination {
                    host: name.to_string(),
                    port: Some(PortSelector {
                        number: rule.service_port.into(),
                    }),
                },
            }];
            match rule.protocol {
                Protocol::Tcp => tcp.push(TcpRoute { route }),
                Protocol::Http => http.push(HttpRoute {
                    matches: vec![HttpMatchRequest {
                        uri: Some(StringMatch::Prefix(ROOT_PREFIX.to_string())),
                    }],
                    route,
                }),
                Protocol::Other(_) => {}
            }
        }

        let mut vs = VirtualService::new(
            name,
            VirtualServiceSpec {
                hosts: vec![ANY_HOST.to_string()],
                gateways: vec![name.to_string()],
                http,
                tcp,
            },
        );
        vs.metadata.namespace = Some(namespace.to_string());
        vs
    }

    /// One server per rule, in rule order. Server names are `<protocol>-0` and are not
    /// made unique when several rules share a protocol.
    pub fn gateway(&self, name: &str, namespace: &str, spec: &ExposureSpec) -> Gateway {
        let servers = spec
            .iter()
            .map(|rule| Server {
                hosts: vec![ANY_HOST.to_string()],
                port: Port {
                    number: rule.gateway_port.into(),
                    protocol: rule.protocol.to_string(),
                    name: format!("{}-0", rule.protocol.as_str().to_ascii_lowercase()),
                },
            })
            .collect();

        let mut gw = Gateway::new(
            name,
            GatewaySpec {
                servers,
                selector: self.gateway_selector.clone(),
            },
        );
        gw.metadata.namespace = Some(namespace.to_string());
        gw
    }
}

#[cfg(test)]
mod tests {
    use kube::ResourceExt;

    use super::*;

    fn spec(value: &str) -> ExposureSpec {
        value.parse().unwrap()
    }

    fn destination(host: &str, port: u32) -> Vec<RouteDestination> {
        vec![RouteDestination {
            destination: Destination {
                host: host.into(),
                port: Some(PortSelector { number: port }),
            },
        }]
    }

    #[test]
    fn test_build_tcp_and_http() {
        let builder = ResourceBuilder::default();
        let desired = builder.build("svcA", "ns1", &spec("TCP-8080-30080.HTTP-9090-30090"));

        let dr = &desired.destination_rule;
        assert_eq!(dr.name_any(), "svcA");
        assert_eq!(dr.namespace().as_deref(), Some("ns1"));
        assert_eq!(dr.spec.host, "svcA");
        assert_eq!(
            dr.spec.traffic_policy,
            Some(TrafficPolicy {
                load_balancer: Some(LoadBalancerSettings {
                    simple: Some(SimpleLb::Random)
                })
            })
        );

        let gw = &desired.gateway;
        assert_eq!(gw.namespace().as_deref(), Some("ns1"));
        assert_eq!(gw.spec.selector, default_gateway_selector());
        assert_eq!(
            gw.spec.servers,
            vec![
                Server {
                    hosts: vec!["*".into()],
                    port: Port {
                        number: 30080,
                        protocol: "TCP".into(),
                        name: "tcp-0".into(),
                    },
                },
                Server {
                    hosts: vec!["*".into()],
                    port: Port {
                        number: 30090,
                        protocol: "HTTP".into(),
                        name: "http-0".into(),
                    },
                },
            ]
        );

        let vs = &desired.virtual_service;
        assert_eq!(vs.spec.hosts, vec!["*".to_string()]);
        assert_eq!(vs.spec.gateways, vec!["svcA".to_string()]);
        assert_eq!(
            vs.spec.tcp,
            vec![TcpRoute {
                route: destination("svcA", 8080)
            }]
        );
        assert_eq!(
            vs.spec.http,
            vec![HttpRoute {
                matches: vec![HttpMatchRequest {
                    uri: Some(StringMatch::Prefix("/".into())),
                }],
                route: destination("svcA", 9090),
            }]
        );
    }

    #[test]
    fn test_destination_rule_independent_of_exposure() {
        let builder = ResourceBuilder::default();
        let a = builder.build("svc", "ns", &spec("TCP-1-30001"));
        let b = builder.build("svc", "ns", &spec("HTTP-2-30002.HTTP-3-30003"));
        assert_eq!(a.destination_rule, b.destination_rule);
    }

    #[test]
    fn test_gateway_servers_follow_rule_order() {
        let exposure = spec("HTTP-80-30100.TCP-22-30022.TCP-5432-30432");
        let gw = ResourceBuilder::default().gateway("db", "ns", &exposure);
        let servers: Vec<(u32, &str)> = gw
            .spec
            .servers
            .iter()
            .map(|s| (s.port.number, s.port.protocol.as_str()))
            .collect();
        let rules: Vec<(u32, &str)> = exposure
            .iter()
            .map(|r| (u32::from(r.gateway_port), r.protocol.as_str()))
            .collect();
        assert_eq!(servers, rules);
    }

    #[test]
    fn test_same_protocol_listeners_share_name() {
        let gw = ResourceBuilder::default().gateway("svc", "ns", &spec("TCP-1-30001.TCP-2-30002"));
        let names: Vec<&str> = gw.spec.servers.iter().map(|s| s.port.name.as_str()).collect();
        assert_eq!(names, vec!["tcp-0", "tcp-0"]);
    }

    #[test]
    fn test_unknown_protocol_gets_listener_without_route() {
        let desired = ResourceBuilder::default().build("dns", "ns", &spec("udp-53-30053"));
        assert_eq!(desired.gateway.spec.servers.len(), 1);
        assert_eq!(desired.gateway.spec.servers[0].port.protocol, "UDP");
        assert_eq!(desired.gateway.spec.servers[0].port.name, "udp-0");
        assert!(desired.virtual_service.spec.tcp.is_empty());
        assert!(desired.virtual_service.spec.http.is_empty());
    }

    #[test]
    fn test_custom_gateway_selector() {
        let selector = BTreeMap::from([("istio".to_string(), "ingressgateway".to_string())]);
        let gw = ResourceBuilder::new(selector.clone()).gateway("svc", "ns", &spec("TCP-1-30001"));
        assert_eq!(gw.spec.selector, selector);
    }

    #[test]
    fn test_resources_in_write_order() {
        let kinds: Vec<String> = ResourceBuilder::default()
            .build("svc", "ns", &spec("TCP-1-30001"))
            .into_resources()
            .iter()
            .map(|r| r.kind().to_string())
            .collect();
        assert_eq!(kinds, vec!["DestinationRule", "VirtualService", "Gateway"]);
    }
}
