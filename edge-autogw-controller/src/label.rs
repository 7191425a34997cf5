//! Codec for the exposure label.
//!
//! The label value is a `.` separated list of groups, each group being
//! `PROTOCOL-SVCPORT-GWPORT`, e.g. `TCP-8080-30080.HTTP-9090-30090`.

use std::{collections::BTreeMap, fmt, str::FromStr};

use thiserror::Error;

use edge_autogw_crds::EXPOSURE_LABEL;

const GROUP_SEPARATOR: char = '.';
const FIELD_SEPARATOR: char = '-';

pub const MIN_SERVICE_PORT: u32 = 1;
pub const MAX_SERVICE_PORT: u32 = 65535;
pub const MIN_GATEWAY_PORT: u32 = 30000;
pub const MAX_GATEWAY_PORT: u32 = 65535;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("exposure label not present")]
    NotConfigured,

    #[error("exposure label has no groups")]
    NoGroupsConfigured,

    #[error("group {group:?} must have 3 fields PROTOCOL-SVCPORT-GWPORT, found {fields}")]
    MalformedGroup { group: String, fields: usize },

    #[error("{port} {value:?} must be a number in [{min}, {max}]")]
    PortOutOfRange {
        port: PortRole,
        value: String,
        min: u32,
        max: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortRole {
    Service,
    Gateway,
}

impl fmt::Display for PortRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortRole::Service => f.write_str("service port"),
            PortRole::Gateway => f.write_str("gateway port"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Http,
    /// Unrecognized token, kept uppercased. It produces a gateway listener but no route.
    Other(String),
}

impl Protocol {
    /// Uppercase protocol name as used on the gateway side.
    pub fn as_str(&self) -> &str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Http => "HTTP",
            Protocol::Other(p) => p,
        }
    }
}

impl From<&str> for Protocol {
    fn from(token: &str) -> Self {
        let upper = token.to_ascii_uppercase();
        match upper.as_str() {
            "TCP" => Protocol::Tcp,
            "HTTP" => Protocol::Http,
            _ => Protocol::Other(upper),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExposureRule {
    pub protocol: Protocol,
    pub service_port: u16,
    pub gateway_port: u16,
}

impl FromStr for ExposureRule {
    type Err = DecodeError;

    fn from_str(group: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = group.split(FIELD_SEPARATOR).collect();
        let [protocol, service_port, gateway_port] = fields[..] else {
            return Err(DecodeError::MalformedGroup {
                group: group.to_string(),
                fields: fields.len(),
            });
        };

        Ok(Self {
            protocol: protocol.into(),
            service_port: parse_port(
                service_port,
                PortRole::Service,
                MIN_SERVICE_PORT,
                MAX_SERVICE_PORT,
            )?,
            gateway_port: parse_port(
                gateway_port,
                PortRole::Gateway,
                MIN_GATEWAY_PORT,
                MAX_GATEWAY_PORT,
            )?,
        })
    }
}

impl fmt::Display for ExposureRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{FIELD_SEPARATOR}{}{FIELD_SEPARATOR}{}",
            self.protocol, self.service_port, self.gateway_port
        )
    }
}

/// Ordered, non-empty list of exposure rules decoded from one label value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExposureSpec {
    rules: Vec<ExposureRule>,
}

impl ExposureSpec {
    pub fn from_labels(labels: &BTreeMap<String, String>) -> Result<Self, DecodeError> {
        labels
            .get(EXPOSURE_LABEL)
            .ok_or(DecodeError::NotConfigured)?
            .parse()
    }

    pub fn rules(&self) -> &[ExposureRule] {
        &self.rules
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ExposureRule> {
        self.rules.iter()
    }
}

impl FromStr for ExposureSpec {
    type Err = DecodeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.is_empty() {
            return Err(DecodeError::NoGroupsConfigured);
        }
        let rules = value
            .split(GROUP_SEPARATOR)
            .map(str::parse)
            .collect::<Result<Vec<ExposureRule>, _>>()?;
        Ok(Self { rules })
    }
}

impl fmt::Display for ExposureSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, rule) in self.rules.iter().enumerate() {
            if i > 0 {
                write!(f, "{GROUP_SEPARATOR}")?;
            }
            write!(f, "{rule}")?;
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a ExposureSpec {
    type Item = &'a ExposureRule;
    type IntoIter = std::slice::Iter<'a, ExposureRule>;

    fn into_iter(self) -> Self::IntoIter {
        self.rules.iter()
    }
}

fn parse_port(value: &str, port: PortRole, min: u32, max: u32) -> Result<u16, DecodeError> {
    let out_of_range = || DecodeError::PortOutOfRange {
        port,
        value: value.to_string(),
        min,
        max,
    };
    // u32::from_str would accept a leading '+'
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(out_of_range());
    }
    let number: u32 = value.parse().map_err(|_| out_of_range())?;
    if !(min..=max).contains(&number) {
        return Err(out_of_range());
    }
    u16::try_from(number).map_err(|_| out_of_range())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(value: &str) -> Result<ExposureSpec, DecodeError> {
        value.parse()
    }

    #[test]
    fn test_single_tcp_group() {
        let spec = decode("TCP-8080-30080").unwrap();
        assert_eq!(
            spec.rules(),
            &[ExposureRule {
                protocol: Protocol::Tcp,
                service_port: 8080,
                gateway_port: 30080,
            }]
        );
    }

    #[test]
    fn test_multiple_groups_keep_order() {
        let spec = decode("HTTP-9090-30090.tcp-8080-30080.http-80-31000").unwrap();
        let ports: Vec<(Protocol, u16, u16)> = spec
            .iter()
            .map(|r| (r.protocol.clone(), r.service_port, r.gateway_port))
            .collect();
        assert_eq!(
            ports,
            vec![
                (Protocol::Http, 9090, 30090),
                (Protocol::Tcp, 8080, 30080),
                (Protocol::Http, 80, 31000),
            ]
        );
    }

    #[test]
    fn test_protocol_is_case_insensitive_and_keeps_unknown_tokens() {
        let spec = decode("Tcp-1-30000.udp-53-30053").unwrap();
        assert_eq!(spec.rules()[0].protocol, Protocol::Tcp);
        assert_eq!(spec.rules()[1].protocol, Protocol::Other("UDP".into()));
        assert_eq!(spec.to_string(), "TCP-1-30000.UDP-53-30053");
    }

    #[test]
    fn test_missing_label_is_not_configured() {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "demo".to_string());
        assert_eq!(
            ExposureSpec::from_labels(&labels),
            Err(DecodeError::NotConfigured)
        );

        labels.insert(EXPOSURE_LABEL.to_string(), "HTTP-80-30080".to_string());
        assert!(ExposureSpec::from_labels(&labels).is_ok());
    }

    #[test]
    fn test_empty_value_has_no_groups() {
        assert_eq!(decode(""), Err(DecodeError::NoGroupsConfigured));
    }

    #[test]
    fn test_wrong_field_count_is_malformed() {
        assert_eq!(
            decode("TCP-8080"),
            Err(DecodeError::MalformedGroup {
                group: "TCP-8080".into(),
                fields: 2
            })
        );
        assert_eq!(
            decode("TCP-8080-30080-1"),
            Err(DecodeError::MalformedGroup {
                group: "TCP-8080-30080-1".into(),
                fields: 4
            })
        );
        assert!(matches!(
            decode("TCP-8080-30080."),
            Err(DecodeError::MalformedGroup { fields: 1, .. })
        ));
    }

    #[test]
    fn test_one_bad_group_rejects_whole_value() {
        assert!(matches!(
            decode("TCP-8080-30080.HTTP-9090-80"),
            Err(DecodeError::PortOutOfRange {
                port: PortRole::Gateway,
                ..
            })
        ));
        assert!(matches!(
            decode("TCP-8080-30080.HTTP-9090"),
            Err(DecodeError::MalformedGroup { .. })
        ));
    }

    #[test]
    fn test_gateway_port_bounds() {
        assert_eq!(
            decode("TCP-8080-29999"),
            Err(DecodeError::PortOutOfRange {
                port: PortRole::Gateway,
                value: "29999".into(),
                min: MIN_GATEWAY_PORT,
                max: MAX_GATEWAY_PORT,
            })
        );
        assert!(decode("TCP-8080-30000").is_ok());
        assert!(decode("TCP-8080-65535").is_ok());
        assert!(matches!(
            decode("TCP-8080-65536"),
            Err(DecodeError::PortOutOfRange {
                port: PortRole::Gateway,
                ..
            })
        ));
        assert!(matches!(
            decode("TCP-8080-99999999999"),
            Err(DecodeError::PortOutOfRange { .. })
        ));
    }

    #[test]
    fn test_service_port_bounds() {
        assert_eq!(
            decode("TCP-0-30080"),
            Err(DecodeError::PortOutOfRange {
                port: PortRole::Service,
                value: "0".into(),
                min: MIN_SERVICE_PORT,
                max: MAX_SERVICE_PORT,
            })
        );
        assert_eq!(decode("TCP-65535-30080").unwrap().rules()[0].service_port, 65535);
        assert!(decode("TCP-65536-30080").is_err());
    }

    #[test]
    fn test_non_numeric_ports_rejected() {
        for value in ["TCP-http-30080", "TCP-+80-30080", "TCP-80-", "TCP-80- 30080"] {
            assert!(
                matches!(decode(value), Err(DecodeError::PortOutOfRange { .. })),
                "{value} should be rejected"
            );
        }
    }

    #[test]
    fn test_error_names_port_and_bounds() {
        let err = decode("HTTP-80-1").unwrap_err();
        assert_eq!(
            err.to_string(),
            "gateway port \"1\" must be a number in [30000, 65535]"
        );
    }
}
