//! TCP services ConfigMap
//!
//! Each entry maps a listening port to a service port:
//! `"5432": "db/postgres:5432"`. Anything after a second `:` (proxy
//! protocol flags and the like) is ignored.

use super::model::{BackendRef, Contribution, TcpService};
use super::types::split_name;
use gatehouse_common::{ResourceType, TrackingRef};
use std::collections::BTreeMap;
use tracing::warn;

fn parse_entry(key: &str, value: &str) -> Result<TcpService, String> {
    let port: i32 = key
        .trim()
        .parse()
        .map_err(|_| format!("invalid listening port '{}'", key))?;
    if !(1..=65535).contains(&port) {
        return Err(format!("listening port {} out of range", port));
    }

    let mut parts = value.trim().splitn(3, ':');
    let service = parts.next().unwrap_or_default();
    let service_port = parts.next().unwrap_or_default();
    if service.is_empty() || service_port.is_empty() {
        return Err(format!("expected '<namespace>/<service>:<port>', got '{}'", value));
    }
    let (namespace, name) = split_name(service, "default");
    if name.is_empty() {
        return Err(format!("missing service name in '{}'", value));
    }

    Ok(TcpService {
        port,
        backend: BackendRef::new(namespace, name, service_port),
    })
}

/// Convert the TCP services ConfigMap data
///
/// Invalid entries are logged and skipped. `config_map_name` is the
/// `namespace/name` the contribution is tracked under.
pub fn convert_tcp_services(
    config_map_name: &str,
    data: &BTreeMap<String, String>,
) -> Contribution {
    let mut contribution =
        Contribution::new(TrackingRef::new(ResourceType::ConfigMap, config_map_name));

    for (key, value) in data {
        match parse_entry(key, value) {
            Ok(tcp) => {
                contribution.backends.insert(tcp.backend.clone());
                contribution.tcp_services.push(tcp);
            }
            Err(e) => warn!(config_map = config_map_name, "skipping TCP service {}: {}", key, e),
        }
    }
    contribution
}
