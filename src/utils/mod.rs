use pnet::datalink;
use std::net::Ipv4Addr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub fn get_ip_address() -> Option<Ipv4Addr> {
    for iface in datalink::interfaces() {
        for ip in iface.ips {
            if let pnet::ipnetwork::IpNetwork::V4(network) = ip {
                if !network.ip().is_loopback() {
                    return Some(network.ip());
                }
            }
        }
    }
    None
}

/// `RUST_LOG` wins over `default_filter`. Logs go to stderr so captured
/// output on stdout stays clean.
pub fn init_tracing(default_filter: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Accepts a non-negative integer given either as a JSON number or a numeric string.
pub fn parse_capacity(value: &serde_json::Value, field_name: &str) -> Result<usize, String> {
    match value {
        serde_json::Value::Number(n) if n.is_u64() => n
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| format!("{field_name} must be a valid size.")),
        serde_json::Value::String(s) => s
            .trim()
            .parse::<usize>()
            .map_err(|_| format!("{field_name} must be a valid size string.")),
        _ => Err(format!("{field_name} must be a number or a valid string.")),
    }
}
