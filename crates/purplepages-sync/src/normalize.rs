use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use snafu::Snafu;

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum NormalizeError {
    #[snafu(display("Empty relay URL"))]
    Empty,
    #[snafu(display("Invalid relay URL: {message}"))]
    Invalid { message: String },
    #[snafu(display("Unsupported scheme `{scheme}`"))]
    UnsupportedScheme { scheme: String },
    #[snafu(display("Blocked host `{host}`"))]
    BlockedHost { host: String },
}
pub type NormalizeResult<T> = std::result::Result<T, NormalizeError>;

/// Canonicalize a user-provided relay URL.
///
/// `scheme://host[:port]` with a lowercase host, no path/query/fragment,
/// and the port elided when it is the scheme default. Local, private,
/// link-local and Tor hosts are rejected so the syncers never dial into
/// someone's internal network. Idempotent: normalizing a normalized URL
/// returns it unchanged.
pub fn normalize_relay_url(input: &str) -> NormalizeResult<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(NormalizeError::Empty);
    }

    let with_scheme = if trimmed.contains("://") {
        trimmed.to_owned()
    } else {
        format!("wss://{trimmed}")
    };

    let url = url::Url::parse(&with_scheme).map_err(|err| NormalizeError::Invalid {
        message: err.to_string(),
    })?;

    let scheme = url.scheme();
    if scheme != "ws" && scheme != "wss" {
        return Err(NormalizeError::UnsupportedScheme {
            scheme: scheme.to_owned(),
        });
    }

    let host = url
        .host_str()
        .ok_or(NormalizeError::Invalid {
            message: "missing host".to_owned(),
        })?
        .to_lowercase();

    if is_blocked_host(&host) {
        return Err(NormalizeError::BlockedHost { host });
    }

    let default_port = if scheme == "wss" { 443 } else { 80 };
    let port_part = match url.port() {
        Some(port) if port != default_port => format!(":{port}"),
        _ => String::new(),
    };

    Ok(format!("{scheme}://{host}{port_part}"))
}

fn is_blocked_host(host: &str) -> bool {
    if host.ends_with(".onion") {
        return true;
    }
    if matches!(host, "localhost" | "127.0.0.1" | "::1" | "0.0.0.0") {
        return true;
    }

    // bracketed IPv6 hosts come back as `[::1]`
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    match bare.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => is_blocked_v4(ip),
        Ok(IpAddr::V6(ip)) => is_blocked_v6(ip),
        Err(_) => false,
    }
}

fn is_blocked_v4(ip: Ipv4Addr) -> bool {
    ip.is_loopback() || ip.is_private() || ip.is_link_local() || ip.is_unspecified()
}

fn is_blocked_v6(ip: Ipv6Addr) -> bool {
    // fc00::/7 unique-local and fe80::/10 link-local
    let unique_local = (ip.segments()[0] & 0xfe00) == 0xfc00;
    let link_local = (ip.segments()[0] & 0xffc0) == 0xfe80;
    ip.is_loopback() || ip.is_unspecified() || unique_local || link_local
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_hostname_gets_wss_and_lowercase() {
        assert_eq!(
            normalize_relay_url(" Relay.Example.com "),
            Ok("wss://relay.example.com".to_owned())
        );
    }

    #[test]
    fn default_port_and_path_are_stripped() {
        assert_eq!(
            normalize_relay_url("wss://relay.example.com:443/"),
            Ok("wss://relay.example.com".to_owned())
        );
        assert_eq!(
            normalize_relay_url("ws://relay.example.com:80/some/path?x=1"),
            Ok("ws://relay.example.com".to_owned())
        );
    }

    #[test]
    fn non_default_port_is_kept() {
        assert_eq!(
            normalize_relay_url("wss://relay.example.com:7777"),
            Ok("wss://relay.example.com:7777".to_owned())
        );
        assert_eq!(
            normalize_relay_url("ws://relay.example.com:443"),
            Ok("ws://relay.example.com:443".to_owned())
        );
    }

    #[test]
    fn rejects_private_and_local_hosts() {
        for input in [
            "ws://10.0.0.1",
            "wss://192.168.1.5",
            "wss://172.16.0.1",
            "wss://127.0.0.1",
            "wss://0.0.0.0",
            "wss://localhost",
            "wss://169.254.1.1",
            "wss://[::1]",
            "wss://[fc00::1]",
            "wss://[fe80::1]",
            "wss://bad.onion",
        ] {
            assert!(
                matches!(
                    normalize_relay_url(input),
                    Err(NormalizeError::BlockedHost { .. })
                ),
                "{input} should be blocked"
            );
        }
        // public addresses pass
        assert!(normalize_relay_url("wss://8.8.8.8").is_ok());
        assert!(normalize_relay_url("wss://172.32.0.1").is_ok());
    }

    #[test]
    fn rejects_empty_and_foreign_schemes() {
        assert_eq!(normalize_relay_url("   "), Err(NormalizeError::Empty));
        assert!(matches!(
            normalize_relay_url("https://relay.example.com"),
            Err(NormalizeError::UnsupportedScheme { .. })
        ));
    }

    #[test]
    fn normalization_is_idempotent() {
        for input in [
            "Relay.Example.com",
            "wss://relay.example.com:7777",
            "ws://relay.example.com/path",
        ] {
            let once = normalize_relay_url(input).expect("normalizes");
            assert_eq!(normalize_relay_url(&once), Ok(once.clone()));
        }
    }
}
