//! Maps a WebSocket upgrade path to the upstream endpoint to dial.
//!
//! Three encodings are recognised, in order:
//!
//! * `/XX` or `/XX,YY,...` selects registry keys; one key and then one of its
//!   endpoints are picked at random.
//! * `/<host><sep><port>` with `sep` one of `:`, `=`, `-` names the target
//!   directly.
//! * anything else falls back to the configured default target, or to a
//!   random endpoint of the proxy directory when no default is configured.

use std::fmt;

use once_cell::sync::Lazy;
use rand::Rng;
use rand::seq::SliceRandom;
use regex::Regex;
use worker::console_warn;

use crate::config::GatewayConfig;
use crate::directory::{ProxyEndpoint, UNKNOWN};
use crate::error::TunnelError;
use crate::registry::KvRegistry;

pub const DEFAULT_PORT: u16 = 443;

static DIRECT_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^.+[:=-]\d+$").unwrap());
static TARGET_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(.+)[:=-](\d+)$").unwrap());

#[derive(Debug, PartialEq, Eq)]
pub enum TargetSpec {
    Keys(Vec<String>),
    Direct(String),
    Default,
}

impl TargetSpec {
    pub fn classify(path: &str) -> Self {
        let path = path.strip_prefix('/').unwrap_or(path);

        if path.chars().count() == 2 || path.contains(',') {
            let keys: Vec<String> = path
                .split(',')
                .map(|key| key.trim().to_ascii_uppercase())
                .filter(|key| !key.is_empty())
                .collect();
            if !keys.is_empty() {
                return TargetSpec::Keys(keys);
            }
        }

        if DIRECT_PATTERN.is_match(path) {
            TargetSpec::Direct(path.to_string())
        } else {
            TargetSpec::Default
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    /// Split a `host<sep>port` string. The port falls back to 443 when it is
    /// missing, non-numeric or out of range.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }

        let (host, port) = match TARGET_PATTERN.captures(raw) {
            Some(caps) => (
                caps[1].to_string(),
                caps[2].parse().unwrap_or(DEFAULT_PORT),
            ),
            None if !raw.starts_with('[') => match raw.split_once([':', '=']) {
                Some((host, _)) => (host.to_string(), DEFAULT_PORT),
                None => (raw.to_string(), DEFAULT_PORT),
            },
            None => (raw.to_string(), DEFAULT_PORT),
        };

        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .map(str::to_string)
            .unwrap_or(host);
        if host.is_empty() {
            return None;
        }
        Some(Self { host, port })
    }

    /// Hostname in the form the socket API expects (IPv6 literals bracketed).
    pub fn dial_host(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.dial_host(), self.port)
    }
}

/// Resolve `spec` against an already loaded registry. `registry` is `None`
/// when loading it failed, which is treated like a missing key.
///
/// Anything that yields no usable target falls back to `default_target`, and
/// when that is empty, to a random entry of `directory`.
pub fn resolve_with<R: Rng + ?Sized>(
    spec: &TargetSpec,
    registry: Option<&KvRegistry>,
    default_target: &str,
    directory: &[ProxyEndpoint],
    rng: &mut R,
) -> Result<Target, TunnelError> {
    let picked = match spec {
        TargetSpec::Keys(keys) => keys.choose(rng).and_then(|key| registry?.pick(key, rng)),
        TargetSpec::Direct(raw) => Some(raw.as_str()),
        TargetSpec::Default => None,
    };

    picked
        .and_then(Target::parse)
        .or_else(|| Target::parse(default_target))
        .or_else(|| directory_target(directory, rng))
        .ok_or_else(|| {
            TunnelError::Resolution(format!(
                "{spec:?} has no usable target, no default is configured and the directory is empty"
            ))
        })
}

fn directory_target<R: Rng + ?Sized>(directory: &[ProxyEndpoint], rng: &mut R) -> Option<Target> {
    let usable: Vec<&ProxyEndpoint> = directory
        .iter()
        .filter(|proxy| !proxy.ip.is_empty() && proxy.ip != UNKNOWN)
        .collect();
    let proxy = usable.choose(rng)?;

    let host = proxy.ip.trim_start_matches('[').trim_end_matches(']');
    Some(Target {
        host: host.to_string(),
        port: proxy.port.parse().unwrap_or(DEFAULT_PORT),
    })
}

/// `directory` is only consulted when no default target is configured.
pub async fn resolve(
    path: &str,
    config: &GatewayConfig,
    directory: &[ProxyEndpoint],
) -> Result<Target, TunnelError> {
    let spec = TargetSpec::classify(path);

    let registry = match spec {
        TargetSpec::Keys(_) => match KvRegistry::fetch(&config.kv_proxy_url).await {
            Ok(registry) => Some(registry),
            Err(e) => {
                console_warn!("[registry]: {}, using default target", e);
                None
            }
        },
        _ => None,
    };

    resolve_with(
        &spec,
        registry.as_ref(),
        &config.default_target,
        directory,
        &mut rand::thread_rng(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::parse_feed;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn target(host: &str, port: u16) -> Target {
        Target {
            host: host.into(),
            port,
        }
    }

    #[test]
    fn classifies_paths() {
        assert_eq!(TargetSpec::classify("/US"), TargetSpec::Keys(vec!["US".into()]));
        assert_eq!(
            TargetSpec::classify("/id,sg"),
            TargetSpec::Keys(vec!["ID".into(), "SG".into()])
        );
        assert_eq!(
            TargetSpec::classify("/1.2.3.4:8080"),
            TargetSpec::Direct("1.2.3.4:8080".into())
        );
        assert_eq!(
            TargetSpec::classify("/proxy.example.com-443"),
            TargetSpec::Direct("proxy.example.com-443".into())
        );
        assert_eq!(TargetSpec::classify("/ws"), TargetSpec::Keys(vec!["WS".into()]));
        assert_eq!(TargetSpec::classify("/"), TargetSpec::Default);
        assert_eq!(TargetSpec::classify("/garbage"), TargetSpec::Default);
        assert_eq!(TargetSpec::classify("/host:port"), TargetSpec::Default);
        assert_eq!(TargetSpec::classify("/,"), TargetSpec::Default);
    }

    #[test]
    fn parses_targets() {
        assert_eq!(Target::parse("1.2.3.4:8080"), Some(target("1.2.3.4", 8080)));
        assert_eq!(Target::parse("1.2.3.4=2053"), Some(target("1.2.3.4", 2053)));
        assert_eq!(
            Target::parse("edge-01.example.com-8443"),
            Some(target("edge-01.example.com", 8443))
        );
        assert_eq!(Target::parse("example.com"), Some(target("example.com", 443)));
        assert_eq!(Target::parse("example.com:http"), Some(target("example.com", 443)));
        assert_eq!(Target::parse("example.com:99999"), Some(target("example.com", 443)));
        assert_eq!(Target::parse("[2001:db8::1]:8443"), Some(target("2001:db8::1", 8443)));
        assert_eq!(Target::parse("  "), None);
        assert_eq!(Target::parse(":443"), None);
    }

    #[test]
    fn ipv6_hosts_are_bracketed_for_dialing() {
        let t = target("2001:db8::1", 443);
        assert_eq!(t.dial_host(), "[2001:db8::1]");
        assert_eq!(t.to_string(), "[2001:db8::1]:443");
        assert_eq!(target("1.2.3.4", 80).to_string(), "1.2.3.4:80");
    }

    #[test]
    fn registry_keys_pick_from_registry() {
        let registry = KvRegistry::parse(r#"{"US": ["9.9.9.9:2053"]}"#).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let resolved = resolve_with(
            &TargetSpec::classify("/US"),
            Some(&registry),
            "8.8.8.8:443",
            &[],
            &mut rng,
        )
        .unwrap();
        assert_eq!(resolved, target("9.9.9.9", 2053));
    }

    #[test]
    fn missing_key_or_registry_falls_back_to_default() {
        let registry = KvRegistry::parse(r#"{"US": ["9.9.9.9:2053"]}"#).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let spec = TargetSpec::classify("/JP");

        let resolved = resolve_with(&spec, Some(&registry), "8.8.8.8-443", &[], &mut rng).unwrap();
        assert_eq!(resolved, target("8.8.8.8", 443));

        let resolved = resolve_with(&spec, None, "8.8.8.8-443", &[], &mut rng).unwrap();
        assert_eq!(resolved, target("8.8.8.8", 443));
    }

    #[test]
    fn direct_and_default_paths() {
        let mut rng = StdRng::seed_from_u64(1);
        let direct = resolve_with(&TargetSpec::classify("/1.2.3.4:8080"), None, "", &[], &mut rng);
        assert_eq!(direct.unwrap(), target("1.2.3.4", 8080));

        let fallback = resolve_with(&TargetSpec::classify("/nothing"), None, "7.7.7.7", &[], &mut rng);
        assert_eq!(fallback.unwrap(), target("7.7.7.7", 443));
    }

    #[test]
    fn unset_default_falls_back_to_directory() {
        let directory = parse_feed("Unknown\n5.5.5.5,8443,DE,Hetzner\n");
        let mut rng = StdRng::seed_from_u64(3);

        for path in ["/", "/garbage", "/JP"] {
            let resolved = resolve_with(&TargetSpec::classify(path), None, "", &directory, &mut rng);
            assert_eq!(resolved.unwrap(), target("5.5.5.5", 8443));
        }

        let registry = KvRegistry::parse(r#"{"US": [":443"]}"#).unwrap();
        let resolved = resolve_with(&TargetSpec::classify("/US"), Some(&registry), "", &directory, &mut rng);
        assert_eq!(resolved.unwrap(), target("5.5.5.5", 8443));
    }

    #[test]
    fn configured_default_wins_over_directory() {
        let directory = parse_feed("5.5.5.5,8443,DE,Hetzner\n");
        let mut rng = StdRng::seed_from_u64(3);
        let resolved = resolve_with(&TargetSpec::Default, None, "7.7.7.7=2053", &directory, &mut rng);
        assert_eq!(resolved.unwrap(), target("7.7.7.7", 2053));
    }

    #[test]
    fn directory_entries_without_numeric_port_use_443() {
        let directory = parse_feed("2001:db8::1,,JP,Foo\n");
        let mut rng = StdRng::seed_from_u64(3);
        let resolved = resolve_with(&TargetSpec::Default, None, "", &directory, &mut rng).unwrap();
        assert_eq!(resolved, target("2001:db8::1", 443));
        assert_eq!(resolved.to_string(), "[2001:db8::1]:443");
    }

    #[test]
    fn unresolvable_without_default_or_directory_is_an_error() {
        let mut rng = StdRng::seed_from_u64(1);
        let err = resolve_with(&TargetSpec::Default, None, "", &[], &mut rng).unwrap_err();
        assert!(matches!(err, TunnelError::Resolution(_)));
    }
}
