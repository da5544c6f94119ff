//! Subscription compilation: filter, shuffle, generate and render share links.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use rand::Rng;
use rand::seq::SliceRandom;
use serde::Serialize;

use crate::directory::ProxyEndpoint;
use crate::uri::{Protocol, generate};

pub const DEFAULT_LIMIT: usize = 10;
pub const MAX_LIMIT: usize = 100;
pub const SUPPORTED_PORTS: [u16; 2] = [443, 80];
pub const CONVERTER_TEMPLATE: &str = "cf";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Raw,
    V2ray,
    Clash,
    Sfa,
    Bfr,
}

impl OutputFormat {
    /// Unknown names render as raw text.
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "v2ray" => OutputFormat::V2ray,
            "clash" => OutputFormat::Clash,
            "sfa" => OutputFormat::Sfa,
            "bfr" => OutputFormat::Bfr,
            _ => OutputFormat::Raw,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OutputFormat::Raw => "raw",
            OutputFormat::V2ray => "v2ray",
            OutputFormat::Clash => "clash",
            OutputFormat::Sfa => "sfa",
            OutputFormat::Bfr => "bfr",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionRequest {
    pub countries: Vec<String>,
    pub ports: Vec<u16>,
    pub protocols: Vec<Protocol>,
    pub limit: usize,
    pub format: OutputFormat,
    /// Feed to read instead of the shared directory, for this request only.
    pub proxy_list: Option<String>,
    /// Host written into generated links instead of the request host.
    pub domain: Option<String>,
}

impl Default for SubscriptionRequest {
    fn default() -> Self {
        Self {
            countries: Vec::new(),
            ports: SUPPORTED_PORTS.to_vec(),
            protocols: Protocol::ALL.to_vec(),
            limit: DEFAULT_LIMIT,
            format: OutputFormat::Raw,
            proxy_list: None,
            domain: None,
        }
    }
}

impl SubscriptionRequest {
    pub fn from_query<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut request = Self::default();

        for (key, value) in pairs {
            let value = value.as_ref().trim();
            match key.as_ref() {
                "cc" => {
                    request.countries = split_list(value)
                        .map(|cc| cc.to_ascii_uppercase())
                        .collect();
                }
                "port" => {
                    let mut ports = Vec::new();
                    for port in split_list(value).filter_map(|p| p.parse::<u16>().ok()) {
                        if SUPPORTED_PORTS.contains(&port) && !ports.contains(&port) {
                            ports.push(port);
                        }
                    }
                    if !ports.is_empty() {
                        request.ports = ports;
                    }
                }
                "vpn" | "protocol" => {
                    let mut protocols = Vec::new();
                    for protocol in split_list(value).filter_map(|p| p.parse::<Protocol>().ok()) {
                        if !protocols.contains(&protocol) {
                            protocols.push(protocol);
                        }
                    }
                    if !protocols.is_empty() {
                        request.protocols = protocols;
                    }
                }
                "limit" => {
                    request.limit = value
                        .parse::<usize>()
                        .ok()
                        .filter(|limit| *limit > 0)
                        .unwrap_or(DEFAULT_LIMIT)
                        .min(MAX_LIMIT);
                }
                "format" => request.format = OutputFormat::parse(value),
                "proxy-list" if !value.is_empty() => request.proxy_list = Some(value.to_string()),
                "domain" if !value.is_empty() => request.domain = Some(value.to_string()),
                _ => {}
            }
        }

        request
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// Generate at most `request.limit` (never more than [`MAX_LIMIT`]) links.
///
/// Proxies are filtered by country, shuffled with `rng`, then expanded
/// proxy by proxy over every requested port and protocol.
pub fn compile<R: Rng + ?Sized>(
    proxies: &[ProxyEndpoint],
    request: &SubscriptionRequest,
    host: &str,
    session_id: &str,
    rng: &mut R,
) -> Vec<String> {
    let limit = request.limit.min(MAX_LIMIT);
    let ports: &[u16] = if request.ports.is_empty() {
        &SUPPORTED_PORTS
    } else {
        &request.ports
    };
    let protocols: &[Protocol] = if request.protocols.is_empty() {
        &Protocol::ALL
    } else {
        &request.protocols
    };

    let mut pool: Vec<&ProxyEndpoint> = proxies
        .iter()
        .filter(|proxy| {
            request.countries.is_empty()
                || request
                    .countries
                    .iter()
                    .any(|cc| cc.eq_ignore_ascii_case(&proxy.country))
        })
        .collect();
    pool.shuffle(rng);

    let mut uris = Vec::with_capacity(limit);
    for (index, proxy) in pool.into_iter().enumerate() {
        for &port in ports {
            for &protocol in protocols {
                if uris.len() >= limit {
                    return uris;
                }
                uris.push(generate(protocol, host, port, session_id, proxy, index + 1));
            }
        }
    }
    uris
}

/// Body POSTed to the external converter.
#[derive(Debug, Serialize)]
pub struct ConverterRequest {
    pub url: String,
    pub format: &'static str,
    pub template: &'static str,
}

#[derive(Debug)]
pub enum Rendered {
    Text(String),
    Convert(ConverterRequest),
}

pub fn render(uris: &[String], format: OutputFormat) -> Rendered {
    match format {
        OutputFormat::Raw => Rendered::Text(uris.join("\n")),
        OutputFormat::V2ray => Rendered::Text(STANDARD.encode(uris.join("\n"))),
        OutputFormat::Clash | OutputFormat::Sfa | OutputFormat::Bfr => {
            Rendered::Convert(ConverterRequest {
                url: uris.join(","),
                format: format.as_str(),
                template: CONVERTER_TEMPLATE,
            })
        }
    }
}
