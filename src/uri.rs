//! Share-link generation for VLESS, Trojan and Shadowsocks over WebSocket.

use std::fmt;
use std::iter;
use std::str::FromStr;

use base64::{Engine as _, engine::general_purpose::URL_SAFE};

use crate::directory::ProxyEndpoint;

const REGIONAL_INDICATOR_A: u32 = 0x1F1E6;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    Vless,
    Trojan,
    Shadowsocks,
}

impl Protocol {
    pub const ALL: [Protocol; 3] = [Protocol::Vless, Protocol::Trojan, Protocol::Shadowsocks];

    pub fn scheme(self) -> &'static str {
        match self {
            Protocol::Vless => "vless",
            Protocol::Trojan => "trojan",
            Protocol::Shadowsocks => "ss",
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vless" => Ok(Protocol::Vless),
            "trojan" => Ok(Protocol::Trojan),
            "ss" | "shadowsocks" => Ok(Protocol::Shadowsocks),
            other => Err(format!("unsupported protocol: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Security {
    Tls,
    None,
}

impl Security {
    /// TLS on 443, plaintext everywhere else.
    pub fn for_port(port: u16) -> Self {
        if port == 443 { Security::Tls } else { Security::None }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Security::Tls => "tls",
            Security::None => "none",
        }
    }

    fn tag(self) -> &'static str {
        match self {
            Security::Tls => "TLS",
            Security::None => "NTLS",
        }
    }
}

/// Fields of one share link, ready to be rendered with `Display`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigDescriptor {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    /// Session identifier, or its base64 user-info form for Shadowsocks.
    pub credential: String,
    pub path: String,
    pub security: Security,
    pub sni: String,
    pub label: String,
}

impl ConfigDescriptor {
    pub fn new(
        protocol: Protocol,
        host: &str,
        port: u16,
        session_id: &str,
        proxy: &ProxyEndpoint,
        ordinal: usize,
    ) -> Self {
        let security = Security::for_port(port);
        let credential = match protocol {
            Protocol::Shadowsocks => URL_SAFE.encode(format!("none:{session_id}")),
            Protocol::Vless | Protocol::Trojan => session_id.to_string(),
        };
        let sni = match (protocol, port) {
            (Protocol::Vless, 80) => String::new(),
            _ => host.to_string(),
        };

        Self {
            protocol,
            host: host.to_string(),
            port,
            credential,
            path: format!("/{}-{}", proxy.ip, proxy.port),
            security,
            sni,
            label: format!(
                "{ordinal} {} {} WS {}",
                flag_emoji(&proxy.country),
                proxy.org,
                security.tag()
            ),
        }
    }

    fn plugin(&self) -> String {
        let tls = match self.security {
            Security::Tls => ";tls",
            Security::None => "",
        };
        format!(
            "v2ray-plugin{tls};mux=0;mode=websocket;path={};host={}",
            self.path, self.host
        )
    }
}

impl fmt::Display for ConfigDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}@{}:{}?",
            self.protocol.scheme(),
            self.credential,
            self.host,
            self.port
        )?;
        if self.protocol == Protocol::Shadowsocks {
            write!(f, "plugin={}&", urlencoding::encode(&self.plugin()))?;
        } else {
            f.write_str("encryption=none&")?;
        }
        write!(
            f,
            "type=ws&host={}&security={}&sni={}&path={}#{}",
            self.host,
            self.security.as_str(),
            self.sni,
            self.path,
            urlencoding::encode(&self.label)
        )
    }
}

pub fn generate(
    protocol: Protocol,
    host: &str,
    port: u16,
    session_id: &str,
    proxy: &ProxyEndpoint,
    ordinal: usize,
) -> String {
    ConfigDescriptor::new(protocol, host, port, session_id, proxy, ordinal).to_string()
}

/// Two regional-indicator symbols for a country code. Codes that are not two
/// letters still yield two symbols (padded with `X`), which may not form a
/// real flag.
pub fn flag_emoji(country: &str) -> String {
    country
        .chars()
        .filter(char::is_ascii_alphabetic)
        .map(|c| c.to_ascii_uppercase())
        .chain(iter::repeat('X'))
        .take(2)
        .filter_map(|c| char::from_u32(REGIONAL_INDICATOR_A + (c as u32 - 'A' as u32)))
        .collect()
}
