use uuid::Uuid;
use worker::Env;

pub const DEFAULT_SERVICE_NAME: &str = "tunnel-gateway";
pub const DEFAULT_PROXY_BANK_URL: &str =
    "https://raw.githubusercontent.com/FoolVPN-ID/Nautica/refs/heads/main/proxyList.txt";
pub const DEFAULT_KV_PROXY_URL: &str =
    "https://raw.githubusercontent.com/FoolVPN-ID/Nautica/refs/heads/main/kvProxyList.json";
pub const DEFAULT_CONVERTER_URL: &str = "https://api.foolvpn.me/convert";
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 300;

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub service_name: String,
    /// Fixed credential for generated links. `None` means a fresh v4 per request.
    pub session_id: Option<Uuid>,
    pub proxy_bank_url: String,
    pub kv_proxy_url: String,
    pub converter_url: String,
    /// Empty means a random directory endpoint is used as the fallback.
    pub default_target: String,
    pub refresh_interval_ms: u64,
}

impl GatewayConfig {
    pub fn from_env(env: &Env) -> Self {
        Self::from_lookup(|key| env.var(key).ok().map(|v| v.to_string()))
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        Self {
            service_name: var("SERVICE_NAME").unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string()),
            session_id: var("UUID").and_then(|v| Uuid::parse_str(&v).ok()),
            proxy_bank_url: var("PROXY_BANK_URL")
                .unwrap_or_else(|| DEFAULT_PROXY_BANK_URL.to_string()),
            kv_proxy_url: var("KV_PROXY_URL").unwrap_or_else(|| DEFAULT_KV_PROXY_URL.to_string()),
            converter_url: var("CONVERTER_URL")
                .unwrap_or_else(|| DEFAULT_CONVERTER_URL.to_string()),
            default_target: var("DEFAULT_TARGET").unwrap_or_default(),
            refresh_interval_ms: var("REFRESH_INTERVAL_SECS")
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(DEFAULT_REFRESH_INTERVAL_SECS)
                * 1000,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id.unwrap_or_else(Uuid::new_v4)
    }
}
