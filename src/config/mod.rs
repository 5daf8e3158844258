use anyhow::Context;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub api_server: ServerConfig,
    pub site_server: ServerConfig,
    pub site: SiteConfig,
    pub auth: AuthConfig,
    pub geolocation: GeolocationConfig,
    pub proxy: ProxyConfig,
    pub ledger: LedgerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    Sqlite,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Directory served behind the gate
    /// If None, a placeholder page is served
    pub static_dir: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    None,
    ApiKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub mode: AuthMode,
    #[serde(default, skip_serializing)]
    pub api_keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeolocationConfig {
    /// Base URL of the provider; lookups go to `{api_url}/{ip}`
    pub api_url: String,
    pub timeout_ms: u64,
    pub cache_ttl_secs: u64,
    pub cache_capacity: u64,
}

impl Default for GeolocationConfig {
    fn default() -> Self {
        Self {
            api_url: Self::DEFAULT_API_URL.to_string(),
            timeout_ms: Self::DEFAULT_TIMEOUT_MS,
            cache_ttl_secs: Self::DEFAULT_CACHE_TTL_SECS,
            cache_capacity: Self::DEFAULT_CACHE_CAPACITY,
        }
    }
}

impl GeolocationConfig {
    pub const DEFAULT_API_URL: &'static str = "https://api.country.is";
    pub const DEFAULT_TIMEOUT_MS: u64 = 3_000;
    pub const DEFAULT_CACHE_TTL_SECS: u64 = 24 * 60 * 60;
    pub const DEFAULT_CACHE_CAPACITY: u64 = 100_000;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustedProxyMode {
    /// Use the socket peer address only
    #[default]
    None,
    /// Forwarded / X-Forwarded-For with trust validation
    Standard,
    /// CF-Connecting-IP
    Cloudflare,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub trusted_proxy_mode: TrustedProxyMode,
    #[serde(default)]
    pub trusted_proxies: Vec<IpNet>,
    #[serde(default)]
    pub num_trusted_proxies: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Seed zero-count rows for every known country at start-up
    pub preload_countries: bool,
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

fn env_parse<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("{name} has an invalid value '{raw}'")),
        Err(_) => Ok(default),
    }
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let backend_str =
            std::env::var("DATABASE_BACKEND").unwrap_or_else(|_| "sqlite".to_string());

        let backend = match backend_str.to_lowercase().as_str() {
            "postgres" | "postgresql" => DatabaseBackend::Postgres,
            _ => DatabaseBackend::Sqlite,
        };

        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./country_gate.db?mode=rwc".to_string());
        let max_connections = env_parse("DATABASE_MAX_CONNECTIONS", 5u32)?;

        let api_host = std::env::var("API_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let api_port = env_parse("API_PORT", 8080u16)?;

        let site_host = std::env::var("SITE_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let site_port = env_parse("SITE_PORT", 3000u16)?;
        let static_dir = std::env::var("SITE_STATIC_DIR").ok();

        let auth_mode = match std::env::var("AUTH_MODE")
            .unwrap_or_else(|_| "none".to_string())
            .to_lowercase()
            .as_str()
        {
            "none" => AuthMode::None,
            "apikey" | "api_key" | "api-key" => AuthMode::ApiKey,
            other => {
                tracing::warn!(
                    "Unknown AUTH_MODE '{other}', falling back to 'none'. Supported values: none, apikey"
                );
                AuthMode::None
            }
        };

        let api_keys: Vec<String> = std::env::var("ADMIN_API_KEYS")
            .map(|raw| split_list(&raw).map(str::to_string).collect())
            .unwrap_or_default();

        if auth_mode == AuthMode::ApiKey && api_keys.is_empty() {
            anyhow::bail!("ADMIN_API_KEYS must be set when AUTH_MODE=apikey");
        }

        let geolocation = GeolocationConfig {
            api_url: std::env::var("GEO_API_URL")
                .unwrap_or_else(|_| GeolocationConfig::DEFAULT_API_URL.to_string()),
            timeout_ms: env_parse("GEO_TIMEOUT_MS", GeolocationConfig::DEFAULT_TIMEOUT_MS)?,
            cache_ttl_secs: env_parse(
                "GEO_CACHE_TTL_SECS",
                GeolocationConfig::DEFAULT_CACHE_TTL_SECS,
            )?,
            cache_capacity: env_parse(
                "GEO_CACHE_CAPACITY",
                GeolocationConfig::DEFAULT_CACHE_CAPACITY,
            )?,
        };

        let trusted_proxy_mode = match std::env::var("TRUSTED_PROXY_MODE")
            .unwrap_or_else(|_| "none".to_string())
            .to_lowercase()
            .as_str()
        {
            "none" => TrustedProxyMode::None,
            "standard" => TrustedProxyMode::Standard,
            "cloudflare" => TrustedProxyMode::Cloudflare,
            other => {
                tracing::warn!(
                    "Unknown TRUSTED_PROXY_MODE '{other}', falling back to 'none'. Supported values: none, standard, cloudflare"
                );
                TrustedProxyMode::None
            }
        };

        let trusted_proxies = match std::env::var("TRUSTED_PROXIES") {
            Ok(raw) => split_list(&raw)
                .map(|cidr| {
                    cidr.parse::<IpNet>()
                        .with_context(|| format!("TRUSTED_PROXIES entry '{cidr}' is not a CIDR"))
                })
                .collect::<anyhow::Result<Vec<_>>>()?,
            Err(_) => Vec::new(),
        };

        let num_trusted_proxies = std::env::var("NUM_TRUSTED_PROXIES")
            .ok()
            .map(|v| {
                v.trim()
                    .parse::<usize>()
                    .with_context(|| format!("NUM_TRUSTED_PROXIES has an invalid value '{v}'"))
            })
            .transpose()?;

        Ok(Config {
            database: DatabaseConfig {
                backend,
                url: database_url,
                max_connections,
            },
            api_server: ServerConfig {
                host: api_host,
                port: api_port,
            },
            site_server: ServerConfig {
                host: site_host,
                port: site_port,
            },
            site: SiteConfig { static_dir },
            auth: AuthConfig {
                mode: auth_mode,
                api_keys,
            },
            geolocation,
            proxy: ProxyConfig {
                trusted_proxy_mode,
                trusted_proxies,
                num_trusted_proxies,
            },
            ledger: LedgerConfig {
                preload_countries: env_flag("PRELOAD_COUNTRIES", true),
            },
        })
    }
}
