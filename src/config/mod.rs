use std::env;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
}

/// 各层限流的请求上限，窗口长度固定为分钟/小时/天
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RateLimitConfig {
    pub client_per_minute: u32,
    pub client_per_hour: u32,
    pub client_per_day: u32,
    pub operation_per_minute: u32,
    pub operation_per_hour: u32,
    pub intensive_per_minute: u32,
    pub intensive_per_hour: u32,
    pub attachment_per_minute: u32,
    pub attachment_per_hour: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            client_per_minute: 20,
            client_per_hour: 200,
            client_per_day: 1000,
            operation_per_minute: 20,
            operation_per_hour: 150,
            intensive_per_minute: 5,
            intensive_per_hour: 30,
            attachment_per_minute: 10,
            attachment_per_hour: 60,
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    /// 未设置时使用进程内存储
    pub redis_url: Option<String>,
    pub admin_token: String,
    pub upstream_url: String,
    pub rate_limits: RateLimitConfig,
    pub violation_threshold: u32,
    pub violation_ttl_secs: u64,
    pub block_duration_secs: u64,
    pub cache_ttl_secs: u64,
    pub cache_intensive_ttl_secs: u64,
    pub cache_compression_threshold: usize,
    pub max_request_bytes: u64,
    pub max_query_length: usize,
    pub max_document_length: usize,
    /// `*` 表示允许任意来源
    pub allowed_origins: Vec<String>,
    pub enable_csp: bool,
    pub enable_hsts: bool,
    pub security_event_ttl_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_host: "::".to_string(),
            server_port: 3000,
            redis_url: None,
            admin_token: String::new(),
            upstream_url: "http://127.0.0.1:8080/v1/answer".to_string(),
            rate_limits: RateLimitConfig::default(),
            violation_threshold: 10,
            violation_ttl_secs: 24 * 3600,
            block_duration_secs: 3600,
            cache_ttl_secs: 3600,
            cache_intensive_ttl_secs: 7200,
            cache_compression_threshold: 10 * 1024,
            max_request_bytes: 1024 * 1024,
            max_query_length: 5000,
            max_document_length: 500_000,
            allowed_origins: vec!["*".to_string()],
            enable_csp: true,
            enable_hsts: false,
            security_event_ttl_secs: 7 * 24 * 3600,
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let defaults = Config::default();
        let limits = RateLimitConfig::default();

        let admin_token = env::var("ADMIN_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty())
            .ok_or(ConfigError::Missing("ADMIN_TOKEN"))?;

        let allowed_origins = env::var("ALLOWED_ORIGINS")
            .map(|v| {
                v.split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect::<Vec<_>>()
            })
            .ok()
            .filter(|o| !o.is_empty())
            .unwrap_or(defaults.allowed_origins);

        Ok(Config {
            server_host: env::var("SERVER_HOST").unwrap_or(defaults.server_host),
            server_port: env_or("SERVER_PORT", defaults.server_port),
            redis_url: env::var("REDIS_URL").ok().filter(|u| !u.trim().is_empty()),
            admin_token,
            upstream_url: env::var("UPSTREAM_URL").unwrap_or(defaults.upstream_url),
            rate_limits: RateLimitConfig {
                client_per_minute: env_or("RATE_LIMIT_CLIENT_PER_MINUTE", limits.client_per_minute),
                client_per_hour: env_or("RATE_LIMIT_CLIENT_PER_HOUR", limits.client_per_hour),
                client_per_day: env_or("RATE_LIMIT_CLIENT_PER_DAY", limits.client_per_day),
                operation_per_minute: env_or(
                    "RATE_LIMIT_OPERATION_PER_MINUTE",
                    limits.operation_per_minute,
                ),
                operation_per_hour: env_or("RATE_LIMIT_OPERATION_PER_HOUR", limits.operation_per_hour),
                intensive_per_minute: env_or(
                    "RATE_LIMIT_INTENSIVE_PER_MINUTE",
                    limits.intensive_per_minute,
                ),
                intensive_per_hour: env_or("RATE_LIMIT_INTENSIVE_PER_HOUR", limits.intensive_per_hour),
                attachment_per_minute: env_or(
                    "RATE_LIMIT_ATTACHMENT_PER_MINUTE",
                    limits.attachment_per_minute,
                ),
                attachment_per_hour: env_or(
                    "RATE_LIMIT_ATTACHMENT_PER_HOUR",
                    limits.attachment_per_hour,
                ),
            },
            violation_threshold: env_or("VIOLATION_THRESHOLD", defaults.violation_threshold),
            violation_ttl_secs: env_or("VIOLATION_TTL", defaults.violation_ttl_secs),
            block_duration_secs: env_or("BLOCK_DURATION", defaults.block_duration_secs),
            cache_ttl_secs: env_or("CACHE_TTL", defaults.cache_ttl_secs),
            cache_intensive_ttl_secs: env_or("CACHE_INTENSIVE_TTL", defaults.cache_intensive_ttl_secs),
            cache_compression_threshold: env_or(
                "CACHE_COMPRESSION_THRESHOLD",
                defaults.cache_compression_threshold,
            ),
            max_request_bytes: env_or("MAX_REQUEST_BYTES", defaults.max_request_bytes),
            max_query_length: env_or("MAX_QUERY_LENGTH", defaults.max_query_length),
            max_document_length: env_or("MAX_DOCUMENT_LENGTH", defaults.max_document_length),
            allowed_origins,
            enable_csp: env_or("ENABLE_CSP", defaults.enable_csp),
            enable_hsts: env_or("ENABLE_HSTS", defaults.enable_hsts),
            security_event_ttl_secs: env_or("SECURITY_EVENT_TTL", defaults.security_event_ttl_secs),
        })
    }

    /// 主机名无法解析时监听双栈通配地址
    pub fn bind_addr(&self) -> SocketAddr {
        let host = self.server_host.parse().unwrap_or_else(|_| {
            tracing::warn!(host = %self.server_host, "Invalid SERVER_HOST, listening on [::]");
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        });
        SocketAddr::new(host, self.server_port)
    }

    pub fn violation_ttl(&self) -> Duration {
        Duration::from_secs(self.violation_ttl_secs)
    }

    pub fn block_duration(&self) -> Duration {
        Duration::from_secs(self.block_duration_secs)
    }

    pub fn cache_ttl(&self, intensive: bool) -> Duration {
        if intensive {
            Duration::from_secs(self.cache_intensive_ttl_secs)
        } else {
            Duration::from_secs(self.cache_ttl_secs)
        }
    }

    pub fn security_event_ttl(&self) -> Duration {
        Duration::from_secs(self.security_event_ttl_secs)
    }
}
