//! Process-level configuration, read once at startup from environment
//! variables (spec §6.1). There is no hot reload: a `GatewaySettings` is
//! fixed for the lifetime of the process.

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .ok()
        .map(|s| {
            s.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub host: String,
    pub port: u16,
    pub admin_secret: Option<String>,
    pub sensitive_headers: Vec<String>,
    pub default_proxy: Option<String>,
    pub proxy_whitelist: Vec<String>,
    pub allow_private_proxy: bool,
    pub log_record_200: bool,
    pub log_max_entries: usize,
    pub log_max_body_size: usize,
    pub log_retention_hours: i64,
    pub log_max_memory_mb: usize,
    pub config_persist: bool,
    pub config_file: String,
    pub config_auto_save_seconds: u64,
    pub max_request_body_size: usize,
    pub http_client_timeout_seconds: u64,
    pub shutdown_grace_seconds: u64,
}

const DEFAULT_SENSITIVE_HEADERS: &[&str] = &[
    "cf-",
    "x-forwarded",
    "proxy",
    "via",
    "x-request-id",
    "x-trace",
    "x-correlation-id",
    "x-country",
    "x-region",
    "x-city",
];

impl GatewaySettings {
    pub fn from_env() -> Self {
        let port = std::env::var("GATEWAY_PORT")
            .or_else(|_| std::env::var("PORT"))
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10_805);

        let sensitive_headers = env_list("SENSITIVE_HEADERS");
        let sensitive_headers = if sensitive_headers.is_empty() {
            DEFAULT_SENSITIVE_HEADERS.iter().map(|s| s.to_string()).collect()
        } else {
            sensitive_headers
        };

        Self {
            host: env_string("GATEWAY_HOST", "0.0.0.0"),
            port,
            admin_secret: std::env::var("ADMIN_SECRET").ok().filter(|s| !s.is_empty()),
            sensitive_headers,
            default_proxy: std::env::var("DEFAULT_PROXY").ok().filter(|s| !s.is_empty()),
            proxy_whitelist: env_list("PROXY_WHITELIST"),
            allow_private_proxy: env_parse("ALLOW_PRIVATE_PROXY", false),
            log_record_200: env_parse("LOG_RECORD_200", false),
            log_max_entries: env_parse("LOG_MAX_ENTRIES", 1_000),
            log_max_body_size: env_parse("LOG_MAX_BODY_SIZE", 8_192),
            log_retention_hours: env_parse("LOG_RETENTION_HOURS", 24),
            log_max_memory_mb: env_parse("LOG_MAX_MEMORY_MB", 50),
            config_persist: env_parse("PROXY_CONFIG_PERSIST", false),
            config_file: env_string("PROXY_CONFIG_FILE", "proxy-configs.json"),
            config_auto_save_seconds: env_parse("PROXY_CONFIG_AUTO_SAVE", 30),
            max_request_body_size: env_parse("MAX_REQUEST_BODY_SIZE", 10 * 1024 * 1024),
            http_client_timeout_seconds: env_parse("HTTP_CLIENT_TIMEOUT_SECONDS", 30),
            shutdown_grace_seconds: env_parse("SHUTDOWN_GRACE_SECONDS", 30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_sensitive_headers_applied_when_unset() {
        std::env::remove_var("SENSITIVE_HEADERS");
        let settings = GatewaySettings::from_env();
        assert!(settings.sensitive_headers.contains(&"via".to_string()));
    }

    #[test]
    fn port_env_var_precedence() {
        std::env::set_var("GATEWAY_PORT", "9999");
        std::env::set_var("PORT", "1111");
        let settings = GatewaySettings::from_env();
        assert_eq!(settings.port, 9999);
        std::env::remove_var("GATEWAY_PORT");
        std::env::remove_var("PORT");
    }
}
