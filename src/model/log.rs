use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum RequestType {
    Http,
    Https,
    WebSocket,
    Sse,
    #[serde(rename = "Subdomain-HTTP")]
    SubdomainHttp,
    #[serde(rename = "Subdomain-HTTPS")]
    SubdomainHttps,
}

/// Immutable record of one forwarded request, produced at request end and
/// handed to the access-log pipeline via a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessLog {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub target_host: String,
    pub target_path: String,
    pub status_code: u16,
    pub duration_ms: u64,
    pub request_type: RequestType,
    pub client_ip: String,
    pub user_agent: String,
    pub proxy_info: Option<String>,
    pub request_headers: HashMap<String, String>,
    pub request_body: Option<String>,
    pub response_headers: HashMap<String, String>,
    pub response_body: Option<String>,
    pub request_size: u64,
    pub response_size: u64,
}

impl AccessLog {
    /// Approximate in-memory footprint in bytes, used by the memory-pressure
    /// compaction check in the access-log pipeline.
    pub fn approx_size(&self) -> usize {
        let mut size = std::mem::size_of::<Self>();
        size += self.id.len() + self.method.len() + self.target_host.len() + self.target_path.len();
        size += self.client_ip.len() + self.user_agent.len();
        size += self.proxy_info.as_deref().map(str::len).unwrap_or(0);
        size += self.request_body.as_deref().map(str::len).unwrap_or(0);
        size += self.response_body.as_deref().map(str::len).unwrap_or(0);
        for (k, v) in self.request_headers.iter().chain(self.response_headers.iter()) {
            size += k.len() + v.len();
        }
        size
    }
}

/// Query filter for the access-log pipeline.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogFilter {
    pub domain: Option<String>,
    #[serde(default, deserialize_with = "deserialize_status_codes")]
    pub status_codes: Vec<String>,
    pub from_time: Option<DateTime<Utc>>,
    pub to_time: Option<DateTime<Utc>>,
    pub search: Option<String>,
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_page() -> usize {
    1
}

fn default_limit() -> usize {
    50
}

/// `status_codes` arrives as a single comma-separated query value (e.g.
/// `2xx,404`), not a repeated-key or array-style parameter, so the plain
/// `Vec<String>` derive (which expects a sequence) can't deserialize it.
fn deserialize_status_codes<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(match raw {
        Some(raw) if !raw.is_empty() => raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    })
}

impl LogFilter {
    pub fn normalized(&self) -> (usize, usize) {
        (self.page.max(1), self.limit.clamp(1, 1000))
    }

    /// Expand status-code filter tokens (`2xx`..`5xx`, or literal codes)
    /// into a predicate over a concrete status code.
    pub fn status_matches(&self, status: u16) -> bool {
        if self.status_codes.is_empty() {
            return true;
        }
        self.status_codes.iter().any(|token| match token.as_str() {
            "2xx" => (200..300).contains(&status),
            "3xx" => (300..400).contains(&status),
            "4xx" => (400..500).contains(&status),
            "5xx" => (500..600).contains(&status),
            literal => literal.parse::<u16>().map(|v| v == status).unwrap_or(false),
        })
    }

    pub fn matches(&self, log: &AccessLog) -> bool {
        if !self.status_matches(log.status_code) {
            return false;
        }
        if let Some(domain) = &self.domain {
            let domain_lower = domain.to_ascii_lowercase();
            let host_lower = log.target_host.to_ascii_lowercase();
            let domain_ok = host_lower == domain_lower
                || host_lower.ends_with(&format!(".{domain_lower}"))
                || host_lower.contains(&domain_lower);
            if !domain_ok {
                return false;
            }
        }
        if let Some(from) = self.from_time {
            if log.timestamp < from {
                return false;
            }
        }
        if let Some(to) = self.to_time {
            if log.timestamp > to {
                return false;
            }
        }
        if let Some(search) = &self.search {
            if !search.is_empty() {
                let needle = search.to_ascii_lowercase();
                let mut haystack = format!(
                    "{} {} {} {:?} {} {} {}",
                    log.target_host,
                    log.target_path,
                    log.method,
                    log.request_type,
                    log.user_agent,
                    log.client_ip,
                    log.proxy_info.as_deref().unwrap_or("")
                );
                if log.status_code != 200 {
                    if let Some(body) = &log.response_body {
                        haystack.push(' ');
                        haystack.push_str(body);
                    }
                }
                if let Some(body) = &log.request_body {
                    haystack.push(' ');
                    haystack.push_str(body);
                }
                for (k, v) in log.request_headers.iter().chain(log.response_headers.iter()) {
                    haystack.push(' ');
                    haystack.push_str(k);
                    haystack.push(' ');
                    haystack.push_str(v);
                }
                if !haystack.to_ascii_lowercase().contains(&needle) {
                    return false;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AccessLog {
        AccessLog {
            id: "abc".into(),
            timestamp: Utc::now(),
            method: "GET".into(),
            target_host: "api.example.com".into(),
            target_path: "/get".into(),
            status_code: 200,
            duration_ms: 12,
            request_type: RequestType::Http,
            client_ip: "1.2.3.4".into(),
            user_agent: "curl/8".into(),
            proxy_info: None,
            request_headers: HashMap::new(),
            request_body: None,
            response_headers: HashMap::new(),
            response_body: None,
            request_size: 0,
            response_size: 10,
        }
    }

    #[test]
    fn status_code_tokens_expand() {
        let filter = LogFilter {
            status_codes: vec!["2xx".to_string()],
            ..Default::default()
        };
        assert!(filter.status_matches(200));
        assert!(!filter.status_matches(404));
    }

    #[test]
    fn domain_matches_suffix() {
        let filter = LogFilter {
            domain: Some("example.com".to_string()),
            ..Default::default()
        };
        assert!(filter.matches(&sample()));
    }
}
