//! Header classifier (C1): case-insensitive substring matching used to
//! decide which inbound headers are stripped before forwarding upstream.

/// CORS response headers the gateway owns; these are never copied back from
/// an upstream response regardless of the sensitive-header list.
pub const CORS_RESPONSE_HEADERS: &[&str] = &[
    "access-control-allow-origin",
    "access-control-allow-methods",
    "access-control-allow-headers",
    "access-control-expose-headers",
    "access-control-max-age",
    "access-control-allow-credentials",
];

/// Returns true iff `name`, lower-cased, contains any entry of `list` as a
/// substring. First match wins; the choice has no semantic effect since this
/// is purely a boolean classification.
pub fn is_sensitive(name: &str, list: &[String]) -> bool {
    let lowered = name.to_ascii_lowercase();
    list.iter().any(|needle| lowered.contains(needle.as_str()))
}

pub fn is_cors_response_header(name: &str) -> bool {
    let lowered = name.to_ascii_lowercase();
    CORS_RESPONSE_HEADERS.contains(&lowered.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_list() -> Vec<String> {
        vec![
            "cf-".into(),
            "x-forwarded".into(),
            "proxy".into(),
            "via".into(),
            "x-request-id".into(),
        ]
    }

    #[test]
    fn matches_case_insensitively() {
        assert!(is_sensitive("CF-Ray", &default_list()));
        assert!(is_sensitive("X-Forwarded-For", &default_list()));
    }

    #[test]
    fn substring_not_prefix() {
        assert!(is_sensitive("x-custom-proxy-info", &default_list()));
    }

    #[test]
    fn unrelated_header_is_not_sensitive() {
        assert!(!is_sensitive("x-custom", &default_list()));
        assert!(!is_sensitive("content-type", &default_list()));
    }

    #[test]
    fn cors_headers_are_recognized() {
        assert!(is_cors_response_header("Access-Control-Allow-Origin"));
        assert!(!is_cors_response_header("content-type"));
    }

    proptest::proptest! {
        #[test]
        fn prop_never_panics(name in "[-a-zA-Z0-9]{0,40}") {
            let _ = is_sensitive(&name, &default_list());
        }
    }
}
