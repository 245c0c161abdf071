//! Body-capture heuristics for the access-log pipeline: decides whether a
//! request/response body is worth recording and how to render it as text.
//!
//! Grounded on the reference request monitor's content-type sniffing, which
//! inspects magic bytes and declared content-type rather than trusting the
//! content-type header alone.

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Renders a captured body as a string for storage, or `None` if it should
/// not be recorded at all (binary, oversized, or a non-error 200 response
/// when `record_200` is disabled).
pub fn classify_body(
    bytes: &[u8],
    content_type: Option<&str>,
    status_code: u16,
    record_200: bool,
    max_body_size: usize,
) -> Option<String> {
    if status_code == 200 && !record_200 {
        return None;
    }
    if bytes.is_empty() {
        return None;
    }

    let truncated = bytes.len() > max_body_size;
    let slice = if truncated { &bytes[..max_body_size] } else { bytes };

    if slice.starts_with(&GZIP_MAGIC) {
        return Some("<gzip-compressed body omitted>".to_string());
    }
    if is_binary(slice) {
        return Some(format!("<binary body omitted: {} bytes>", bytes.len()));
    }

    let text = String::from_utf8_lossy(slice).into_owned();
    let mut rendered = match content_type.map(|ct| ct.to_ascii_lowercase()) {
        Some(ct) if ct.contains("application/json") => pretty_json(&text),
        Some(ct) if ct.contains("text/html") || ct.contains("application/xml") || ct.contains("text/xml") => text,
        _ => {
            if looks_like_json(&text) {
                pretty_json(&text)
            } else {
                text
            }
        }
    };
    if truncated {
        rendered.push_str("\n…[truncated]");
    }
    Some(rendered)
}

fn pretty_json(text: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(value) => serde_json::to_string_pretty(&value).unwrap_or_else(|_| text.to_string()),
        Err(_) => text.to_string(),
    }
}

fn looks_like_json(text: &str) -> bool {
    let trimmed = text.trim_start();
    trimmed.starts_with('{') || trimmed.starts_with('[')
}

/// A body is treated as binary if it contains NUL bytes or more than a
/// small fraction of non-printable, non-whitespace control characters.
fn is_binary(bytes: &[u8]) -> bool {
    if bytes.contains(&0) {
        return true;
    }
    let sample_len = bytes.len().min(512);
    let sample = &bytes[..sample_len];
    let suspicious = sample
        .iter()
        .filter(|&&b| b < 0x09 || (b > 0x0d && b < 0x20))
        .count();
    (suspicious as f64) / (sample_len as f64) > 0.1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_200_unless_record_200_enabled() {
        assert_eq!(classify_body(b"hello", None, 200, false, 1024), None);
        assert!(classify_body(b"hello", None, 200, true, 1024).is_some());
    }

    #[test]
    fn detects_gzip_magic_bytes() {
        let body = [0x1f, 0x8b, 0x08, 0x00];
        let rendered = classify_body(&body, None, 500, false, 1024).unwrap();
        assert!(rendered.contains("gzip"));
    }

    #[test]
    fn detects_binary_payload() {
        let body: Vec<u8> = (0..64u8).collect();
        let rendered = classify_body(&body, None, 500, false, 1024).unwrap();
        assert!(rendered.contains("binary"));
    }

    #[test]
    fn pretty_prints_json_body() {
        let body = br#"{"a":1}"#;
        let rendered = classify_body(body, Some("application/json"), 500, false, 1024).unwrap();
        assert!(rendered.contains('\n'));
    }

    #[test]
    fn oversized_body_is_truncated_not_omitted() {
        let body = vec![b'x'; 100];
        let rendered = classify_body(&body, Some("text/plain"), 500, false, 10).unwrap();
        assert!(rendered.contains("truncated"));
        assert!(rendered.starts_with(&"x".repeat(10)));
    }
}
