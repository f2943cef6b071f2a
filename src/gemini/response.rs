//! Response line encoding and decoding. The wire format is
//! `<status> <meta>\r\n` followed by a body for success statuses only.

use crate::error::GeminiError;
use crate::gemini::status::{self, Status};

/// Meta must fit in 1024 bytes; with two status digits, one space and
/// CRLF the whole header tops out at 1029 bytes.
pub const MAX_META_BYTES: usize = 1024;
pub const MAX_HEADER_BYTES: usize = 1029;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    status: u8,
    meta: String,
    body: Vec<u8>,
}

impl Response {
    /// Build a body-less response. Meta is sanitized so a response
    /// constructed from internal strings can always be emitted.
    pub fn new(status: Status, meta: impl Into<String>) -> Response {
        Response {
            status: status.code(),
            meta: sanitize_meta(meta.into()),
            body: Vec::new(),
        }
    }

    pub fn success(meta: impl Into<String>, body: Vec<u8>) -> Response {
        Response {
            status: Status::Success.code(),
            meta: sanitize_meta(meta.into()),
            body,
        }
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    pub fn meta(&self) -> &str {
        &self.meta
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn is_success(&self) -> bool {
        status::is_success(self.status)
    }

    /// Serialize for the wire. The body rides along only on success.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = format!("{} {}\r\n", self.status, self.meta).into_bytes();
        if self.is_success() {
            out.extend_from_slice(&self.body);
        }
        out
    }
}

fn sanitize_meta(meta: String) -> String {
    let mut meta: String = meta.chars().filter(|c| *c != '\r' && *c != '\n').collect();
    while meta.len() > MAX_META_BYTES {
        meta.pop();
    }
    meta
}

/// Strict encoder: rejects out-of-range statuses, oversized or
/// CR/LF-bearing meta, and bodies on non-success statuses.
pub fn encode_response(
    status: u8,
    meta: &str,
    body: Option<&[u8]>,
) -> Result<Vec<u8>, GeminiError> {
    if !status::is_valid_code(status) {
        return Err(GeminiError::InvalidStatus(status));
    }
    if meta.len() > MAX_META_BYTES {
        return Err(GeminiError::InvalidMeta(format!(
            "meta is {} bytes, limit is {}",
            meta.len(),
            MAX_META_BYTES
        )));
    }
    if meta.contains('\r') || meta.contains('\n') {
        return Err(GeminiError::InvalidMeta("meta contains CR or LF".into()));
    }
    if body.is_some_and(|b| !b.is_empty()) && !status::is_success(status) {
        return Err(GeminiError::UnexpectedBody(status));
    }
    let mut out = format!("{} {}\r\n", status, meta).into_bytes();
    if let Some(body) = body {
        out.extend_from_slice(body);
    }
    Ok(out)
}

/// Split a raw response into `(status, meta, body)`. The header must be
/// CRLF-terminated within the first 1029 bytes.
pub fn parse_response_header(input: &[u8]) -> Result<(u8, String, &[u8]), GeminiError> {
    let window = &input[..input.len().min(MAX_HEADER_BYTES)];
    let crlf = find_crlf(window).ok_or_else(|| {
        if input.len() >= MAX_HEADER_BYTES {
            GeminiError::OversizeHeader
        } else {
            GeminiError::MalformedResponse("header is not CRLF-terminated".into())
        }
    })?;

    let line = std::str::from_utf8(&window[..crlf])
        .map_err(|_| GeminiError::MalformedResponse("header is not UTF-8".into()))?;
    if line.len() < 2 {
        return Err(GeminiError::MalformedResponse("header too short".into()));
    }
    let status: u8 = line[..2]
        .parse()
        .map_err(|_| GeminiError::MalformedResponse(format!("bad status in {:?}", line)))?;
    if !status::is_valid_code(status) {
        return Err(GeminiError::MalformedResponse(format!(
            "status {} outside 10..=69",
            status
        )));
    }
    let meta = match line.as_bytes().get(2) {
        None => String::new(),
        Some(b' ') => line[3..].to_string(),
        Some(_) => {
            return Err(GeminiError::MalformedResponse(
                "missing space after status".into(),
            ))
        }
    };
    Ok((status, meta, &input[crlf + 2..]))
}

pub(crate) fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_success_with_body() {
        let bytes = encode_response(20, "text/gemini", Some(b"# Hi\n")).unwrap();
        assert_eq!(bytes, b"20 text/gemini\r\n# Hi\n");
    }

    #[test]
    fn rejects_body_on_error_status() {
        assert!(matches!(
            encode_response(51, "Not found", Some(b"nope")),
            Err(GeminiError::UnexpectedBody(51))
        ));
    }

    #[test]
    fn rejects_status_outside_range() {
        assert!(encode_response(9, "x", None).is_err());
        assert!(encode_response(70, "x", None).is_err());
    }

    #[test]
    fn rejects_meta_with_crlf() {
        assert!(encode_response(20, "text/gemini\r\nsneaky", None).is_err());
    }

    #[test]
    fn rejects_oversized_meta() {
        let meta = "x".repeat(MAX_META_BYTES + 1);
        assert!(encode_response(20, &meta, None).is_err());
    }

    #[test]
    fn meta_at_limit_is_accepted() {
        let meta = "x".repeat(MAX_META_BYTES);
        let bytes = encode_response(20, &meta, None).unwrap();
        assert_eq!(bytes.len(), MAX_HEADER_BYTES);
    }

    #[test]
    fn parse_splits_header_and_body() {
        let (status, meta, body) = parse_response_header(b"20 text/gemini\r\nhello").unwrap();
        assert_eq!(status, 20);
        assert_eq!(meta, "text/gemini");
        assert_eq!(body, b"hello");
    }

    #[test]
    fn parse_accepts_empty_meta() {
        let (status, meta, body) = parse_response_header(b"51\r\n").unwrap();
        assert_eq!(status, 51);
        assert_eq!(meta, "");
        assert!(body.is_empty());
    }

    #[test]
    fn parse_rejects_unterminated_header() {
        assert!(parse_response_header(b"20 text/gemini").is_err());
    }

    #[test]
    fn parse_rejects_oversize_header() {
        let mut raw = Vec::new();
        raw.extend_from_slice(b"20 ");
        raw.extend_from_slice(&vec![b'x'; MAX_HEADER_BYTES]);
        raw.extend_from_slice(b"\r\n");
        assert!(matches!(
            parse_response_header(&raw),
            Err(GeminiError::OversizeHeader)
        ));
    }

    #[test]
    fn encode_then_parse_round_trips() {
        let encoded = encode_response(31, "gemini://example.org/new", None).unwrap();
        let (status, meta, body) = parse_response_header(&encoded).unwrap();
        assert_eq!(status, 31);
        assert_eq!(meta, "gemini://example.org/new");
        assert!(body.is_empty());
        assert_eq!(encode_response(status, &meta, None).unwrap(), encoded);
    }

    #[test]
    fn response_encode_drops_body_for_errors() {
        let mut resp = Response::new(Status::NotFound, "Not found");
        resp.body = b"secret".to_vec();
        assert_eq!(resp.encode(), b"51 Not found\r\n");
    }

    #[test]
    fn sanitize_strips_newlines() {
        let resp = Response::new(Status::TemporaryFailure, "a\r\nb");
        assert_eq!(resp.meta(), "ab");
    }
}
