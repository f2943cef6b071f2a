use std::fmt;
use std::net::IpAddr;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use url::{Host, Url};

use crate::config::DEFAULT_PORT;
use crate::error::GeminiError;

pub mod cert;
pub mod client;
pub mod gemtext;
pub mod handlers;
pub mod middleware;
pub mod response;
pub mod server;
pub mod status;
pub mod tls;
pub mod tofu;

/// A request line may not exceed 1024 bytes, CRLF included.
pub const MAX_REQUEST_BYTES: usize = 1024;

/// Characters percent-encoded when a decoded path is rendered back into
/// a URL. `%` itself is included so rendering round-trips.
const PATH_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'%')
    .add(b';');

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Gemini,
    Titan,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Gemini => "gemini",
            Scheme::Titan => "titan",
        }
    }
}

/// Upload parameters carried in the path of a titan request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitanParams {
    pub size: u64,
    pub mime: String,
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeminiUrl {
    pub scheme: Scheme,
    /// Lowercased, IDN-normalized, without IPv6 brackets.
    pub host: String,
    pub port: u16,
    /// Absolute, percent-decoded, canonicalized. Always starts with `/`.
    pub path: String,
    /// Raw query, still percent-encoded.
    pub query: Option<String>,
    pub titan: Option<TitanParams>,
}

impl GeminiUrl {
    /// Parse and validate a full request line, CRLF included.
    pub fn parse_request_line(line: &[u8]) -> Result<GeminiUrl, GeminiError> {
        if line.len() > MAX_REQUEST_BYTES {
            return Err(GeminiError::RequestTooLarge);
        }
        let stripped = line
            .strip_suffix(b"\r\n")
            .ok_or_else(|| GeminiError::BadRequest("Request line must end in CRLF".into()))?;
        let text = std::str::from_utf8(stripped).map_err(|_| GeminiError::InvalidUtf8)?;
        Self::parse(text)
    }

    /// Parse an absolute gemini or titan URL.
    pub fn parse(input: &str) -> Result<GeminiUrl, GeminiError> {
        let parsed = Url::parse(input)
            .map_err(|e| GeminiError::BadRequest(format!("Invalid URL: {}", e)))?;

        let scheme = match parsed.scheme() {
            "gemini" => Scheme::Gemini,
            "titan" => Scheme::Titan,
            other => {
                return Err(GeminiError::BadRequest(format!(
                    "Unsupported URL scheme {:?}",
                    other
                )))
            }
        };

        if !parsed.username().is_empty() || parsed.password().is_some() {
            return Err(GeminiError::BadRequest("URL contains userinfo".into()));
        }
        if parsed.fragment().is_some() {
            return Err(GeminiError::BadRequest("URL contains a fragment".into()));
        }

        let raw_host = match parsed.host_str() {
            Some(h) if !h.is_empty() => h,
            _ => return Err(GeminiError::BadRequest("URL must have a host".into())),
        };
        let host = normalize_host(raw_host)?;

        let port = parsed.port().unwrap_or(DEFAULT_PORT);
        if port == 0 {
            return Err(GeminiError::BadRequest("Port must be in 1..=65535".into()));
        }

        let raw_path = parsed.path();
        let (raw_path, titan) = match scheme {
            Scheme::Titan => {
                let (path_part, params_part) = match raw_path.split_once(';') {
                    Some((p, rest)) => (p, rest),
                    None => {
                        return Err(GeminiError::BadRequest(
                            "Titan URL is missing the size parameter".into(),
                        ))
                    }
                };
                (path_part, Some(parse_titan_params(params_part)?))
            }
            Scheme::Gemini => (raw_path, None),
        };

        let path = canonicalize_path(&decode_path(raw_path)?);

        Ok(GeminiUrl {
            scheme,
            host,
            port,
            path,
            query: parsed.query().map(str::to_string),
            titan,
        })
    }

    /// Resolve a redirect target against this URL. Absolute targets are
    /// parsed as-is, relative ones joined onto the current location.
    pub fn resolve_reference(&self, reference: &str) -> Result<GeminiUrl, GeminiError> {
        if reference.contains("://") {
            return Self::parse(reference);
        }
        let base = Url::parse(&self.to_string())
            .map_err(|e| GeminiError::BadRequest(format!("Invalid URL: {}", e)))?;
        let joined = base
            .join(reference)
            .map_err(|e| GeminiError::BadRequest(format!("Invalid redirect target: {}", e)))?;
        Self::parse(joined.as_str())
    }
}

impl fmt::Display for GeminiUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.scheme.as_str())?;
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            f.write_str(&self.host)?;
        }
        write!(
            f,
            ":{}{}",
            self.port,
            utf8_percent_encode(&self.path, PATH_ENCODE_SET)
        )?;
        if let Some(params) = &self.titan {
            write!(f, ";size={}", params.size)?;
            write!(
                f,
                ";mime={}",
                utf8_percent_encode(&params.mime, PATH_ENCODE_SET)
            )?;
            if let Some(token) = &params.token {
                write!(f, ";token={}", utf8_percent_encode(token, PATH_ENCODE_SET))?;
            }
        }
        if let Some(query) = &self.query {
            write!(f, "?{}", query)?;
        }
        Ok(())
    }
}

fn normalize_host(raw: &str) -> Result<String, GeminiError> {
    let lowered = raw.to_lowercase();
    match Host::parse(&lowered) {
        Ok(Host::Domain(domain)) => Ok(domain),
        Ok(Host::Ipv4(addr)) => Ok(addr.to_string()),
        Ok(Host::Ipv6(addr)) => Ok(addr.to_string()),
        Err(e) => Err(GeminiError::BadRequest(format!("Invalid host: {}", e))),
    }
}

fn decode_path(raw: &str) -> Result<String, GeminiError> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|cow| cow.into_owned())
        .map_err(|_| GeminiError::BadRequest("Path is not valid UTF-8".into()))
}

/// Resolve `.` and `..` segments. A `..` that would climb past the root
/// clamps at `/`; the result always begins with `/`. A trailing slash is
/// preserved so directory URLs keep their shape.
fn canonicalize_path(decoded: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    let mut path = String::from("/");
    path.push_str(&segments.join("/"));
    if path != "/" && (decoded.ends_with('/') || decoded.ends_with("/.") || decoded.ends_with("/.."))
    {
        path.push('/');
    }
    path
}

fn parse_titan_params(raw: &str) -> Result<TitanParams, GeminiError> {
    let mut size: Option<u64> = None;
    let mut mime: Option<String> = None;
    let mut token: Option<String> = None;

    for piece in raw.split(';') {
        let (key, value) = piece
            .split_once('=')
            .ok_or_else(|| GeminiError::BadRequest(format!("Malformed parameter {:?}", piece)))?;
        let value = percent_decode_str(value)
            .decode_utf8()
            .map_err(|_| GeminiError::BadRequest("Parameter is not valid UTF-8".into()))?;
        match key {
            "size" => {
                let parsed: i64 = value.parse().map_err(|_| {
                    GeminiError::BadRequest(format!("Invalid size {:?}", value))
                })?;
                if parsed < 0 {
                    return Err(GeminiError::BadRequest("Size must not be negative".into()));
                }
                size = Some(parsed as u64);
            }
            "mime" => mime = Some(value.into_owned()),
            "token" => token = Some(value.into_owned()),
            _ => {}
        }
    }

    Ok(TitanParams {
        size: size
            .ok_or_else(|| GeminiError::BadRequest("Titan URL is missing the size parameter".into()))?,
        mime: mime.unwrap_or_else(|| "text/gemini".to_string()),
        token,
    })
}

/// A parsed request plus everything the connection knows about the peer.
/// The body is only populated for titan uploads, after the middleware
/// chain has accepted the request.
#[derive(Debug, Clone)]
pub struct Request {
    pub url: GeminiUrl,
    pub peer_ip: IpAddr,
    pub peer_cert_der: Option<Vec<u8>>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(url: GeminiUrl, peer_ip: IpAddr, peer_cert_der: Option<Vec<u8>>) -> Request {
        Request {
            url,
            peer_ip,
            peer_cert_der,
            body: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_plain_request() {
        let url = GeminiUrl::parse("gemini://example.org/docs/page.gmi").unwrap();
        assert_eq!(url.scheme, Scheme::Gemini);
        assert_eq!(url.host, "example.org");
        assert_eq!(url.port, DEFAULT_PORT);
        assert_eq!(url.path, "/docs/page.gmi");
        assert!(url.query.is_none());
        assert!(url.titan.is_none());
    }

    #[test]
    fn empty_path_becomes_root() {
        let url = GeminiUrl::parse("gemini://example.org").unwrap();
        assert_eq!(url.path, "/");
    }

    #[test]
    fn host_is_lowercased() {
        let url = GeminiUrl::parse("gemini://Example.ORG/").unwrap();
        assert_eq!(url.host, "example.org");
    }

    #[test]
    fn scheme_is_case_insensitive() {
        let url = GeminiUrl::parse("GEMINI://example.org/").unwrap();
        assert_eq!(url.scheme, Scheme::Gemini);
    }

    #[test]
    fn explicit_port_is_kept() {
        let url = GeminiUrl::parse("gemini://example.org:1966/").unwrap();
        assert_eq!(url.port, 1966);
    }

    #[test]
    fn port_zero_is_rejected() {
        assert!(GeminiUrl::parse("gemini://example.org:0/").is_err());
    }

    #[test]
    fn userinfo_is_rejected() {
        assert!(GeminiUrl::parse("gemini://user@example.org/").is_err());
        assert!(GeminiUrl::parse("gemini://user:pw@example.org/").is_err());
    }

    #[test]
    fn fragment_is_rejected() {
        assert!(GeminiUrl::parse("gemini://example.org/page#frag").is_err());
    }

    #[test]
    fn foreign_scheme_is_rejected() {
        assert!(GeminiUrl::parse("https://example.org/").is_err());
    }

    #[test]
    fn percent_encoding_is_decoded_before_canonicalization() {
        let url = GeminiUrl::parse("gemini://example.org/a%20dir/file%2Ename").unwrap();
        assert_eq!(url.path, "/a dir/file.name");
    }

    #[test]
    fn dotdot_clamps_at_root() {
        let url = GeminiUrl::parse("gemini://example.org/../../etc/passwd").unwrap();
        assert_eq!(url.path, "/etc/passwd");
        let url = GeminiUrl::parse("gemini://example.org/a/b/../c/./d/..").unwrap();
        assert_eq!(url.path, "/a/c/");
    }

    #[test]
    fn trailing_slash_is_preserved() {
        let url = GeminiUrl::parse("gemini://example.org/dir/").unwrap();
        assert_eq!(url.path, "/dir/");
    }

    #[test]
    fn query_is_kept_raw() {
        let url = GeminiUrl::parse("gemini://example.org/search?term%20one").unwrap();
        assert_eq!(url.query.as_deref(), Some("term%20one"));
    }

    #[test]
    fn request_line_limits_are_enforced() {
        let mut line = format!("gemini://example.org/{}", "a".repeat(1200)).into_bytes();
        line.extend_from_slice(b"\r\n");
        assert!(matches!(
            GeminiUrl::parse_request_line(&line),
            Err(GeminiError::RequestTooLarge)
        ));

        assert!(GeminiUrl::parse_request_line(b"gemini://example.org/\n").is_err());
        assert!(GeminiUrl::parse_request_line(b"gemini://example.org/\r\n").is_ok());
    }

    #[test]
    fn request_line_of_exactly_1024_bytes_parses() {
        let mut line = format!(
            "gemini://example.org/{}",
            "a".repeat(MAX_REQUEST_BYTES - "gemini://example.org/".len() - 2)
        )
        .into_bytes();
        line.extend_from_slice(b"\r\n");
        assert_eq!(line.len(), MAX_REQUEST_BYTES);
        assert!(GeminiUrl::parse_request_line(&line).is_ok());
    }

    #[test]
    fn titan_params_are_extracted() {
        let url =
            GeminiUrl::parse("titan://example.org/notes/a.gmi;size=5;mime=text/gemini;token=T")
                .unwrap();
        assert_eq!(url.scheme, Scheme::Titan);
        assert_eq!(url.path, "/notes/a.gmi");
        let params = url.titan.unwrap();
        assert_eq!(params.size, 5);
        assert_eq!(params.mime, "text/gemini");
        assert_eq!(params.token.as_deref(), Some("T"));
    }

    #[test]
    fn titan_mime_defaults_to_gemtext() {
        let url = GeminiUrl::parse("titan://example.org/a;size=0").unwrap();
        let params = url.titan.unwrap();
        assert_eq!(params.mime, "text/gemini");
        assert!(params.token.is_none());
    }

    #[test]
    fn titan_without_size_is_rejected() {
        assert!(GeminiUrl::parse("titan://example.org/a").is_err());
        assert!(GeminiUrl::parse("titan://example.org/a;mime=text/plain").is_err());
    }

    #[test]
    fn titan_negative_size_is_rejected() {
        assert!(GeminiUrl::parse("titan://example.org/a;size=-1").is_err());
    }

    #[test]
    fn display_renders_an_absolute_url() {
        let url = GeminiUrl::parse("gemini://example.org/a%20dir/page.gmi").unwrap();
        assert_eq!(
            url.to_string(),
            "gemini://example.org:1965/a%20dir/page.gmi"
        );
    }

    #[test]
    fn display_round_trips_titan() {
        let rendered =
            GeminiUrl::parse("titan://example.org/notes/a.gmi;size=5;mime=text/gemini;token=T")
                .unwrap()
                .to_string();
        let reparsed = GeminiUrl::parse(&rendered).unwrap();
        assert_eq!(reparsed.path, "/notes/a.gmi");
        assert_eq!(reparsed.titan.unwrap().size, 5);
    }

    #[test]
    fn ipv6_hosts_keep_brackets_in_display() {
        let url = GeminiUrl::parse("gemini://[::1]/").unwrap();
        assert_eq!(url.host, "::1");
        assert_eq!(url.to_string(), "gemini://[::1]:1965/");
    }

    #[test]
    fn resolves_relative_redirects() {
        let base = GeminiUrl::parse("gemini://example.org/dir/page.gmi").unwrap();
        let next = base.resolve_reference("other.gmi").unwrap();
        assert_eq!(next.path, "/dir/other.gmi");
        let next = base.resolve_reference("/top.gmi").unwrap();
        assert_eq!(next.path, "/top.gmi");
        let next = base.resolve_reference("gemini://other.net/x").unwrap();
        assert_eq!(next.host, "other.net");
    }
}
