//! Single-shot Gemini client: dial TLS, settle trust against the TOFU
//! store before a single request byte is written, send the URL, read the
//! response, optionally chase redirects. Titan uploads reuse the same
//! connection flow with a body after the request line.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};

use log::{debug, info, warn};
use openssl::ssl::SslConnector;

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::gemini::response::{parse_response_header, MAX_HEADER_BYTES};
use crate::gemini::tofu::{TofuStore, TofuVerdict};
use crate::gemini::{cert, status, tls, GeminiUrl, Scheme, TitanParams, MAX_REQUEST_BYTES};

#[derive(Debug)]
pub struct ClientResponse {
    pub status: u8,
    pub meta: String,
    pub body: Vec<u8>,
    /// The URL that actually produced this response, after redirects.
    pub url: String,
}

impl ClientResponse {
    pub fn is_success(&self) -> bool {
        status::is_success(self.status)
    }

    pub fn is_redirect(&self) -> bool {
        status::is_redirect(self.status)
    }
}

pub struct Client {
    config: ClientConfig,
    connector: SslConnector,
    tofu: TofuStore,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Client, ClientError> {
        let tofu = match &config.tofu_path {
            Some(path) => TofuStore::open(path)?,
            None => TofuStore::in_memory(),
        };
        Self::with_store(config, tofu)
    }

    pub fn with_store(config: ClientConfig, tofu: TofuStore) -> Result<Client, ClientError> {
        let connector =
            tls::create_tls_connector(config.certfile.as_deref(), config.keyfile.as_deref())
                .map_err(|e| ClientError::Handshake(format!("TLS setup failed: {:#}", e)))?;
        Ok(Client {
            config,
            connector,
            tofu,
        })
    }

    pub fn tofu_store(&self) -> &TofuStore {
        &self.tofu
    }

    /// Fetch a gemini URL, following up to `max_redirects` redirects.
    pub fn get(&self, url: &str) -> Result<ClientResponse, ClientError> {
        let mut current = GeminiUrl::parse(url).map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
        if current.scheme != Scheme::Gemini {
            return Err(ClientError::InvalidUrl(
                "only gemini:// URLs can be fetched".into(),
            ));
        }

        let mut visited = vec![current.to_string()];
        let mut redirects = 0;
        loop {
            let response = self.fetch_once(&current, None)?;
            if !response.is_redirect() || !self.config.follow_redirects {
                return Ok(response);
            }

            redirects += 1;
            if redirects > self.config.max_redirects {
                return Err(ClientError::TooManyRedirects(self.config.max_redirects));
            }
            let target = response.meta.clone();
            if let Some((scheme, _)) = target.split_once("://") {
                if !scheme.eq_ignore_ascii_case("gemini") {
                    return Err(ClientError::NonGeminiRedirect(target));
                }
            }
            let next = current
                .resolve_reference(&target)
                .map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
            if next.scheme != Scheme::Gemini {
                return Err(ClientError::NonGeminiRedirect(target));
            }
            let rendered = next.to_string();
            if visited.contains(&rendered) {
                return Err(ClientError::RedirectLoop(rendered));
            }
            info!("Redirect {} -> {}", current, rendered);
            visited.push(rendered);
            current = next;
        }
    }

    /// Upload `body` via titan. A gemini URL is rewritten to titan.
    pub fn upload(
        &self,
        url: &str,
        body: &[u8],
        mime: &str,
        token: Option<&str>,
    ) -> Result<ClientResponse, ClientError> {
        let target = build_titan_url(url, body.len() as u64, mime, token)?;
        self.fetch_once(&target, Some(body))
    }

    /// A zero-byte upload, which the server treats as a delete.
    pub fn delete(&self, url: &str, token: Option<&str>) -> Result<ClientResponse, ClientError> {
        self.upload(url, &[], "text/gemini", token)
    }

    fn fetch_once(
        &self,
        url: &GeminiUrl,
        body: Option<&[u8]>,
    ) -> Result<ClientResponse, ClientError> {
        let request_line = format!("{}\r\n", url);
        if request_line.len() > MAX_REQUEST_BYTES {
            return Err(ClientError::InvalidUrl(
                "request line exceeds 1024 bytes".into(),
            ));
        }

        let mut stream = self.connect(url)?;

        let der = tls::peer_certificate_der(&stream)
            .ok_or_else(|| ClientError::Handshake("server presented no certificate".into()))?;
        self.settle_trust(url, &der)?;

        stream.write_all(request_line.as_bytes())?;
        if let Some(body) = body {
            stream.write_all(body)?;
        }
        stream.flush()?;
        debug!("Sent {}", url);

        let raw = self.read_response(&mut stream)?;
        let (status, meta, rest) = parse_response_header(&raw)?;
        if rest.len() as u64 > self.config.max_response_size {
            return Err(ClientError::ResponseTooLarge(self.config.max_response_size));
        }
        Ok(ClientResponse {
            status,
            meta,
            body: rest.to_vec(),
            url: url.to_string(),
        })
    }

    fn connect(&self, url: &GeminiUrl) -> Result<openssl::ssl::SslStream<TcpStream>, ClientError> {
        let addr = (url.host.as_str(), url.port)
            .to_socket_addrs()
            .map_err(|e| ClientError::Connect(format!("{}:{}: {}", url.host, url.port, e)))?
            .next()
            .ok_or_else(|| {
                ClientError::Connect(format!("no address found for {}", url.host))
            })?;
        let tcp = TcpStream::connect_timeout(&addr, self.config.timeout)
            .map_err(|e| ClientError::Connect(format!("{}: {}", addr, e)))?;
        tcp.set_read_timeout(Some(self.config.timeout))?;
        tcp.set_write_timeout(Some(self.config.timeout))?;

        let mut configuration = self
            .connector
            .configure()
            .map_err(|e| ClientError::Handshake(e.to_string()))?;
        // hostname checks are replaced by the TOFU fingerprint pin
        configuration.set_verify_hostname(false);
        configuration.set_use_server_name_indication(true);
        configuration
            .connect(&url.host, tcp)
            .map_err(|e| ClientError::Handshake(e.to_string()))
    }

    /// Enforce certificate continuity. A changed fingerprint aborts
    /// before the request line leaks anything to the impostor.
    fn settle_trust(&self, url: &GeminiUrl, der: &[u8]) -> Result<(), ClientError> {
        match self.tofu.verify(&url.host, url.port, der)? {
            TofuVerdict::Match => Ok(()),
            TofuVerdict::FirstUse => {
                if self.config.trust_on_first_use {
                    info!(
                        "Trusting {}:{} on first use ({})",
                        url.host,
                        url.port,
                        cert::fingerprint(der)
                    );
                    self.tofu.trust(&url.host, url.port, der)?;
                    Ok(())
                } else {
                    Err(ClientError::UntrustedHost {
                        host: url.host.clone(),
                        port: url.port,
                        fingerprint: cert::fingerprint(der),
                    })
                }
            }
            TofuVerdict::Changed {
                old_fingerprint,
                new_fingerprint,
            } => Err(ClientError::CertificateChanged {
                host: url.host.clone(),
                port: url.port,
                old_fingerprint,
                new_fingerprint,
            }),
        }
    }

    /// Read until the server closes. Some servers skip the TLS
    /// close-notify; a truncation error after a complete header is
    /// treated as end of body.
    fn read_response(
        &self,
        stream: &mut openssl::ssl::SslStream<TcpStream>,
    ) -> Result<Vec<u8>, ClientError> {
        let limit = self.config.max_response_size + MAX_HEADER_BYTES as u64;
        let mut raw = Vec::new();
        let mut chunk = [0u8; 16384];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    raw.extend_from_slice(&chunk[..n]);
                    if raw.len() as u64 > limit {
                        return Err(ClientError::ResponseTooLarge(self.config.max_response_size));
                    }
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Err(ClientError::Timeout(self.config.timeout))
                }
                Err(e) => {
                    if parse_response_header(&raw).is_ok() {
                        warn!("Response truncated without close-notify: {}", e);
                        break;
                    }
                    return Err(ClientError::Io(e));
                }
            }
        }
        Ok(raw)
    }
}

fn build_titan_url(
    url: &str,
    size: u64,
    mime: &str,
    token: Option<&str>,
) -> Result<GeminiUrl, ClientError> {
    let parsed = GeminiUrl::parse(url).map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
    Ok(GeminiUrl {
        scheme: Scheme::Titan,
        titan: Some(TitanParams {
            size,
            mime: mime.to_string(),
            token: token.map(str::to_string),
        }),
        ..parsed
    })
}
