//! The accept loop and per-connection state machine. Every accepted TLS
//! connection is handled on its own detached thread and carries exactly
//! one request to exactly one response before the transport is closed.

use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use openssl::ssl::{SslAcceptor, SslStream};

use crate::config::Config;
use crate::gemini::handlers::{FileServer, Handler, Router, TitanHandler};
use crate::gemini::middleware::{AccessControl, CertAuth, Pipeline, RateLimiter};
use crate::gemini::response::{find_crlf, Response};
use crate::gemini::status::Status;
use crate::gemini::tls;
use crate::gemini::{cert, GeminiUrl, Request, Scheme, MAX_REQUEST_BYTES};
use crate::nanoid::nanoid;
use crate::time::now_unix_millis;

const ACCEPT_POLL: Duration = Duration::from_millis(25);
const SWEEP_TICK: Duration = Duration::from_millis(250);

pub struct Server {
    config: Config,
    acceptor: SslAcceptor,
    pipeline: Pipeline,
    router: Router,
    titan: Option<Arc<TitanHandler>>,
    rate_limiter: Option<Arc<RateLimiter>>,
    shutdown: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
}

#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

impl Server {
    /// Wire up the standard middleware chain and handlers from a
    /// validated configuration.
    pub fn new(config: Config) -> Result<Server> {
        config.validate()?;
        let acceptor = tls::create_tls_acceptor(&config.server).context("TLS setup failed")?;

        let mut pipeline = Pipeline::new();
        pipeline.push(Arc::new(
            AccessControl::from_config(&config.access_control).context("Access control setup")?,
        ));
        let rate_limiter = Arc::new(RateLimiter::from_config(&config.rate_limit));
        pipeline.push(rate_limiter.clone());
        if !config.certificate_auth.paths.is_empty() {
            pipeline.push(Arc::new(CertAuth::from_config(&config.certificate_auth)));
        }

        let mut router = Router::new();
        router.mount(
            "/",
            Arc::new(FileServer::new(&config.server).context("Static handler setup")?),
        );

        let titan = if config.titan.enabled {
            Some(Arc::new(
                TitanHandler::new(&config.titan).context("Titan handler setup")?,
            ))
        } else {
            None
        };

        Ok(Server {
            rate_limiter: config.rate_limit.enabled.then(|| rate_limiter.clone()),
            config,
            acceptor,
            pipeline,
            router,
            titan,
            shutdown: Arc::new(AtomicBool::new(false)),
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Mount a handler ahead of the built-in static file server.
    pub fn mount(&mut self, prefix: impl Into<String>, handler: Arc<dyn Handler>) {
        self.router.mount_front(prefix, handler);
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: self.shutdown.clone(),
        }
    }

    pub fn bind(&self) -> Result<TcpListener> {
        let addr = format!("{}:{}", self.config.server.host, self.config.server.port);
        let listener = TcpListener::bind(&addr).with_context(|| format!("TCP bind {}", addr))?;
        listener.set_nonblocking(true)?;
        info!("castor listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    pub fn run(&self) -> Result<()> {
        let listener = self.bind()?;
        self.serve(listener)
    }

    /// Accept until shutdown is requested, then drain in-flight
    /// connections up to the drain timeout.
    pub fn serve(&self, listener: TcpListener) -> Result<()> {
        let sweeper = self.spawn_sweeper();

        while !self.shutdown.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, peer_addr)) => {
                    // the listener is non-blocking; the connection must not be
                    let _ = stream.set_nonblocking(false);
                    self.spawn_connection(stream, peer_addr);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                Err(e) => warn!("Failed to accept connection: {:?}", e),
            }
        }
        drop(listener);

        let deadline = Instant::now() + self.config.server.drain_timeout;
        while self.active.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            thread::sleep(ACCEPT_POLL);
        }
        let leftover = self.active.load(Ordering::SeqCst);
        if leftover > 0 {
            warn!("Shutting down with {} connections still in flight", leftover);
        }
        if let Some(handle) = sweeper {
            let _ = handle.join();
        }
        Ok(())
    }

    fn spawn_connection(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let ctx = ConnContext {
            acceptor: self.acceptor.clone(),
            pipeline: self.pipeline.clone(),
            router: self.router.clone(),
            titan: self.titan.clone(),
            timeout: self.config.server.request_timeout,
            hash_ips: self.config.logging.hash_ips,
        };
        let active = self.active.clone();
        active.fetch_add(1, Ordering::SeqCst);
        thread::spawn(move || {
            if let Err(e) = initiate_connection(&ctx, stream, peer_addr) {
                warn!("Connection handling error: {:#}", e);
            }
            active.fetch_sub(1, Ordering::SeqCst);
        });
    }

    fn spawn_sweeper(&self) -> Option<thread::JoinHandle<()>> {
        let limiter = self.rate_limiter.clone()?;
        let shutdown = self.shutdown.clone();
        let interval = limiter.idle_eviction();
        Some(thread::spawn(move || {
            let mut last_sweep = Instant::now();
            while !shutdown.load(Ordering::SeqCst) {
                thread::sleep(SWEEP_TICK);
                if last_sweep.elapsed() >= interval {
                    let evicted = limiter.evict_idle();
                    if evicted > 0 {
                        debug!("Evicted {} idle rate-limit buckets", evicted);
                    }
                    last_sweep = Instant::now();
                }
            }
        }))
    }
}

struct ConnContext {
    acceptor: SslAcceptor,
    pipeline: Pipeline,
    router: Router,
    titan: Option<Arc<TitanHandler>>,
    timeout: Duration,
    hash_ips: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    AwaitRequest,
    ReadingTitanBody,
    Responding,
    Closed,
}

struct Connection {
    id: String,
    ip: IpAddr,
    label: String,
    stream: SslStream<TcpStream>,
    peer_cert_der: Option<Vec<u8>>,
    state: ConnState,
    deadline: Instant,
}

enum ReadLine {
    Complete { line: Vec<u8>, leftover: Vec<u8> },
    Oversize,
    Eof,
    TimedOut,
}

fn initiate_connection(ctx: &ConnContext, stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
    let started = now_unix_millis();
    let ip = peer_addr.ip();
    let label = display_ip(ip, ctx.hash_ips);

    stream.set_read_timeout(Some(ctx.timeout))?;
    stream.set_write_timeout(Some(ctx.timeout))?;

    let stream = ctx
        .acceptor
        .accept(stream)
        .with_context(|| format!("{} TLS handshake failed", label))?;
    let peer_cert_der = tls::peer_certificate_der(&stream);
    // the request budget starts once the handshake has completed
    let deadline = Instant::now() + ctx.timeout;

    let mut connection = Connection {
        id: nanoid(),
        ip,
        label,
        stream,
        peer_cert_der,
        state: ConnState::AwaitRequest,
        deadline,
    };

    let response = connection.transact(ctx)?;
    let size = connection.send(&response)?;

    connection.log_info(&format!(
        "Reply {} {:?}, {} bytes ({}ms)",
        response.status(),
        response.meta(),
        size,
        now_unix_millis().saturating_sub(started)
    ));
    Ok(())
}

impl Connection {
    fn log_info(&self, message: &str) {
        info!("{} {} {}", self.id, self.label, message);
    }

    /// Drive the request to exactly one response. `Err` means the
    /// transport failed mid-read and nothing can be sent at all.
    fn transact(&mut self, ctx: &ConnContext) -> Result<Response> {
        let (line, leftover) = match self.read_request_line()? {
            ReadLine::Complete { line, leftover } => (line, leftover),
            ReadLine::Oversize => {
                return Ok(Response::new(Status::BadRequest, "Request too large"))
            }
            ReadLine::Eof => {
                return Ok(Response::new(Status::BadRequest, "Request ended unexpectedly"))
            }
            ReadLine::TimedOut => return Ok(Response::new(Status::TemporaryFailure, "Timeout")),
        };

        let url = match GeminiUrl::parse_request_line(&line) {
            Ok(url) => url,
            Err(e) => {
                self.log_info(&format!("Unparsable request: {}", e));
                return Ok(Response::new(Status::BadRequest, e.to_string()));
            }
        };

        self.log_info(&format!(
            "New request {}{}",
            url,
            match &self.peer_cert_der {
                Some(der) => format!(" cert {}", cert::fingerprint(der)),
                None => String::new(),
            }
        ));

        let mut request = Request::new(url, self.ip, self.peer_cert_der.clone());

        if let Some((stage, response)) = ctx.pipeline.run(&request) {
            self.log_info(&format!("Rejected by {} with {}", stage, response.status()));
            return Ok(response);
        }

        match request.url.scheme {
            Scheme::Titan => {
                let Some(titan) = &ctx.titan else {
                    return Ok(Response::new(
                        Status::PermanentFailure,
                        "Titan uploads disabled",
                    ));
                };
                let Some(params) = request.url.titan.clone() else {
                    return Ok(Response::new(Status::BadRequest, "Malformed titan request"));
                };
                if let Err(response) = titan.authorize(&params) {
                    return Ok(response);
                }
                self.state = ConnState::ReadingTitanBody;
                request.body = match self.read_titan_body(leftover, params.size as usize) {
                    Ok(body) => body,
                    Err(response) => return Ok(response),
                };
                let titan = titan.clone();
                Ok(dispatch_guarded(move || titan.handle(&request)))
            }
            Scheme::Gemini => {
                let router = ctx.router.clone();
                Ok(dispatch_guarded(move || router.dispatch(&request)))
            }
        }
    }

    /// Accumulate until the first CRLF. The line must fit in 1024 bytes;
    /// anything already read past the CRLF is handed back for titan.
    fn read_request_line(&mut self) -> Result<ReadLine> {
        let mut buffer: Vec<u8> = Vec::with_capacity(MAX_REQUEST_BYTES);
        let mut chunk = [0u8; 1024];
        loop {
            if let Some(pos) = find_crlf(&buffer) {
                if pos + 2 > MAX_REQUEST_BYTES {
                    return Ok(ReadLine::Oversize);
                }
                let leftover = buffer.split_off(pos + 2);
                return Ok(ReadLine::Complete {
                    line: buffer,
                    leftover,
                });
            }
            if buffer.len() >= MAX_REQUEST_BYTES {
                return Ok(ReadLine::Oversize);
            }
            if Instant::now() >= self.deadline {
                return Ok(ReadLine::TimedOut);
            }
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(ReadLine::Eof),
                Ok(n) => buffer.extend_from_slice(&chunk[..n]),
                Err(e) if is_timeout(&e) => return Ok(ReadLine::TimedOut),
                Err(e) => return Err(e).context("Failed to read request"),
            }
        }
    }

    /// Read exactly `size` body bytes; surplus past the declared size is
    /// never pulled off the wire.
    fn read_titan_body(&mut self, leftover: Vec<u8>, size: usize) -> Result<Vec<u8>, Response> {
        let mut body = leftover;
        body.truncate(size);
        let mut chunk = [0u8; 8192];
        while body.len() < size {
            if Instant::now() >= self.deadline {
                return Err(Response::new(Status::TemporaryFailure, "Timeout"));
            }
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(Response::new(
                        Status::TemporaryFailure,
                        "Upload interrupted",
                    ))
                }
                Ok(n) => {
                    let take = n.min(size - body.len());
                    body.extend_from_slice(&chunk[..take]);
                }
                Err(e) if is_timeout(&e) => {
                    return Err(Response::new(Status::TemporaryFailure, "Timeout"))
                }
                Err(_) => {
                    return Err(Response::new(
                        Status::TemporaryFailure,
                        "Upload interrupted",
                    ))
                }
            }
        }
        Ok(body)
    }

    /// Emit the one and only response, then close the transport.
    fn send(&mut self, response: &Response) -> Result<usize> {
        if self.state == ConnState::Closed {
            return Err(anyhow!("connection already answered"));
        }
        self.state = ConnState::Responding;
        let bytes = response.encode();
        self.stream
            .write_all(&bytes)
            .context("Failed to write response to stream")?;
        self.stream.flush().context("Failed to flush response")?;
        let _ = self.stream.shutdown();
        self.state = ConnState::Closed;
        Ok(bytes.len())
    }
}

/// A panicking handler must not take the connection thread down without
/// an answer on the wire.
fn dispatch_guarded(dispatch: impl FnOnce() -> Response) -> Response {
    match catch_unwind(AssertUnwindSafe(dispatch)) {
        Ok(response) => response,
        Err(_) => Response::new(Status::TemporaryFailure, "Internal error"),
    }
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

fn display_ip(ip: IpAddr, hash: bool) -> String {
    if hash {
        let digest = openssl::sha::sha256(ip.to_string().as_bytes());
        format!("ip:{}", hex::encode(&digest[..6]))
    } else {
        ip.to_string()
    }
}
