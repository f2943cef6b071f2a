//! Full-stack tests: a real listener, real TLS handshakes, and the
//! shipped client talking to the shipped server.

use std::fs;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tempfile::TempDir;

use castor::config::{ClientConfig, Config, PathRuleConfig};
use castor::error::ClientError;
use castor::gemini::cert;
use castor::gemini::client::Client;
use castor::gemini::handlers::Handler;
use castor::gemini::response::Response;
use castor::gemini::server::{Server, ShutdownHandle};
use castor::gemini::status::Status;
use castor::gemini::tls;
use castor::gemini::tofu::TofuStore;
use castor::gemini::Request;

struct TestServer {
    addr: SocketAddr,
    shutdown: ShutdownHandle,
    thread: JoinHandle<()>,
    _root: TempDir,
    _state: TempDir,
}

impl TestServer {
    fn url(&self, path_and_params: &str) -> String {
        format!("gemini://{}{}", self.addr, path_and_params)
    }

    fn stop(self) {
        self.shutdown.shutdown();
        self.thread.join().expect("server thread panicked");
    }
}

fn start_server(configure: impl FnOnce(&mut Config, &Path)) -> TestServer {
    start_server_with(configure, |_| {})
}

fn start_server_with(
    configure: impl FnOnce(&mut Config, &Path),
    customize: impl FnOnce(&mut Server),
) -> TestServer {
    let root = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();

    let mut config = Config::default();
    config.server.host = "127.0.0.1".to_string();
    config.server.hostname = "localhost".to_string();
    config.server.document_root = root.path().to_path_buf();
    config.server.certfile = Some(state.path().join("cert.pem"));
    config.server.keyfile = Some(state.path().join("key.pem"));
    config.server.request_timeout = Duration::from_secs(5);
    config.server.drain_timeout = Duration::from_secs(2);
    configure(&mut config, root.path());

    let mut server = Server::new(config).expect("server construction failed");
    customize(&mut server);
    let shutdown = server.shutdown_handle();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();
    let thread = std::thread::spawn(move || {
        server.serve(listener).expect("serve failed");
    });

    TestServer {
        addr,
        shutdown,
        thread,
        _root: root,
        _state: state,
    }
}

fn client_with_store(state: &TempDir) -> Client {
    let mut config = ClientConfig::default();
    config.timeout = Duration::from_secs(5);
    config.tofu_path = Some(state.path().join("known_hosts.json"));
    Client::new(config).unwrap()
}

/// Speak the protocol by hand for the cases a well-behaved client
/// cannot produce.
fn raw_exchange(addr: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let connector = tls::create_tls_connector(None, None).unwrap();
    let tcp = TcpStream::connect(addr).unwrap();
    tcp.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    tcp.set_write_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut configuration = connector.configure().unwrap();
    configuration.set_verify_hostname(false);
    let mut stream = configuration.connect("localhost", tcp).unwrap();
    stream.write_all(payload).unwrap();
    stream.flush().unwrap();
    let mut out = Vec::new();
    let _ = stream.read_to_end(&mut out);
    out
}

#[test]
fn serves_the_index_for_the_root_url() {
    let server = start_server(|_, root| {
        fs::write(root.join("index.gmi"), "# Hi\n").unwrap();
    });
    let state = tempfile::tempdir().unwrap();
    let client = client_with_store(&state);

    let response = client.get(&server.url("/")).unwrap();
    assert_eq!(response.status, 20);
    assert_eq!(response.meta, "text/gemini; charset=utf-8");
    assert_eq!(response.body, b"# Hi\n");

    server.stop();
}

#[test]
fn oversize_request_lines_get_a_59() {
    let server = start_server(|_, _| {});
    let response = raw_exchange(server.addr, &[b'a'; 1025]);
    assert_eq!(response, b"59 Request too large\r\n");
    server.stop();
}

#[test]
fn traversal_attempts_get_a_51_without_path_disclosure() {
    let server = start_server(|_, root| {
        fs::write(root.join("index.gmi"), "# Hi\n").unwrap();
    });
    let request = format!("gemini://{}/../etc/passwd\r\n", server.addr);
    let response = raw_exchange(server.addr, request.as_bytes());
    let text = String::from_utf8(response).unwrap();
    assert!(text.starts_with("51 "), "got {:?}", text);
    assert!(!text.contains("passwd"));
    assert!(!text.contains("etc"));
    server.stop();
}

#[test]
fn invalid_utf8_request_lines_get_a_59() {
    let server = start_server(|_, _| {});
    let response = raw_exchange(server.addr, b"gemini://\xff\xfe/\r\n");
    let text = String::from_utf8(response).unwrap();
    assert!(text.starts_with("59 "), "got {:?}", text);
    server.stop();
}

#[test]
fn burst_past_the_bucket_capacity_yields_44_with_retry_after() {
    let server = start_server(|config, root| {
        fs::write(root.join("index.gmi"), "ok\n").unwrap();
        config.rate_limit.enabled = true;
        config.rate_limit.capacity = 2;
        config.rate_limit.refill_rate = 0.01;
        config.rate_limit.retry_after = 30;
    });
    let state = tempfile::tempdir().unwrap();
    let client = client_with_store(&state);

    for _ in 0..2 {
        let response = client.get(&server.url("/")).unwrap();
        assert_eq!(response.status, 20);
    }
    let limited = client.get(&server.url("/")).unwrap();
    assert_eq!(limited.status, 44);
    assert_eq!(limited.meta, "30");

    server.stop();
}

#[test]
fn a_changed_server_certificate_aborts_the_session() {
    let server = start_server(|_, root| {
        fs::write(root.join("index.gmi"), "# Hi\n").unwrap();
    });
    let state = tempfile::tempdir().unwrap();
    let tofu_path = state.path().join("known_hosts.json");

    // pin whatever the server currently presents
    let client = client_with_store(&state);
    client.get(&server.url("/")).unwrap();

    // sabotage the pin so the live certificate no longer matches
    let fake_der = b"not the real certificate";
    let host = server.addr.ip().to_string();
    {
        let store = TofuStore::open(&tofu_path).unwrap();
        store.trust(&host, server.addr.port(), fake_der).unwrap();
    }

    let client = client_with_store(&state);
    match client.get(&server.url("/")) {
        Err(ClientError::CertificateChanged {
            host: reported_host,
            port,
            old_fingerprint,
            new_fingerprint,
        }) => {
            assert_eq!(reported_host, host);
            assert_eq!(port, server.addr.port());
            assert_eq!(old_fingerprint, cert::fingerprint(fake_der));
            assert_ne!(new_fingerprint, old_fingerprint);
        }
        other => panic!("expected CertificateChanged, got {:?}", other.map(|r| r.status)),
    }

    server.stop();
}

#[test]
fn strict_clients_refuse_unknown_hosts() {
    let server = start_server(|_, root| {
        fs::write(root.join("index.gmi"), "# Hi\n").unwrap();
    });
    let state = tempfile::tempdir().unwrap();
    let mut config = ClientConfig::default();
    config.timeout = Duration::from_secs(5);
    config.tofu_path = Some(state.path().join("known_hosts.json"));
    config.trust_on_first_use = false;
    let client = Client::new(config).unwrap();

    assert!(matches!(
        client.get(&server.url("/")),
        Err(ClientError::UntrustedHost { .. })
    ));

    server.stop();
}

#[test]
fn titan_upload_then_delete_round_trips() {
    let uploads = tempfile::tempdir().unwrap();
    let server = start_server(|config, _| {
        config.titan.enabled = true;
        config.titan.upload_dir = uploads.path().to_path_buf();
        config.titan.max_upload_size = 1_048_576;
        config.titan.auth_tokens = Some(vec!["T".to_string()]);
        config.titan.enable_delete = true;
    });
    let state = tempfile::tempdir().unwrap();
    let client = client_with_store(&state);

    let target = server.url("/notes/a.gmi");
    let response = client
        .upload(&target, b"hello", "text/gemini", Some("T"))
        .unwrap();
    assert_eq!(response.status, 20);
    assert_eq!(response.meta, "Uploaded");
    assert_eq!(
        fs::read(uploads.path().join("notes/a.gmi")).unwrap(),
        b"hello"
    );

    let response = client.delete(&target, Some("T")).unwrap();
    assert_eq!(response.status, 20);
    assert_eq!(response.meta, "Deleted");
    assert!(!uploads.path().join("notes/a.gmi").exists());

    // wrong token never touches the filesystem
    let response = client
        .upload(&target, b"intruder", "text/gemini", Some("wrong"))
        .unwrap();
    assert_eq!(response.status, 60);
    assert!(!uploads.path().join("notes/a.gmi").exists());

    server.stop();
}

#[test]
fn titan_disabled_server_rejects_uploads() {
    let server = start_server(|_, _| {});
    let state = tempfile::tempdir().unwrap();
    let client = client_with_store(&state);
    let response = client
        .upload(&server.url("/a.gmi"), b"x", "text/gemini", None)
        .unwrap();
    assert_eq!(response.status, 50);
    server.stop();
}

#[test]
fn certificate_auth_protects_its_prefix() {
    let client_state = tempfile::tempdir().unwrap();
    let (cert_pem, key_pem) = cert::generate_self_signed("pollux", 2048, 30).unwrap();
    let certfile = client_state.path().join("client_cert.pem");
    let keyfile = client_state.path().join("client_key.pem");
    fs::write(&certfile, &cert_pem).unwrap();
    fs::write(&keyfile, &key_pem).unwrap();

    let server = start_server(|config, root| {
        fs::create_dir(root.join("private")).unwrap();
        fs::write(root.join("private/page.gmi"), "# Secret\n").unwrap();
        config.server.require_client_cert = true;
        config.certificate_auth.paths = vec![PathRuleConfig {
            prefix: "/private".to_string(),
            require_cert: true,
            allowed_fingerprints: vec![],
        }];
    });

    // anonymous client is turned away
    let anon_state = tempfile::tempdir().unwrap();
    let anon = client_with_store(&anon_state);
    let response = anon.get(&server.url("/private/page.gmi")).unwrap();
    assert_eq!(response.status, 60);

    // a client certificate opens the door
    let mut config = ClientConfig::default();
    config.timeout = Duration::from_secs(5);
    config.tofu_path = Some(client_state.path().join("known_hosts.json"));
    config.certfile = Some(certfile);
    config.keyfile = Some(keyfile);
    let authed = Client::new(config).unwrap();
    let response = authed.get(&server.url("/private/page.gmi")).unwrap();
    assert_eq!(response.status, 20);
    assert_eq!(response.body, b"# Secret\n");

    server.stop();
}

#[test]
fn directory_paths_serve_their_index_directly() {
    let server = start_server(|_, root| {
        fs::create_dir(root.join("dir")).unwrap();
        fs::write(root.join("dir/index.gmi"), "# Dir\n").unwrap();
    });
    let state = tempfile::tempdir().unwrap();
    let client = client_with_store(&state);

    for path in ["/dir", "/dir/"] {
        let response = client.get(&server.url(path)).unwrap();
        assert_eq!(response.status, 20);
        assert_eq!(response.body, b"# Dir\n");
    }

    server.stop();
}

struct JumpHandler;

impl Handler for JumpHandler {
    fn handle(&self, request: &Request) -> Response {
        let mut url = request.url.clone();
        url.path = "/landing.gmi".to_string();
        Response::new(Status::RedirectTemporary, url.to_string())
    }
}

#[test]
fn redirects_are_followed_to_the_target() {
    let server = start_server_with(
        |_, root| {
            fs::write(root.join("landing.gmi"), "# Landed\n").unwrap();
        },
        |server| {
            server.mount("/jump", Arc::new(JumpHandler));
        },
    );
    let state = tempfile::tempdir().unwrap();
    let client = client_with_store(&state);

    let response = client.get(&server.url("/jump")).unwrap();
    assert_eq!(response.status, 20);
    assert_eq!(response.body, b"# Landed\n");
    assert!(response.url.ends_with("/landing.gmi"));

    server.stop();
}

#[test]
fn shutdown_drains_and_returns() {
    let server = start_server(|_, root| {
        fs::write(root.join("index.gmi"), "# Hi\n").unwrap();
    });
    let state = tempfile::tempdir().unwrap();
    let client = client_with_store(&state);
    client.get(&server.url("/")).unwrap();
    // stop() joins the serve thread; hanging here would fail the test
    server.stop();
}
