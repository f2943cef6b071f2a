use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use log::error;

use castor::config::Config;
use castor::gemini::server::Server;

/// Map `CASTOR_*` environment variables onto the validated config.
/// Anything not set keeps its default.
fn config_from_env() -> Result<Config> {
    let mut config = Config::default();

    if let Ok(v) = env::var("CASTOR_HOST") {
        config.server.host = v;
    }
    if let Ok(v) = env::var("CASTOR_PORT") {
        config.server.port = v.parse().context("CASTOR_PORT must be a port number")?;
    }
    if let Ok(v) = env::var("CASTOR_HOSTNAME") {
        config.server.hostname = v;
    }
    if let Ok(v) = env::var("CASTOR_ROOT") {
        config.server.document_root = PathBuf::from(v);
    }
    if let Ok(v) = env::var("CASTOR_CERTFILE") {
        config.server.certfile = Some(PathBuf::from(v));
    }
    if let Ok(v) = env::var("CASTOR_KEYFILE") {
        config.server.keyfile = Some(PathBuf::from(v));
    }
    if let Ok(v) = env::var("CASTOR_MAX_FILE_SIZE") {
        config.server.max_file_size =
            v.parse().context("CASTOR_MAX_FILE_SIZE must be bytes")?;
    }
    if let Ok(v) = env::var("CASTOR_REQUIRE_CLIENT_CERT") {
        config.server.require_client_cert = parse_bool(&v);
    }
    if let Ok(v) = env::var("CASTOR_DIR_LISTING") {
        config.server.enable_directory_listing = parse_bool(&v);
    }
    if let Ok(v) = env::var("CASTOR_TIMEOUT") {
        let secs: u64 = v.parse().context("CASTOR_TIMEOUT must be seconds")?;
        config.server.request_timeout = std::time::Duration::from_secs(secs);
    }

    if let Ok(v) = env::var("CASTOR_RATE_LIMIT") {
        config.rate_limit.enabled = parse_bool(&v);
    }
    if let Ok(v) = env::var("CASTOR_RATE_CAPACITY") {
        config.rate_limit.capacity = v.parse().context("CASTOR_RATE_CAPACITY must be a count")?;
    }
    if let Ok(v) = env::var("CASTOR_RATE_REFILL") {
        config.rate_limit.refill_rate =
            v.parse().context("CASTOR_RATE_REFILL must be tokens/sec")?;
    }
    if let Ok(v) = env::var("CASTOR_RATE_RETRY_AFTER") {
        config.rate_limit.retry_after =
            v.parse().context("CASTOR_RATE_RETRY_AFTER must be seconds")?;
    }

    if let Ok(v) = env::var("CASTOR_ALLOW_LIST") {
        config.access_control.enabled = true;
        config.access_control.allow_list = split_list(&v);
    }
    if let Ok(v) = env::var("CASTOR_DENY_LIST") {
        config.access_control.enabled = true;
        config.access_control.deny_list = split_list(&v);
    }
    if let Ok(v) = env::var("CASTOR_DEFAULT_ALLOW") {
        config.access_control.default_allow = parse_bool(&v);
    } else {
        config.access_control.default_allow = true;
    }

    if let Ok(v) = env::var("CASTOR_TITAN") {
        config.titan.enabled = parse_bool(&v);
    }
    if let Ok(v) = env::var("CASTOR_TITAN_DIR") {
        config.titan.upload_dir = PathBuf::from(v);
    }
    if let Ok(v) = env::var("CASTOR_TITAN_MAX_SIZE") {
        config.titan.max_upload_size =
            v.parse().context("CASTOR_TITAN_MAX_SIZE must be bytes")?;
    }
    if let Ok(v) = env::var("CASTOR_TITAN_TOKENS") {
        config.titan.auth_tokens = Some(split_list(&v));
    }
    if let Ok(v) = env::var("CASTOR_TITAN_MIME_TYPES") {
        config.titan.allowed_mime_types = Some(split_list(&v));
    }
    if let Ok(v) = env::var("CASTOR_TITAN_DELETE") {
        config.titan.enable_delete = parse_bool(&v);
    }

    if let Ok(v) = env::var("CASTOR_HASH_IPS") {
        config.logging.hash_ips = parse_bool(&v);
    }

    Ok(config)
}

fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn main() {
    let exit_code = run();
    std::process::exit(exit_code);
}

fn run() -> i32 {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("castor=info"))
        .init();
    let config = match config_from_env() {
        Err(e) => {
            error!("{:#}", e);
            return 1;
        }
        Ok(config) => config,
    };
    let server = match Server::new(config) {
        Err(e) => {
            error!("{:#}", e);
            return 1;
        }
        Ok(server) => server,
    };
    if let Err(e) = server.run() {
        error!("{:#}", e);
        return 1;
    }
    0
}
