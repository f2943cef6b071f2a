use std::env;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::error;

use castor::config::ClientConfig;
use castor::gemini::client::{Client, ClientResponse};

enum Action {
    Fetch(String),
    Upload(String, PathBuf),
    Delete(String),
}

fn usage() -> String {
    [
        "usage: pollux <url>              fetch a gemini URL",
        "       pollux <url> <file>       upload a file via titan",
        "       pollux --delete <url>     delete via titan (zero-byte upload)",
        "",
        "environment:",
        "  POLLUX_TOFU_PATH      trust database (default known_hosts.json)",
        "  POLLUX_STRICT         refuse unknown hosts instead of pinning them",
        "  POLLUX_TIMEOUT        seconds per request (default 30)",
        "  POLLUX_MAX_REDIRECTS  redirects to follow at most (default 5)",
        "  POLLUX_TOKEN          titan auth token",
        "  POLLUX_MIME           titan MIME type (default text/gemini)",
        "  POLLUX_CERTFILE / POLLUX_KEYFILE   client certificate",
    ]
    .join("\n")
}

fn parse_action(args: &[String]) -> Result<Action> {
    match args {
        [flag, url] if flag == "--delete" => Ok(Action::Delete(url.clone())),
        [url] => Ok(Action::Fetch(url.clone())),
        [url, file] => Ok(Action::Upload(url.clone(), PathBuf::from(file))),
        _ => Err(anyhow!("{}", usage())),
    }
}

fn config_from_env() -> Result<ClientConfig> {
    let mut config = ClientConfig::default();
    config.tofu_path = Some(PathBuf::from(
        env::var("POLLUX_TOFU_PATH").unwrap_or_else(|_| "known_hosts.json".to_string()),
    ));
    if env::var("POLLUX_STRICT").is_ok() {
        config.trust_on_first_use = false;
    }
    if let Ok(v) = env::var("POLLUX_TIMEOUT") {
        let secs: u64 = v.parse().context("POLLUX_TIMEOUT must be seconds")?;
        config.timeout = Duration::from_secs(secs);
    }
    if let Ok(v) = env::var("POLLUX_MAX_REDIRECTS") {
        config.max_redirects = v.parse().context("POLLUX_MAX_REDIRECTS must be a count")?;
    }
    if let Ok(v) = env::var("POLLUX_CERTFILE") {
        config.certfile = Some(PathBuf::from(v));
    }
    if let Ok(v) = env::var("POLLUX_KEYFILE") {
        config.keyfile = Some(PathBuf::from(v));
    }
    Ok(config)
}

fn execute(action: Action) -> Result<ClientResponse> {
    let client = Client::new(config_from_env()?)?;
    let token = env::var("POLLUX_TOKEN").ok();
    match action {
        Action::Fetch(url) => Ok(client.get(&url)?),
        Action::Upload(url, file) => {
            let body =
                std::fs::read(&file).with_context(|| format!("Failed to read {:?}", file))?;
            let mime = env::var("POLLUX_MIME").unwrap_or_else(|_| "text/gemini".to_string());
            Ok(client.upload(&url, &body, &mime, token.as_deref())?)
        }
        Action::Delete(url) => Ok(client.delete(&url, token.as_deref())?),
    }
}

fn main() {
    let exit_code = run();
    std::process::exit(exit_code);
}

fn run() -> i32 {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("pollux=warn"))
        .init();
    let args: Vec<String> = env::args().skip(1).collect();
    let action = match parse_action(&args) {
        Err(e) => {
            eprintln!("{}", e);
            return 2;
        }
        Ok(action) => action,
    };
    match execute(action) {
        Err(e) => {
            error!("{:#}", e);
            eprintln!("pollux: {}", e);
            1
        }
        Ok(response) => {
            eprintln!("{} {}", response.status, response.meta);
            if response.is_success() {
                let mut stdout = std::io::stdout();
                if stdout.write_all(&response.body).is_err() {
                    return 1;
                }
                0
            } else {
                1
            }
        }
    }
}
