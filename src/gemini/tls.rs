use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use log::info;
use openssl::ssl::{
    SslAcceptor, SslConnector, SslFiletype, SslMethod, SslStream, SslVerifyMode, SslVersion,
};

use crate::config::{ServerConfig, TlsVersion};
use crate::gemini::cert;
use crate::nanoid::nanoid;

const DEFAULT_CERT_FILE: &str = "castor_cert.pem";
const DEFAULT_KEY_FILE: &str = "castor_key.pem";
const GENERATED_KEY_BITS: u32 = 2048;
const GENERATED_VALID_DAYS: u32 = 365;

fn floor_version(requested: TlsVersion) -> Result<SslVersion> {
    match requested {
        TlsVersion::Tls12 => Ok(SslVersion::TLS1_2),
        TlsVersion::Tls13 => Ok(SslVersion::TLS1_3),
        TlsVersion::Tls10 | TlsVersion::Tls11 => {
            Err(anyhow!("TLS versions below 1.2 are not supported"))
        }
    }
}

pub fn create_tls_acceptor(config: &ServerConfig) -> Result<SslAcceptor> {
    let floor = floor_version(config.min_tls_version)?;
    let (cert_path, key_path) = ensure_certificate(config)?;

    let mut acceptor = SslAcceptor::mozilla_intermediate(SslMethod::tls())?;
    acceptor.set_min_proto_version(Some(floor))?;
    acceptor.set_private_key_file(&key_path, SslFiletype::PEM)?;
    acceptor.set_certificate_chain_file(&cert_path)?;

    if config.require_client_cert {
        // Request a certificate but accept anything that parses: clients
        // bring self-signed certs and authorization happens against the
        // fingerprint, not a CA chain. Absence is also fine here.
        acceptor.set_verify_callback(SslVerifyMode::PEER, |_preverified, x509_ctx| {
            x509_ctx.current_cert().is_some()
        });
    } else {
        acceptor.set_verify(SslVerifyMode::NONE);
    }

    let context = nanoid().into_bytes();
    acceptor.set_session_id_context(&context)?;
    acceptor.check_private_key()?;
    Ok(acceptor.build())
}

/// Resolve the certificate pair, generating and persisting a self-signed
/// one when the files are missing. The key file ends up owner-only.
fn ensure_certificate(config: &ServerConfig) -> Result<(PathBuf, PathBuf)> {
    let cert_path = config
        .certfile
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CERT_FILE));
    let key_path = config
        .keyfile
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_KEY_FILE));

    if cert_path.exists() && key_path.exists() {
        return Ok((cert_path, key_path));
    }

    info!(
        "No certificate at {:?}, generating a self-signed one for {}",
        cert_path, config.hostname
    );
    let (cert_pem, key_pem) =
        cert::generate_self_signed(&config.hostname, GENERATED_KEY_BITS, GENERATED_VALID_DAYS)
            .context("Certificate generation failed")?;
    std::fs::write(&cert_path, &cert_pem)
        .with_context(|| format!("Failed to write {:?}", cert_path))?;
    crate::fs::write_with_mode(&key_path, &key_pem, 0o600)
        .with_context(|| format!("Failed to write {:?}", key_path))?;
    Ok((cert_path, key_path))
}

/// Client-side context. CA verification and hostname checks are off: the
/// trust decision is made by the TOFU store after the handshake.
pub fn create_tls_connector(
    certfile: Option<&Path>,
    keyfile: Option<&Path>,
) -> Result<SslConnector> {
    let mut builder = SslConnector::builder(SslMethod::tls())?;
    builder.set_min_proto_version(Some(SslVersion::TLS1_2))?;
    builder.set_verify(SslVerifyMode::NONE);
    if let (Some(cert), Some(key)) = (certfile, keyfile) {
        builder.set_certificate_chain_file(cert)?;
        builder.set_private_key_file(key, SslFiletype::PEM)?;
        builder.check_private_key()?;
    }
    Ok(builder.build())
}

pub fn peer_certificate_der<S>(stream: &SslStream<S>) -> Option<Vec<u8>> {
    stream
        .ssl()
        .peer_certificate()
        .and_then(|cert| cert.to_der().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acceptor_rejects_pre_tls12_floor() {
        let mut config = ServerConfig::default();
        config.min_tls_version = TlsVersion::Tls11;
        assert!(create_tls_acceptor(&config).is_err());
    }

    #[test]
    fn acceptor_generates_and_persists_missing_certificate() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        let mut config = ServerConfig::default();
        config.hostname = "localhost".to_string();
        config.certfile = Some(cert_path.clone());
        config.keyfile = Some(key_path.clone());

        create_tls_acceptor(&config).unwrap();
        assert!(cert_path.exists());
        assert!(key_path.exists());
        let mode = std::fs::metadata(&key_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        // second construction reuses the persisted pair
        create_tls_acceptor(&config).unwrap();
    }

    #[test]
    fn connector_builds_without_client_identity() {
        assert!(create_tls_connector(None, None).is_ok());
    }
}
