//! X.509 helpers: DER fingerprints (the sole identity used by the trust
//! store), validity checks for reporting, and self-signed generation.

use std::net::IpAddr;

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::sha::sha256;
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509Builder, X509NameBuilder, X509Ref};

pub const FINGERPRINT_PREFIX: &str = "sha256:";

/// SHA-256 over the DER encoding, rendered `sha256:<lowercase-hex>`.
pub fn fingerprint(der: &[u8]) -> String {
    format!("{}{}", FINGERPRINT_PREFIX, hex::encode(sha256(der)))
}

/// Whether `cert` is outside its validity window right now. Errors from
/// the time conversion count as expired.
pub fn is_expired(cert: &X509Ref) -> bool {
    match Asn1Time::days_from_now(0) {
        Ok(now) => !(cert.not_before() <= now && cert.not_after() >= now),
        Err(_) => true,
    }
}

/// Informational hostname check against SAN entries, falling back to the
/// subject CN when no SANs are present. Supports single-label wildcards.
pub fn valid_for_hostname(cert: &X509Ref, host: &str) -> bool {
    if let Some(sans) = cert.subject_alt_names() {
        for name in sans.iter() {
            if let Some(dns) = name.dnsname() {
                if hostname_matches(dns, host) {
                    return true;
                }
            }
            if let Some(raw) = name.ipaddress() {
                if let (Some(san_ip), Ok(host_ip)) = (ip_from_der(raw), host.parse::<IpAddr>()) {
                    if san_ip == host_ip {
                        return true;
                    }
                }
            }
        }
        return false;
    }
    cert.subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|cn| hostname_matches(&cn, host))
        .unwrap_or(false)
}

fn hostname_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    let host = host.to_ascii_lowercase();
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return host
            .split_once('.')
            .map(|(_, rest)| rest == suffix)
            .unwrap_or(false);
    }
    pattern == host
}

fn ip_from_der(raw: &[u8]) -> Option<IpAddr> {
    match raw.len() {
        4 => {
            let octets: [u8; 4] = raw.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        16 => {
            let octets: [u8; 16] = raw.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        _ => None,
    }
}

/// Generate a self-signed RSA certificate for `hostname`, returned as
/// `(cert_pem, key_pem)`.
pub fn generate_self_signed(
    hostname: &str,
    key_bits: u32,
    valid_days: u32,
) -> Result<(Vec<u8>, Vec<u8>), ErrorStack> {
    let rsa = Rsa::generate(key_bits)?;
    let key = PKey::from_rsa(rsa)?;

    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_text("CN", hostname)?;
    let name = name.build();

    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;
    let serial = {
        let mut bn = BigNum::new()?;
        bn.rand(159, MsbOption::MAYBE_ZERO, false)?;
        bn.to_asn1_integer()?
    };
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(&key)?;
    let not_before = Asn1Time::days_from_now(0)?;
    builder.set_not_before(&not_before)?;
    let not_after = Asn1Time::days_from_now(valid_days)?;
    builder.set_not_after(&not_after)?;

    let mut san = SubjectAlternativeName::new();
    if hostname.parse::<IpAddr>().is_ok() {
        san.ip(hostname);
    } else {
        san.dns(hostname);
    }
    let san = san.build(&builder.x509v3_context(None, None))?;
    builder.append_extension(san)?;

    builder.sign(&key, MessageDigest::sha256())?;
    let cert = builder.build();

    Ok((cert.to_pem()?, key.private_key_to_pem_pkcs8()?))
}
