//! Path-scoped client-certificate authorization. Rules are scanned in
//! configuration order and the FIRST prefix match decides, not the most
//! specific one. Placing a `require_cert = false` rule above a broader
//! protected prefix therefore punches a public hole into it.

use std::collections::HashSet;

use openssl::x509::X509;

use crate::config::CertAuthConfig;
use crate::gemini::cert;
use crate::gemini::middleware::{Middleware, Verdict};
use crate::gemini::response::Response;
use crate::gemini::status::Status;
use crate::gemini::Request;

struct PathRule {
    prefix: String,
    require_cert: bool,
    allowed_fingerprints: HashSet<String>,
}

pub struct CertAuth {
    rules: Vec<PathRule>,
}

impl CertAuth {
    pub fn from_config(config: &CertAuthConfig) -> CertAuth {
        CertAuth {
            rules: config
                .paths
                .iter()
                .map(|rule| PathRule {
                    prefix: rule.prefix.clone(),
                    require_cert: rule.require_cert,
                    allowed_fingerprints: rule
                        .allowed_fingerprints
                        .iter()
                        .map(|fp| fp.to_ascii_lowercase())
                        .collect(),
                })
                .collect(),
        }
    }
}

impl Middleware for CertAuth {
    fn name(&self) -> &'static str {
        "certificate_auth"
    }

    fn process(&self, request: &Request) -> Verdict {
        let Some(rule) = self
            .rules
            .iter()
            .find(|rule| request.url.path.starts_with(&rule.prefix))
        else {
            return Verdict::Allow;
        };
        if !rule.require_cert {
            return Verdict::Allow;
        }

        let Some(der) = request.peer_cert_der.as_deref() else {
            return Verdict::Reject(Response::new(
                Status::CertificateRequired,
                "Certificate required",
            ));
        };

        match X509::from_der(der) {
            Ok(parsed) if !cert::is_expired(&parsed) => {}
            _ => {
                return Verdict::Reject(Response::new(
                    Status::CertificateNotValid,
                    "Certificate not valid",
                ))
            }
        }

        if !rule.allowed_fingerprints.is_empty()
            && !rule.allowed_fingerprints.contains(&cert::fingerprint(der))
        {
            return Verdict::Reject(Response::new(
                Status::CertificateNotAuthorised,
                "Certificate not authorised",
            ));
        }
        Verdict::Allow
    }
}
