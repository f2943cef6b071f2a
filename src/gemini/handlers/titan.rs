//! Titan uploads: size-framed bodies committed with a temp file and an
//! atomic rename inside the upload root. A zero-byte upload is a delete.

use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::warn;

use crate::config::TitanConfig;
use crate::gemini::handlers::{resolve_under_root, Handler};
use crate::gemini::response::Response;
use crate::gemini::status::Status;
use crate::gemini::{Request, TitanParams};
use crate::nanoid::nanoid;

pub struct TitanHandler {
    upload_dir: PathBuf,
    max_upload_size: u64,
    allowed_mime_types: Option<HashSet<String>>,
    auth_tokens: Option<HashSet<String>>,
    enable_delete: bool,
}

impl TitanHandler {
    pub fn new(config: &TitanConfig) -> Result<TitanHandler> {
        fs::create_dir_all(&config.upload_dir)
            .with_context(|| format!("Failed to create upload dir {:?}", config.upload_dir))?;
        let upload_dir = config
            .upload_dir
            .canonicalize()
            .with_context(|| format!("Upload dir {:?} is not usable", config.upload_dir))?;
        Ok(TitanHandler {
            upload_dir,
            max_upload_size: config.max_upload_size,
            allowed_mime_types: config
                .allowed_mime_types
                .as_ref()
                .map(|list| list.iter().cloned().collect()),
            auth_tokens: config
                .auth_tokens
                .as_ref()
                .map(|list| list.iter().cloned().collect()),
            enable_delete: config.enable_delete,
        })
    }

    pub fn max_upload_size(&self) -> u64 {
        self.max_upload_size
    }

    /// Pre-body gate: token, MIME type and declared size are all checked
    /// before a single body byte is read off the wire.
    pub fn authorize(&self, params: &TitanParams) -> Result<(), Response> {
        if let Some(tokens) = &self.auth_tokens {
            let presented = params.token.as_deref();
            if !presented.is_some_and(|token| tokens.contains(token)) {
                return Err(Response::new(
                    Status::CertificateRequired,
                    "Authentication required",
                ));
            }
        }
        if let Some(allowed) = &self.allowed_mime_types {
            if !allowed.contains(&params.mime) {
                return Err(Response::new(Status::BadRequest, "Disallowed MIME type"));
            }
        }
        if params.size > self.max_upload_size {
            return Err(Response::new(Status::PermanentFailure, "Too large"));
        }
        Ok(())
    }

    fn delete(&self, target: &Path) -> Response {
        if !self.enable_delete {
            return Response::new(Status::PermanentFailure, "Deletes disabled");
        }
        match fs::symlink_metadata(target) {
            // removing what is already gone succeeds
            Err(_) => Response::success("Deleted", Vec::new()),
            Ok(metadata) if metadata.is_file() => match fs::remove_file(target) {
                Ok(()) => Response::success("Deleted", Vec::new()),
                Err(e) => {
                    warn!("titan delete of {:?} failed: {}", target, e);
                    Response::new(Status::TemporaryFailure, "Delete failed")
                }
            },
            Ok(_) => Response::new(Status::BadRequest, "Not a regular file"),
        }
    }

    fn store(&self, target: &Path, body: &[u8]) -> Response {
        let temp = self.upload_dir.join(format!(".titan-{}.tmp", nanoid()));
        match self.store_inner(&temp, target, body) {
            Ok(()) => Response::success("Uploaded", Vec::new()),
            Err(e) => {
                let _ = fs::remove_file(&temp);
                warn!("titan upload to {:?} failed: {}", target, e);
                Response::new(Status::TemporaryFailure, "Upload failed")
            }
        }
    }

    fn store_inner(&self, temp: &Path, target: &Path, body: &[u8]) -> io::Result<()> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(temp)?;
        file.write_all(body)?;
        file.sync_all()?;
        fs::rename(temp, target)
    }
}

impl Handler for TitanHandler {
    fn handle(&self, request: &Request) -> Response {
        let Some(params) = &request.url.titan else {
            return Response::new(Status::BadRequest, "Not a titan request");
        };
        if let Err(response) = self.authorize(params) {
            return response;
        }
        let Some(target) = resolve_under_root(&self.upload_dir, &request.url.path) else {
            return Response::new(Status::BadRequest, "Path outside upload root");
        };
        if params.size == 0 {
            self.delete(&target)
        } else {
            self.store(&target, &request.body)
        }
    }
}
