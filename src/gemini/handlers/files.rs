//! Static file serving out of a document root: index resolution, MIME
//! detection by extension and optional gemtext directory listings.

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};

use crate::config::ServerConfig;
use crate::gemini::gemtext::GemtextBuilder;
use crate::gemini::handlers::{resolve_under_root, Handler};
use crate::gemini::response::Response;
use crate::gemini::status::Status;
use crate::gemini::Request;

const LINK_ENCODE_SET: &AsciiSet = &CONTROLS
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

pub struct FileServer {
    root: PathBuf,
    indices: Vec<String>,
    listing_enabled: bool,
    max_file_size: u64,
}

impl FileServer {
    pub fn new(config: &ServerConfig) -> Result<FileServer> {
        let root = config
            .document_root
            .canonicalize()
            .with_context(|| format!("Document root {:?} is not usable", config.document_root))?;
        Ok(FileServer {
            root,
            indices: config.default_indices.clone(),
            listing_enabled: config.enable_directory_listing,
            max_file_size: config.max_file_size,
        })
    }

    fn serve_file(&self, path: &Path) -> Response {
        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(_) => return not_found(),
        };
        if metadata.len() > self.max_file_size {
            return Response::new(Status::PermanentFailure, "File too large");
        }
        match crate::fs::read_file_as_bytes(path) {
            Ok(data) => Response::success(mime_for_path(path), data),
            Err(_) => Response::new(Status::TemporaryFailure, "Internal error"),
        }
    }

    fn list_directory(&self, dir: &Path, url_path: &str) -> Response {
        let reader = match fs::read_dir(dir) {
            Ok(reader) => reader,
            Err(_) => return Response::new(Status::TemporaryFailure, "Internal error"),
        };

        let mut entries: Vec<(String, bool)> = Vec::new();
        for entry in reader.flatten() {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            entries.push((name, is_dir));
        }
        entries.sort();

        let mut doc = GemtextBuilder::new();
        doc.heading(1, &format!("Index of {}", url_path)).blank();
        if url_path != "/" {
            doc.link("../", None);
        }
        for (name, is_dir) in entries {
            let encoded = utf8_percent_encode(&name, LINK_ENCODE_SET);
            if is_dir {
                doc.link(&format!("./{}/", encoded), None);
            } else {
                doc.link(&format!("./{}", encoded), Some(&name));
            }
        }
        Response::success("text/gemini; charset=utf-8", doc.finish().into_bytes())
    }
}

impl Handler for FileServer {
    fn handle(&self, request: &Request) -> Response {
        let Some(target) = resolve_under_root(&self.root, &request.url.path) else {
            return not_found();
        };
        let metadata = match fs::metadata(&target) {
            Ok(metadata) => metadata,
            Err(_) => return not_found(),
        };
        // resolve symlinks and re-check; a link may point anywhere
        let target = match target.canonicalize() {
            Ok(resolved) if resolved.starts_with(&self.root) => resolved,
            _ => return not_found(),
        };

        if metadata.is_dir() {
            for index in &self.indices {
                let candidate = target.join(index);
                if candidate.is_file() {
                    return self.serve_file(&candidate);
                }
            }
            if self.listing_enabled {
                return self.list_directory(&target, &request.url.path);
            }
            return not_found();
        }
        if metadata.is_file() {
            return self.serve_file(&target);
        }
        // sockets, devices and other oddities are never served
        not_found()
    }
}

fn not_found() -> Response {
    // deliberately the same response for missing files and path escapes
    Response::new(Status::NotFound, "Not found")
}

pub fn mime_for_path(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(OsStr::to_str)
        .map(|e| e.to_ascii_lowercase());
    match extension.as_deref() {
        Some("gmi" | "gemini") => "text/gemini; charset=utf-8",
        Some("txt") => "text/plain; charset=utf-8",
        Some("md") => "text/markdown; charset=utf-8",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        Some("pdf") => "application/pdf",
        Some("mp3") => "audio/mpeg",
        Some("ogg") => "audio/ogg",
        Some("mp4") => "video/mp4",
        Some("json") => "application/json",
        Some("xml") => "text/xml",
        Some("zip") => "application/zip",
        _ => "application/octet-stream",
    }
}
