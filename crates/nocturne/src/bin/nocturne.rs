// src/bin/nocturne.rs
//! Serve files from `NOCTURNE_DOCUMENT_ROOT` (default: the current directory).

use nocturne::logging::{LogFormat, init_logging_with_format};
use nocturne::{ConnectionQueue, NocturneError, NocturneResult, Request, Root, ServerConfig, Status};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc;
use tracing::{error, info};

struct StaticFiles {
    root: PathBuf,
}

impl Root for StaticFiles {
    fn process_request(&self, request: &mut Request) -> Status {
        let path = request.info().url.path.clone();
        let relative = Path::new(path.trim_start_matches('/'));
        if relative.components().any(|c| !matches!(c, Component::Normal(_))) {
            return Status::BAD_REQUEST;
        }
        let relative = if relative.as_os_str().is_empty() {
            Path::new("index.html")
        } else {
            relative
        };

        let full = self.root.join(relative);
        if !full.is_file() {
            return Status::Declined;
        }
        request.set_document_root(self.root.clone());
        request.set_content_type(content_type(&full));
        request.set_filename(relative);
        Status::Done
    }
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js") => "text/javascript; charset=utf-8",
        Some("json") => "application/json; charset=utf-8",
        Some("txt") => "text/plain; charset=utf-8",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("wasm") => "application/wasm",
        _ => "application/octet-stream",
    }
}

fn main() {
    let format = std::env::var("NOCTURNE_LOG_FORMAT")
        .ok()
        .and_then(|v| v.parse::<LogFormat>().ok())
        .unwrap_or(LogFormat::Compact);
    init_logging_with_format(format);

    if let Err(e) = run() {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn run() -> NocturneResult<()> {
    let config = ServerConfig::from_env()?;
    let root = config
        .document_root
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));
    info!(root = %root.display(), "serving files");

    let mut queue = ConnectionQueue::new(Arc::new(StaticFiles { root }), config)?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| NocturneError::Config(format!("failed to install Ctrl-C handler: {}", e)))?;

    queue.run()?;
    if let Some(addr) = queue.local_addr() {
        info!(%addr, "listening");
    }

    let _ = rx.recv();
    info!("received Ctrl-C, shutting down");
    queue.cancel();
    let stats = queue.metrics().snapshot();
    info!(
        requests = stats.requests,
        bytes_sent = stats.bytes_sent,
        "shutdown complete"
    );
    Ok(())
}
