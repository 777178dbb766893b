use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode, Uri};
use axum::response::Response;
use axum::Router;
use tracing::{debug, info, warn};

/// Static-file service over the `server/` subtree, bound to loopback so the
/// sandbox can reach it through the reverse tunnel. Files are replaced
/// atomically by their writers, so requests see a complete old or new
/// version and no locking is needed.
pub struct CatalogServer {
    addr: SocketAddr,
    // The serving thread runs for the rest of the process.
    _thread: thread::JoinHandle<()>,
}

impl CatalogServer {
    /// Bind `127.0.0.1:port` (`0` picks a free port, used by tests) and
    /// serve `root` on a background thread.
    ///
    /// # Errors
    ///
    /// Returns an error when the port cannot be bound or the runtime cannot
    /// be created; both are host-environment failures.
    pub fn spawn(root: PathBuf, port: u16) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))
            .with_context(|| format!("failed to bind catalog server on 127.0.0.1:{port}"))?;
        listener
            .set_nonblocking(true)
            .context("failed to configure catalog server listener")?;
        let addr = listener
            .local_addr()
            .context("failed to read catalog server address")?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to create catalog server runtime")?;

        info!(%addr, root = %root.display(), "catalog server listening");
        let thread = thread::Builder::new()
            .name("catalog-server".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    let listener = match tokio::net::TcpListener::from_std(listener) {
                        Ok(listener) => listener,
                        Err(err) => {
                            warn!(error = %err, "catalog server listener unusable");
                            return;
                        }
                    };
                    let app = Router::new()
                        .fallback(serve_file)
                        .with_state(Arc::new(root));
                    if let Err(err) = axum::serve(listener, app).await {
                        warn!(error = %err, "catalog server stopped");
                    }
                });
            })
            .context("failed to spawn catalog server thread")?;

        Ok(Self {
            addr,
            _thread: thread,
        })
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

async fn serve_file(State(root): State<Arc<PathBuf>>, uri: Uri) -> Response {
    let Some(relative) = sanitize(uri.path()) else {
        return status_response(StatusCode::NOT_FOUND);
    };
    let path = root.join(relative);
    match std::fs::read(&path) {
        Ok(bytes) => {
            debug!(path = %path.display(), "served");
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type(&path))
                .body(Body::from(bytes))
                .unwrap_or_else(|_| status_response(StatusCode::INTERNAL_SERVER_ERROR))
        }
        Err(_) => status_response(StatusCode::NOT_FOUND),
    }
}

fn status_response(status: StatusCode) -> Response {
    Response::builder()
        .status(status)
        .body(Body::empty())
        .unwrap_or_default()
}

/// Turn a request path into a safe relative path; anything that escapes the
/// served root is rejected.
fn sanitize(request_path: &str) -> Option<PathBuf> {
    let decoded = request_path.trim_start_matches('/');
    if decoded.is_empty() {
        return None;
    }
    let candidate = Path::new(decoded);
    let mut clean = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if clean.as_os_str().is_empty() {
        None
    } else {
        Some(clean)
    }
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => "application/json",
        Some("html") => "text/html",
        _ => "application/octet-stream",
    }
}
