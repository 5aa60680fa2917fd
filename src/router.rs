//! The lobby HTTP server
//!
//! Serves exactly two pages per trace, `/debug/{id}/index.html` and
//! `/debug/{id}/source-viewer.html`, out of the page cache. Everything
//! else is a bodyless 404, including traces that exist on disk but have no
//! running container, so the client cannot probe which identifiers are
//! real.

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::cache::{PageCache, ResourceKind};
use crate::ident::TraceId;

/// Hash of the single inline bootstrap script the entry pages carry
const INLINE_SCRIPT_HASH: &str = "sha256-4K1wcVpdJ90zDRXxKPpXM3cVQjFm0mtPGCuKOtAyk7I=";

/// The public lobby endpoint
pub struct LobbyServer {
    bind_addr: SocketAddr,
    cache: Arc<PageCache>,
    shutdown_rx: watch::Receiver<bool>,
    csp: Arc<String>,
}

impl LobbyServer {
    pub fn new(
        bind_addr: SocketAddr,
        cache: Arc<PageCache>,
        static_assets_host: &str,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            cache,
            shutdown_rx,
            csp: Arc::new(build_csp(static_assets_host)),
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Lobby server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let cache = Arc::clone(&self.cache);
                            let csp = Arc::clone(&self.csp);

                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req: Request<Incoming>| {
                                    let cache = Arc::clone(&cache);
                                    let csp = Arc::clone(&csp);
                                    async move { handle_request(req, cache, &csp).await }
                                });

                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(addr = %addr, error = %e, "Lobby connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept lobby connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Lobby server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_request(
    req: Request<Incoming>,
    cache: Arc<PageCache>,
    csp: &str,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    if req.method() != Method::GET {
        return Ok(not_found());
    }

    let Some((id, kind)) = parse_page_path(req.uri().path()) else {
        return Ok(not_found());
    };

    debug!(trace = %id, page = kind.suffix(), "Lobby page request");

    match cache.get(kind, &id).await {
        Some(body) => Ok(page_response(body, kind, csp)),
        // Unknown and not-currently-available are indistinguishable here
        None => Ok(not_found()),
    }
}

/// Match `^/debug/<22-char-identifier>/<known-suffix>$`
fn parse_page_path(path: &str) -> Option<(TraceId, ResourceKind)> {
    let rest = path.strip_prefix("/debug/")?;
    let (id_part, suffix) = rest.split_once('/')?;
    let id = TraceId::parse(id_part)?;
    let kind = ResourceKind::from_suffix(suffix)?;
    Some((id, kind))
}

fn page_response(body: Bytes, kind: ResourceKind, csp: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/html; charset=utf-8")
        .header("Content-Security-Policy", csp)
        .header("X-Frame-Options", kind.frame_options())
        .header("Referrer-Policy", "strict-origin-when-cross-origin")
        .header("Cache-Control", "private,must-revalidate")
        .body(Full::new(body))
        .expect("valid response with StatusCode enum and static headers")
}

fn not_found() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Full::new(Bytes::new()))
        .expect("valid response with StatusCode enum")
}

/// Self plus the designated static-asset origin, with one inline-script
/// hash allowance
fn build_csp(static_assets_host: &str) -> String {
    format!(
        "default-src 'self' {host}; script-src 'self' {host} '{hash}'; \
         style-src 'self' {host}; img-src 'self' {host} data:",
        host = static_assets_host,
        hash = INLINE_SCRIPT_HASH
    )
}
