//! Authentication sidecar stub
//!
//! The reverse proxy forwards auth subrequests here. This is a stub that
//! authorizes everything; real policy is owned by an external deployment
//! concern, and the rest of the system trusts this endpoint
//! unconditionally.

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Header the reverse proxy and containers look for
const AUTHORIZED_HEADER: &str = "X-Pernosco-Authorized";

/// Internal HTTP server that answers every request with 200 and the
/// authorized header.
pub struct AuthServer {
    bind_addr: SocketAddr,
    shutdown_rx: watch::Receiver<bool>,
}

impl AuthServer {
    pub fn new(bind_addr: SocketAddr, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Auth stub listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(|req: Request<Incoming>| async move {
                                    debug!(path = %req.uri().path(), "Auth subrequest");
                                    Ok::<_, hyper::Error>(authorized())
                                });

                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(addr = %addr, error = %e, "Auth connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept auth connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Auth stub shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

fn authorized() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header(AUTHORIZED_HEADER, "true")
        .body(Full::new(Bytes::new()))
        .expect("valid response with StatusCode enum and static header")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authorized_response() {
        let resp = authorized();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["X-Pernosco-Authorized"], "true");
    }
}
