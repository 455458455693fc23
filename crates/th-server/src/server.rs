//! Loopback HTTP proxy in front of the session manager.
//!
//! One task per connection, one request per connection. Playlists and
//! segments are served straight from the session's working directory.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use th_core::{Error, Result};

use crate::http::{self, Response, Route};
use crate::session::SessionManager;

/// Time allowed for a client to send its request head.
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ProxyServer {
    listener: TcpListener,
    sessions: Arc<SessionManager>,
}

impl ProxyServer {
    pub async fn bind(addr: SocketAddr, sessions: Arc<SessionManager>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Internal(format!("Failed to bind to {addr}: {e}")))?;
        Ok(Self { listener, sessions })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `cancel` fires. In-flight connections are
    /// left to finish on their own.
    pub async fn run(self, cancel: CancellationToken) {
        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!("Proxy listening on http://{addr}");
        }
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.listener.accept() => match result {
                    Ok((stream, peer)) => {
                        let sessions = self.sessions.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, &sessions).await {
                                if e.kind() == io::ErrorKind::BrokenPipe {
                                    tracing::trace!(%peer, "Client disconnected: {e}");
                                } else {
                                    tracing::debug!(%peer, "Connection error: {e}");
                                }
                            }
                        });
                    }
                    Err(e) => tracing::debug!("Accept error: {e}"),
                },
            }
        }
        tracing::info!("Proxy stopped accepting connections");
    }
}

async fn handle_connection(mut stream: TcpStream, sessions: &SessionManager) -> io::Result<()> {
    let response = match tokio::time::timeout(READ_TIMEOUT, http::read_request(&mut stream)).await {
        Err(_) => Response::status(408),
        Ok(Err(e)) if e.kind() == io::ErrorKind::InvalidData => Response::status(400),
        Ok(Err(e)) => return Err(e),
        Ok(Ok(request)) if request.method != "GET" => Response::status(405),
        Ok(Ok(request)) => {
            let response = respond(&http::route(&request.path), sessions).await;
            tracing::debug!(path = %request.path, status = response.status, "Request");
            response
        }
    };
    response.write_to(&mut stream).await
}

/// Build the response for a routed GET.
pub async fn respond(route: &Route, sessions: &SessionManager) -> Response {
    match route {
        Route::Health => Response::ok_text("OK"),
        Route::NotFound => Response::status(404),
        Route::Playlist(channel) => match sessions.ensure(channel).await {
            Ok(ensured) if ensured.ready => match tokio::fs::read(&ensured.path).await {
                Ok(body) => Response::playlist(http::rewrite_playlist(&body, channel)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Response::status(503),
                Err(e) => {
                    tracing::warn!(channel = %channel, "Failed to read playlist: {e}");
                    Response::status(500)
                }
            },
            Ok(_) => Response::status(503),
            Err(e) => {
                tracing::warn!(channel = %channel, "Failed to start session: {e}");
                Response::status(e.http_status())
            }
        },
        Route::Segment(channel, file) => {
            let Some(path) = sessions.segment_path(channel, file) else {
                return Response::status(404);
            };
            match tokio::fs::read(&path).await {
                Ok(body) => Response::segment(body),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Response::status(404),
                Err(e) => {
                    tracing::warn!(channel = %channel, "Failed to read {file}: {e}");
                    Response::status(500)
                }
            }
        }
    }
}
