//! TCP accept loop: one spawned task per connection, shared
//! [`ServerState`] for ring and archive access.

use super::session::{handle_connection, ServerState};
use crate::error::AppResult;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

pub struct NetworkServer {
    listener: TcpListener,
    state: Arc<ServerState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl NetworkServer {
    pub async fn bind(addr: &str, state: Arc<ServerState>) -> AppResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "socket server listening");
        let shutdown_rx = state.shutdown.subscribe();
        Ok(Self { listener, state, shutdown_rx })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the accept loop until a `CQ` command or external shutdown
    /// signal flips the shared flag.
    pub async fn run(mut self) -> AppResult<()> {
        loop {
            tokio::select! {
                biased;
                changed = self.shutdown_rx.changed() => {
                    if changed.is_ok() && *self.shutdown_rx.borrow() {
                        info!("socket server shutting down");
                        break;
                    }
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((socket, peer)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, state).await {
                                    warn!(%peer, error = %e, "connection ended with an error");
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "accept failed"),
                    }
                }
            }
        }
        Ok(())
    }
}
