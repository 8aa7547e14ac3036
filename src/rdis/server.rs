//! `RedisServer`: owns the listener and the accept loop.
//!
//! `RedisServer::new` takes an already-bound `TcpListener` so tests can bind
//! an ephemeral port, and the accept loop spawns one task per connection,
//! tracking handles in a `Mutex<Vec<JoinHandle<()>>>`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use super::blocked::ClientId;
use super::connection;
use super::executor::EngineMessage;

pub struct RedisServer {
    listener: TcpListener,
    open_handles: Mutex<Vec<JoinHandle<()>>>,
    next_client_id: AtomicU64,
}

impl RedisServer {
    pub fn new(listener: TcpListener) -> RedisServer {
        RedisServer {
            listener,
            open_handles: Mutex::new(Vec::with_capacity(1024)),
            next_client_id: AtomicU64::new(1),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    fn next_id(&self) -> ClientId {
        self.next_client_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Accepts connections until the listener errors (or the caller drops
    /// the future, e.g. on Ctrl-C), spawning one task per connection.
    pub async fn run(&self, engine_tx: mpsc::Sender<EngineMessage>) {
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let client_id = self.next_id();
                    info!("accepted connection {} from {}", client_id, addr);
                    let tx = engine_tx.clone();
                    let handle = tokio::spawn(async move {
                        connection::serve(stream, client_id, tx).await;
                    });
                    self.open_handles.lock().unwrap().push(handle);
                }
                Err(e) => {
                    tracing::error!("accept failed: {}", e);
                    break;
                }
            }
        }
    }
}
