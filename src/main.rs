mod rdis;

use std::env;

use rdis::executor::Executor;
use rdis::server::RedisServer;
use tokio::net::TcpSocket;
use tokio::sync::mpsc;
use tracing::info;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Host/port come from `--host`/`--port` flags or `RDIS_HOST`/`RDIS_PORT`,
/// defaulting to `0.0.0.0:6379`, with flags taking precedence over env vars.
fn bind_addr() -> (String, u16) {
    let mut args = env::args().skip(1);
    let mut host = env::var("RDIS_HOST").unwrap_or_else(|_| "0.0.0.0".to_owned());
    let mut port: u16 = env::var("RDIS_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(6379);
    while let Some(flag) = args.next() {
        match flag.as_str() {
            "--host" => {
                if let Some(v) = args.next() {
                    host = v;
                }
            }
            "--port" => {
                if let Some(v) = args.next() {
                    if let Ok(p) = v.parse() {
                        port = p;
                    }
                }
            }
            _ => {}
        }
    }
    (host, port)
}

#[tokio::main(worker_threads = 4)]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt::init();

    let (host, port) = bind_addr();
    let addr = format!("{}:{}", host, port).parse()?;
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    info!("bound socket to {}", addr);

    let listener = socket.listen(1024)?;
    let server = RedisServer::new(listener);

    let (engine_tx, engine_rx) = mpsc::channel(4096);
    let executor = Executor::new(engine_rx);
    tokio::spawn(executor.run());

    tokio::select! {
        _ = server.run(engine_tx) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
        }
    }

    Ok(())
}
