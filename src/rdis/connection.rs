//! Per-connection reader/writer tasks.
//!
//! The two halves never block on each other: the reader only parses frames
//! and enqueues them onto the executor's channel, and a separate writer
//! drains a per-connection outbound queue so a reply pushed asynchronously
//! by the executor (a woken `BLPOP`, a `PUBLISH` fan-out) reaches the right
//! socket without the reader being involved at all.

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::blocked::ClientId;
use super::command::{self, ParsedItem};
use super::error::RdisError;
use super::executor::EngineMessage;
use super::parser::{Parser, ParserLimits};
use super::resp::RespValue;

pub async fn serve(stream: TcpStream, client_id: ClientId, engine_tx: mpsc::Sender<EngineMessage>) {
    let (read_half, write_half) = stream.into_split();
    let (out_tx, out_rx) = mpsc::unbounded_channel();

    if engine_tx
        .send(EngineMessage::Connect(client_id, out_tx.clone()))
        .await
        .is_err()
    {
        warn!("executor channel closed before client {} could register", client_id);
        return;
    }

    let writer_handle = tokio::spawn(writer_loop(write_half, out_rx));

    info!("client {} connected", client_id);
    reader_loop(read_half, client_id, engine_tx.clone()).await;
    info!("client {} disconnected", client_id);

    let _ = engine_tx.send(EngineMessage::Disconnect(client_id)).await;
    drop(out_tx);
    let _ = writer_handle.await;
}

/// Parses frames and forwards them to the executor as `ParsedItem`s, never
/// replying directly — a command-level parse error is just as much a part of
/// this connection's ordered reply stream as a well-formed command, so it
/// has to be queued through the same channel the executor drains in order
/// rather than written straight to the socket ahead of commands still
/// waiting to be dispatched.
async fn reader_loop(mut read_half: OwnedReadHalf, client_id: ClientId, engine_tx: mpsc::Sender<EngineMessage>) {
    let mut parser = Parser::new(ParserLimits::default());

    loop {
        let mut items = Vec::new();
        let mut fatal = false;
        loop {
            match parser.try_parse() {
                Ok(Some(value)) => match command::parse_command(&value) {
                    Ok(cmd) => items.push(ParsedItem::Command(cmd)),
                    Err(e) => {
                        debug!("client {} sent a bad command: {}", client_id, e);
                        items.push(ParsedItem::Error(e.resp_message()));
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    warn!("client {} protocol error: {}", client_id, e);
                    items.push(ParsedItem::Error(e.resp_message()));
                    fatal = true;
                    break;
                }
            }
        }
        flush_batch(&engine_tx, client_id, items).await;
        if fatal {
            return;
        }

        if parser.buffer_mut().capacity() == parser.buffer_mut().len() {
            parser.buffer_mut().reserve(parser.buffer_mut().capacity().max(4096));
        }
        match read_half.read_buf(parser.buffer_mut()).await {
            Ok(0) => return,
            Ok(n) => debug!("read {} bytes from client {}", n, client_id),
            Err(e) => {
                warn!("client {} read error: {}", client_id, e);
                return;
            }
        }
    }
}

async fn flush_batch(engine_tx: &mpsc::Sender<EngineMessage>, client_id: ClientId, items: Vec<ParsedItem>) {
    if items.is_empty() {
        return;
    }
    if engine_tx
        .send(EngineMessage::Commands(client_id, items))
        .await
        .is_err()
    {
        warn!("executor channel closed while delivering commands for client {}", client_id);
    }
}

async fn writer_loop(write_half: OwnedWriteHalf, mut out_rx: mpsc::UnboundedReceiver<RespValue>) {
    let mut writer = BufWriter::new(write_half);
    while let Some(value) = out_rx.recv().await {
        if let Err(e) = value.write_async(&mut writer, true).await {
            warn!("write error: {}", e);
            break;
        }
    }
    let _ = writer.flush().await;
}

/// Only used by tests wanting to distinguish a fatal parse from an ordinary
/// command-level error without constructing a full connection.
#[allow(dead_code)]
pub fn is_fatal(e: &RdisError) -> bool {
    e.is_fatal()
}
