//! Websocket transport.
//!
//! Accepts websocket clients, decodes JSON control packets, and feeds them
//! to the connection dispatcher. This layer owns the socket lifecycle: it
//! reports connection loss exactly once, and it is the one that decides to
//! close when the dispatcher raises a connection's error signal or the
//! engine requests a close (takeover, rejected CONNECT, DISCONNECT).

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::Dispatcher;
use crate::client::Connection;
use crate::protocol::Packet;

pub async fn start_websocket_server(
    addr: &str,
    dispatcher: Arc<Dispatcher>,
    max_connections: usize,
) {
    let listener = TcpListener::bind(addr).await.expect("Can't bind");

    info!("broker listening on ws://{addr}");

    while let Ok((stream, peer)) = listener.accept().await {
        if dispatcher.live_connection_count() >= max_connections {
            warn!(%peer, max_connections, "connection limit reached, socket refused");
            drop(stream);
            continue;
        }
        let dispatcher = dispatcher.clone();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!(%peer, "websocket handshake error: {e}");
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();

            let (tx, mut rx) = mpsc::unbounded_channel::<Packet>();
            let conn = Arc::new(Connection::new(tx));
            dispatcher.connection_established(conn.clone());
            debug!(%peer, conn = %conn.id(), "websocket client accepted");

            // Forward broker -> client until the outbound channel closes.
            let writer = tokio::spawn(async move {
                while let Some(packet) = rx.recv().await {
                    let text = match serde_json::to_string(&packet) {
                        Ok(json) => json,
                        Err(e) => {
                            error!("failed to encode outbound packet: {e}");
                            continue;
                        }
                    };
                    if ws_sender.send(WsMessage::text(text)).await.is_err() {
                        break;
                    }
                }
            });

            loop {
                tokio::select! {
                    _ = conn.closed() => break,
                    next = ws_receiver.next() => {
                        let Some(Ok(msg)) = next else { break };
                        if !msg.is_text() {
                            continue;
                        }
                        let text = msg.to_text().unwrap_or_default();
                        match serde_json::from_str::<Packet>(text) {
                            Ok(packet) => dispatcher.on_message(&conn, packet),
                            Err(e) => warn!(conn = %conn.id(), "undecodable frame dropped: {e}"),
                        }
                        if conn.has_failed() {
                            debug!(conn = %conn.id(), "closing connection after dispatch error");
                            break;
                        }
                    }
                }
            }

            dispatcher.connection_lost(&conn);
            writer.abort();
            debug!(%peer, "websocket client closed");
        });
    }
}
