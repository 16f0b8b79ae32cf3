//! End-to-end test over the websocket transport: two real clients complete
//! CONNECT, a QoS 1 publish travels from one to the other, and the
//! acknowledgment handshakes finish on both sides.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::{Dispatcher, Engine};
use crate::persistence::MessageStore;
use crate::protocol::{ConnectReturnCode, Packet, Qos, SubscribeTopic};
use crate::transport::websocket::start_websocket_server;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn send_packet(ws: &mut WsStream, packet: Packet) {
    let text = serde_json::to_string(&packet).unwrap();
    ws.send(WsMessage::text(text)).await.unwrap();
}

async fn recv_packet(ws: &mut WsStream) -> Packet {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a packet")
            .expect("websocket stream ended")
            .expect("websocket error");
        if let Ok(text) = msg.to_text() {
            if let Ok(packet) = serde_json::from_str(text) {
                return packet;
            }
        }
    }
}

#[tokio::test]
async fn integration_qos1_pubsub_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MessageStore::open(dir.path().to_str().unwrap()).unwrap());
    let dispatcher = Arc::new(Dispatcher::new(Arc::new(Engine::new(store))));

    let addr = "127.0.0.1:19831";
    let server = dispatcher.clone();
    tokio::spawn(async move {
        start_websocket_server(addr, server, 16).await;
    });
    tokio::time::sleep(Duration::from_millis(300)).await;

    let (mut ws_a, _) = connect_async(format!("ws://{addr}")).await.expect("client A connect");
    let (mut ws_b, _) = connect_async(format!("ws://{addr}")).await.expect("client B connect");

    send_packet(
        &mut ws_a,
        Packet::Connect {
            client_id: "client-a".into(),
            clean_session: true,
        },
    )
    .await;
    assert!(matches!(
        recv_packet(&mut ws_a).await,
        Packet::ConnAck {
            return_code: ConnectReturnCode::Accepted,
            ..
        }
    ));

    send_packet(
        &mut ws_b,
        Packet::Connect {
            client_id: "client-b".into(),
            clean_session: true,
        },
    )
    .await;
    assert!(matches!(recv_packet(&mut ws_b).await, Packet::ConnAck { .. }));
    assert_eq!(dispatcher.live_connection_count(), 2);

    send_packet(
        &mut ws_b,
        Packet::Subscribe {
            message_id: 1,
            topics: vec![SubscribeTopic {
                filter: "test/+".into(),
                qos: Qos::AtLeastOnce,
            }],
        },
    )
    .await;
    assert!(matches!(recv_packet(&mut ws_b).await, Packet::SubAck { .. }));

    send_packet(
        &mut ws_a,
        Packet::Publish {
            topic: "test/1".into(),
            payload: b"hello world".to_vec(),
            qos: Qos::AtLeastOnce,
            retain: false,
            message_id: Some(2),
            dup: false,
        },
    )
    .await;
    assert!(matches!(
        recv_packet(&mut ws_a).await,
        Packet::PubAck { message_id: 2 }
    ));

    match recv_packet(&mut ws_b).await {
        Packet::Publish {
            topic,
            payload,
            qos,
            message_id,
            ..
        } => {
            assert_eq!(topic, "test/1");
            assert_eq!(payload, b"hello world");
            assert_eq!(qos, Qos::AtLeastOnce);
            let mid = message_id.expect("QoS 1 delivery carries a message id");
            send_packet(&mut ws_b, Packet::PubAck { message_id: mid }).await;
        }
        other => panic!("expected PUBLISH, got {other:?}"),
    }

    // Keep-alive is still answered inline on a busy connection.
    send_packet(&mut ws_a, Packet::PingReq).await;
    assert!(matches!(recv_packet(&mut ws_a).await, Packet::PingResp));
}

#[tokio::test]
async fn integration_connection_limit_refuses_excess_sockets() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MessageStore::open(dir.path().to_str().unwrap()).unwrap());
    let dispatcher = Arc::new(Dispatcher::new(Arc::new(Engine::new(store))));

    let addr = "127.0.0.1:19832";
    let server = dispatcher.clone();
    tokio::spawn(async move {
        start_websocket_server(addr, server, 1).await;
    });
    tokio::time::sleep(Duration::from_millis(300)).await;

    let (mut ws_a, _) = connect_async(format!("ws://{addr}"))
        .await
        .expect("first client connect");
    send_packet(
        &mut ws_a,
        Packet::Connect {
            client_id: "client-a".into(),
            clean_session: true,
        },
    )
    .await;
    assert!(matches!(recv_packet(&mut ws_a).await, Packet::ConnAck { .. }));
    assert_eq!(dispatcher.live_connection_count(), 1);

    // The listener drops the raw socket before the websocket handshake, so
    // the excess client never completes its upgrade.
    let refused = connect_async(format!("ws://{addr}")).await;
    assert!(refused.is_err());
    assert_eq!(dispatcher.live_connection_count(), 1);
}
