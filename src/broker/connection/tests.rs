use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use pretty_assertions::assert_eq;
use test_case::test_case;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::*;
use crate::auth::AllowAll;
use crate::config::Config;
use crate::events::{EventBus, EventType};
use crate::message::Message;
use crate::protocol::{
    ConnAck, Connect, PubAck, Publish, QoS, SubAck, Subscribe, SubscribeReturnCode, Subscription,
};
use crate::stats::Stats;
use crate::storage::MemoryStore;

struct Harness {
    client: DuplexStream,
    decoder: Decoder,
    encoder: Encoder,
    buf: BytesMut,
    task: JoinHandle<Result<(), ConnectionError>>,
    manager: Arc<SessionManager>,
    bus: Arc<EventBus>,
    _shutdown: watch::Sender<bool>,
}

impl Harness {
    fn start(config: Config) -> Self {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let stats = Arc::new(Stats::new());
        let bus = Arc::new(EventBus::new("test", stats.clone()));
        let manager = Arc::new(SessionManager::new(
            Arc::new(config),
            Arc::new(MemoryStore::new()),
            Arc::new(AllowAll),
            bus.clone(),
            stats,
        ));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let connection = Connection::new(
            server,
            "127.0.0.1:50000".parse().unwrap(),
            manager.clone(),
            shutdown_rx,
        );
        Self {
            client,
            decoder: Decoder::new(),
            encoder: Encoder::new(ProtocolVersion::V311),
            buf: BytesMut::new(),
            task: tokio::spawn(connection.run()),
            manager,
            bus,
            _shutdown: shutdown,
        }
    }

    async fn send(&mut self, packet: Packet) {
        let mut buf = BytesMut::new();
        self.encoder.encode(&packet, &mut buf).unwrap();
        self.client.write_all(&buf).await.unwrap();
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.client.write_all(bytes).await.unwrap();
    }

    /// Next packet from the broker, `None` once the stream is closed
    async fn recv(&mut self) -> Option<Packet> {
        loop {
            if let Some((packet, consumed)) = self.decoder.decode(&self.buf).unwrap() {
                self.buf.advance(consumed);
                return Some(packet);
            }
            let n = tokio::time::timeout(Duration::from_secs(2), self.client.read_buf(&mut self.buf))
                .await
                .expect("timed out waiting for a packet")
                .unwrap();
            if n == 0 {
                return None;
            }
        }
    }

    async fn connect(&mut self, client_id: &str) -> ConnAck {
        self.send(Packet::Connect(Box::new(Connect {
            client_id: client_id.to_string(),
            ..Default::default()
        })))
        .await;
        match self.recv().await {
            Some(Packet::ConnAck(connack)) => connack,
            other => panic!("expected CONNACK, got {:?}", other),
        }
    }

    async fn finish(self) -> Result<(), ConnectionError> {
        tokio::time::timeout(Duration::from_secs(2), self.task)
            .await
            .expect("connection did not finish")
            .unwrap()
    }
}

#[test_case(0, None; "disabled")]
#[test_case(10, Some(Duration::from_secs(15)); "ten seconds")]
#[test_case(1, Some(Duration::from_millis(1500)); "one second")]
fn test_keep_alive_timeout(keep_alive: u16, expected: Option<Duration>) {
    assert_eq!(keep_alive_timeout(keep_alive), expected);
}

#[tokio::test]
async fn test_connect_and_ping() {
    let mut h = Harness::start(Config::default());
    let connack = h.connect("c1").await;
    assert_eq!(connack.return_code, ConnectReturnCode::Accepted);
    assert!(!connack.session_present);

    h.send(Packet::PingReq).await;
    assert_eq!(h.recv().await, Some(Packet::PingResp));

    h.send(Packet::Disconnect).await;
    assert!(h.recv().await.is_none());
    assert!(h.finish().await.is_ok());
}

#[tokio::test]
async fn test_unacceptable_protocol_level() {
    let mut h = Harness::start(Config::default());
    // CONNECT "MQTT" level 5, clean session, keep alive 60, client id "a"
    h.send_raw(&[
        0x10, 0x0D, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x05, 0x02, 0x00, 0x3C, 0x00, 0x01, b'a',
    ])
    .await;

    match h.recv().await {
        Some(Packet::ConnAck(connack)) => {
            assert_eq!(connack.return_code, ConnectReturnCode::UnacceptableProtocolVersion)
        }
        other => panic!("expected CONNACK, got {:?}", other),
    }
    assert!(matches!(
        h.finish().await,
        Err(ConnectionError::Refused(ConnectReturnCode::UnacceptableProtocolVersion))
    ));
}

#[tokio::test]
async fn test_empty_client_id_requires_clean_session() {
    let mut h = Harness::start(Config::default());
    h.send(Packet::Connect(Box::new(Connect {
        clean_session: false,
        ..Default::default()
    })))
    .await;

    match h.recv().await {
        Some(Packet::ConnAck(connack)) => {
            assert_eq!(connack.return_code, ConnectReturnCode::IdentifierRejected)
        }
        other => panic!("expected CONNACK, got {:?}", other),
    }
}

#[tokio::test]
async fn test_empty_client_id_is_assigned() {
    let mut h = Harness::start(Config::default());
    let connack = h.connect("").await;
    assert_eq!(connack.return_code, ConnectReturnCode::Accepted);

    let sessions = h.manager.registry().all();
    assert_eq!(sessions.len(), 1);
    assert!(sessions[0].client_id().starts_with("relaymq-"));
}

#[tokio::test]
async fn test_first_packet_must_be_connect() {
    let mut h = Harness::start(Config::default());
    h.send(Packet::PingReq).await;
    assert!(matches!(
        h.finish().await,
        Err(ConnectionError::Protocol(ProtocolError::ProtocolViolation(_)))
    ));
}

#[tokio::test]
async fn test_qos2_publish_closes_connection() {
    let mut h = Harness::start(Config::default());
    h.connect("c1").await;
    h.send(Packet::Publish(Publish {
        dup: false,
        qos: QoS::ExactlyOnce,
        retain: false,
        topic: Arc::from("a/b"),
        packet_id: Some(1),
        payload: Bytes::from_static(b"x"),
    }))
    .await;

    assert!(h.recv().await.is_none());
    assert!(matches!(
        h.finish().await,
        Err(ConnectionError::Protocol(ProtocolError::UnsupportedQoS(2)))
    ));
}

#[tokio::test]
async fn test_qos1_publish_is_acknowledged_and_delivered() {
    let mut h = Harness::start(Config::default());
    h.connect("c1").await;

    h.send(Packet::Subscribe(Subscribe {
        packet_id: 1,
        subscriptions: vec![
            Subscription {
                filter: "a/+".to_string(),
                qos: 2,
            },
            Subscription {
                filter: "bad/#/filter".to_string(),
                qos: 0,
            },
            Subscription {
                filter: "c".to_string(),
                qos: 3,
            },
        ],
    }))
    .await;
    assert_eq!(
        h.recv().await,
        Some(Packet::SubAck(SubAck {
            packet_id: 1,
            return_codes: vec![
                SubscribeReturnCode::Granted(QoS::AtLeastOnce),
                SubscribeReturnCode::Failure,
                SubscribeReturnCode::Failure,
            ],
        }))
    );

    h.send(Packet::Publish(Publish {
        dup: false,
        qos: QoS::AtLeastOnce,
        retain: false,
        topic: Arc::from("a/b"),
        packet_id: Some(7),
        payload: Bytes::from_static(b"hello"),
    }))
    .await;

    let mut got_ack = false;
    let mut delivered = None;
    for _ in 0..2 {
        match h.recv().await {
            Some(Packet::PubAck(PubAck { packet_id: 7 })) => got_ack = true,
            Some(Packet::Publish(publish)) => delivered = Some(publish),
            other => panic!("unexpected {:?}", other),
        }
    }
    assert!(got_ack);
    let delivered = delivered.unwrap();
    assert_eq!(&*delivered.topic, "a/b");
    assert_eq!(delivered.qos, QoS::AtLeastOnce);
    let packet_id = delivered.packet_id.unwrap();

    h.send(Packet::PubAck(PubAck { packet_id })).await;
    h.send(Packet::Disconnect).await;
    assert!(h.finish().await.is_ok());
}

#[tokio::test]
async fn test_suback_precedes_retained_messages() {
    let mut h = Harness::start(Config::default());
    for i in 0..50u8 {
        h.manager
            .route(&Message::new(
                format!("r/{}", i),
                Bytes::from(vec![i]),
                QoS::AtLeastOnce,
                true,
            ))
            .await;
    }
    h.connect("c1").await;

    h.send(Packet::Subscribe(Subscribe {
        packet_id: 9,
        subscriptions: vec![Subscription {
            filter: "r/#".to_string(),
            qos: 0,
        }],
    }))
    .await;
    assert_eq!(
        h.recv().await,
        Some(Packet::SubAck(SubAck {
            packet_id: 9,
            return_codes: vec![SubscribeReturnCode::Granted(QoS::AtMostOnce)],
        }))
    );
    for _ in 0..50 {
        match h.recv().await {
            Some(Packet::Publish(publish)) => {
                assert!(publish.retain);
                assert!(publish.topic.starts_with("r/"));
            }
            other => panic!("expected retained PUBLISH, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_lost_connection_emits_session_destroyed() {
    let mut h = Harness::start(Config::default());
    let (tx, mut destroyed) = tokio::sync::mpsc::unbounded_channel();
    h.bus.subscribe_fn(EventType::SessionDestroyed, move |event| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(event);
            Ok(())
        }
    });
    h.connect("c1").await;

    // No DISCONNECT: the socket just goes away
    let Harness {
        client,
        task,
        manager,
        _shutdown,
        ..
    } = h;
    drop(client);

    let event = tokio::time::timeout(Duration::from_secs(2), destroyed.recv())
        .await
        .expect("no SessionDestroyed event")
        .unwrap();
    assert_eq!(event.client_id, "c1");
    assert_eq!(event.broker_id, "test");
    let _ = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("connection did not finish");
    assert!(manager.registry().is_empty());
}

#[tokio::test]
async fn test_mount_point_is_hidden_from_clients() {
    let mut config = Config::default();
    config.mqtt.mount_point = "tenant/".to_string();
    let mut h = Harness::start(config);
    h.connect("c1").await;

    h.send(Packet::Subscribe(Subscribe {
        packet_id: 1,
        subscriptions: vec![Subscription {
            filter: "x/#".to_string(),
            qos: 0,
        }],
    }))
    .await;
    assert!(matches!(h.recv().await, Some(Packet::SubAck(_))));
    assert_eq!(
        h.manager.topics().subscriptions_of("c1"),
        vec![("tenant/x/#".to_string(), QoS::AtMostOnce)]
    );

    h.send(Packet::Publish(Publish {
        dup: false,
        qos: QoS::AtMostOnce,
        retain: false,
        topic: Arc::from("x/y"),
        packet_id: None,
        payload: Bytes::from_static(b"1"),
    }))
    .await;
    match h.recv().await {
        Some(Packet::Publish(publish)) => assert_eq!(&*publish.topic, "x/y"),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_oversized_payload_closes_connection() {
    let mut config = Config::default();
    config.mqtt.message_size_limit = 4;
    let mut h = Harness::start(config);
    h.connect("c1").await;

    h.send(Packet::Publish(Publish {
        dup: false,
        qos: QoS::AtMostOnce,
        retain: false,
        topic: Arc::from("a"),
        packet_id: None,
        payload: Bytes::from_static(b"too large"),
    }))
    .await;
    assert!(matches!(
        h.finish().await,
        Err(ConnectionError::Protocol(ProtocolError::MessageTooLarge(9)))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_expiry_closes_connection() {
    let mut h = Harness::start(Config::default());
    h.send(Packet::Connect(Box::new(Connect {
        client_id: "idle".to_string(),
        keep_alive: 1,
        ..Default::default()
    })))
    .await;
    assert!(matches!(h.recv().await, Some(Packet::ConnAck(_))));

    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(matches!(
        h.finish().await,
        Err(ConnectionError::Protocol(ProtocolError::KeepAliveTimeout))
    ));
}
