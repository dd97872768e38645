//! Integration Tests for RelayMQ
//!
//! These tests start real brokers on loopback ports and drive them with a
//! small MQTT client built on the crate's own codec.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use relaymq::auth::AllowAll;
use relaymq::broker::{Broker, BrokerError, Collaborators};
use relaymq::codec::{Decoder, Encoder};
use relaymq::config::{Config, DeployMode};
use relaymq::events::MemoryTransport;
use relaymq::protocol::{
    ConnAck, Connect, ConnectReturnCode, Packet, ProtocolVersion, PubAck, Publish, QoS, SubAck,
    Subscribe, SubscribeReturnCode, Subscription, Unsubscribe, Will,
};
use relaymq::storage::MemoryStore;

// Atomic port counter to avoid port conflicts between tests
static PORT_COUNTER: AtomicU16 = AtomicU16::new(19000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Test configuration helper
fn test_config(port: u16) -> Config {
    let mut config = Config::default();
    config.server.bind = SocketAddr::from(([127, 0, 0, 1], port));
    config.server.shutdown_timeout = Duration::from_secs(2);
    config.cluster.broker_id = Some(format!("test-{}", port));
    config
}

struct TestBroker {
    broker: Arc<Broker>,
    addr: SocketAddr,
    handle: JoinHandle<Result<(), BrokerError>>,
}

impl TestBroker {
    async fn start(config: Config) -> Self {
        Self::start_with(config, Collaborators::local()).await
    }

    async fn start_with(config: Config, collaborators: Collaborators) -> Self {
        let broker = Arc::new(Broker::new(config, collaborators).expect("Failed to build broker"));
        let addr = broker.bind().await.expect("Failed to bind broker");
        let handle = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.run().await })
        };
        Self {
            broker,
            addr,
            handle,
        }
    }

    async fn client(&self) -> TestClient {
        TestClient::connect(self.addr, ProtocolVersion::V311).await
    }

    async fn stop(self) {
        self.broker.shutdown();
        let result = timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("Broker did not stop")
            .expect("Broker task panicked");
        assert!(result.is_ok());
    }
}

/// Helper struct for MQTT client operations in tests
struct TestClient {
    stream: TcpStream,
    encoder: Encoder,
    decoder: Decoder,
    buf: BytesMut,
    protocol_version: ProtocolVersion,
}

impl TestClient {
    async fn connect(addr: SocketAddr, version: ProtocolVersion) -> Self {
        let stream = TcpStream::connect(addr).await.expect("Failed to connect");
        let mut decoder = Decoder::new();
        decoder.set_protocol_version(version);
        Self {
            stream,
            encoder: Encoder::new(version),
            decoder,
            buf: BytesMut::with_capacity(4096),
            protocol_version: version,
        }
    }

    async fn send(&mut self, packet: &Packet) {
        let mut buf = BytesMut::new();
        self.encoder
            .encode(packet, &mut buf)
            .expect("Failed to encode");
        self.stream.write_all(&buf).await.expect("Failed to write");
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("Failed to write");
    }

    /// Next packet, `None` on close or after waiting `wait`
    async fn recv_within(&mut self, wait: Duration) -> Option<Packet> {
        loop {
            match self.decoder.decode(&self.buf) {
                Ok(Some((packet, consumed))) => {
                    self.buf.advance(consumed);
                    return Some(packet);
                }
                Ok(None) => {}
                Err(_) => return None,
            }
            match timeout(wait, self.stream.read_buf(&mut self.buf)).await {
                Ok(Ok(n)) if n > 0 => {}
                _ => return None,
            }
        }
    }

    async fn recv(&mut self) -> Option<Packet> {
        self.recv_within(Duration::from_secs(5)).await
    }

    async fn recv_publish(&mut self) -> Publish {
        match self.recv().await {
            Some(Packet::Publish(publish)) => publish,
            other => panic!("Expected PUBLISH, got {:?}", other),
        }
    }

    /// Assert that nothing arrives for a short while
    async fn expect_silence(&mut self) {
        if let Some(packet) = self.recv_within(Duration::from_millis(200)).await {
            panic!("Expected no packet, got {:?}", packet);
        }
    }

    /// Whether the broker closed the connection
    async fn is_closed(&mut self) -> bool {
        loop {
            match timeout(Duration::from_secs(5), self.stream.read_buf(&mut self.buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) => return true,
                Ok(Ok(_)) => continue,
                Err(_) => return false,
            }
        }
    }

    async fn mqtt_connect_with(&mut self, connect: Connect) -> ConnAck {
        self.send(&Packet::Connect(Box::new(connect))).await;
        match self.recv().await {
            Some(Packet::ConnAck(ack)) => ack,
            other => panic!("Expected CONNACK, got {:?}", other),
        }
    }

    async fn mqtt_connect(&mut self, client_id: &str, clean_session: bool) -> ConnAck {
        self.mqtt_connect_with(Connect {
            protocol_version: self.protocol_version,
            client_id: client_id.to_string(),
            clean_session,
            keep_alive: 60,
            ..Default::default()
        })
        .await
    }

    async fn subscribe(&mut self, packet_id: u16, filter: &str, qos: QoS) -> SubAck {
        self.send(&Packet::Subscribe(Subscribe {
            packet_id,
            subscriptions: vec![Subscription {
                filter: filter.to_string(),
                qos: qos as u8,
            }],
        }))
        .await;

        match self.recv().await {
            Some(Packet::SubAck(ack)) => ack,
            other => panic!("Expected SUBACK, got {:?}", other),
        }
    }

    async fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS, retain: bool) {
        let packet_id = (qos != QoS::AtMostOnce).then_some(1);
        self.send(&Packet::Publish(Publish {
            dup: false,
            qos,
            retain,
            topic: Arc::from(topic),
            packet_id,
            payload: Bytes::copy_from_slice(payload),
        }))
        .await;
        if qos == QoS::AtLeastOnce {
            match self.recv().await {
                Some(Packet::PubAck(PubAck { packet_id: 1 })) => {}
                other => panic!("Expected PUBACK, got {:?}", other),
            }
        }
    }

    async fn disconnect(mut self) {
        self.send(&Packet::Disconnect).await;
        assert!(self.is_closed().await);
    }
}

async fn connected(broker: &TestBroker, client_id: &str) -> TestClient {
    let mut client = broker.client().await;
    let connack = client.mqtt_connect(client_id, true).await;
    assert_eq!(connack.return_code, ConnectReturnCode::Accepted);
    client
}

// ============================================================================
// CONNECT / CONNACK
// ============================================================================

#[tokio::test]
async fn test_connect_v311_success() {
    let broker = TestBroker::start(test_config(next_port())).await;
    let mut client = broker.client().await;

    let connack = client.mqtt_connect("test-client", true).await;
    assert_eq!(connack.return_code, ConnectReturnCode::Accepted);
    assert!(!connack.session_present);

    client.disconnect().await;
    broker.stop().await;
}

#[tokio::test]
async fn test_connect_v31_success() {
    let broker = TestBroker::start(test_config(next_port())).await;
    let mut client = TestClient::connect(broker.addr, ProtocolVersion::V31).await;

    let connack = client.mqtt_connect("v31-client", true).await;
    assert_eq!(connack.return_code, ConnectReturnCode::Accepted);

    client.send(&Packet::PingReq).await;
    assert_eq!(client.recv().await, Some(Packet::PingResp));
    broker.stop().await;
}

#[tokio::test]
async fn test_unsupported_protocol_name_is_rejected() {
    let broker = TestBroker::start(test_config(next_port())).await;
    let mut client = broker.client().await;

    // CONNECT with protocol name "MQTX", level 4, client id "a"
    client
        .send_raw(&[
            0x10, 0x0D, 0x00, 0x04, b'M', b'Q', b'T', b'X', 0x04, 0x02, 0x00, 0x3C, 0x00, 0x01,
            b'a',
        ])
        .await;

    match client.recv().await {
        Some(Packet::ConnAck(ack)) => {
            assert_eq!(ack.return_code, ConnectReturnCode::UnacceptableProtocolVersion);
            assert!(!ack.session_present);
        }
        other => panic!("Expected CONNACK, got {:?}", other),
    }
    assert!(client.is_closed().await);
    broker.stop().await;
}

#[tokio::test]
async fn test_anonymous_rejected_when_auth_enabled() {
    let mut config = test_config(next_port());
    config.auth.enabled = true;
    config.auth.allow_anonymous = false;
    let broker = TestBroker::start(config).await;
    let mut client = broker.client().await;

    let connack = client.mqtt_connect("anon", true).await;
    assert_eq!(connack.return_code, ConnectReturnCode::NotAuthorized);
    assert!(client.is_closed().await);
    broker.stop().await;
}

// ============================================================================
// Routing
// ============================================================================

#[tokio::test]
async fn test_literal_subscribe_publish_unsubscribe() {
    let broker = TestBroker::start(test_config(next_port())).await;
    let mut sub = connected(&broker, "sub").await;
    let mut publisher = connected(&broker, "pub").await;

    sub.subscribe(1, "home/kitchen", QoS::AtMostOnce).await;
    publisher
        .publish("home/kitchen", b"on", QoS::AtMostOnce, false)
        .await;

    let publish = sub.recv_publish().await;
    assert_eq!(&*publish.topic, "home/kitchen");
    assert_eq!(publish.payload, Bytes::from_static(b"on"));
    sub.expect_silence().await;

    sub.send(&Packet::Unsubscribe(Unsubscribe {
        packet_id: 2,
        filters: vec!["home/kitchen".to_string()],
    }))
    .await;
    assert!(matches!(sub.recv().await, Some(Packet::UnsubAck(ack)) if ack.packet_id == 2));

    publisher
        .publish("home/kitchen", b"off", QoS::AtMostOnce, false)
        .await;
    sub.expect_silence().await;
    broker.stop().await;
}

#[tokio::test]
async fn test_wildcard_delivery() {
    let broker = TestBroker::start(test_config(next_port())).await;
    let mut plus = connected(&broker, "plus").await;
    let mut hash = connected(&broker, "hash").await;
    let mut publisher = connected(&broker, "pub").await;

    plus.subscribe(1, "a/+/c", QoS::AtMostOnce).await;
    hash.subscribe(1, "a/#", QoS::AtMostOnce).await;

    publisher.publish("a/b/c", b"1", QoS::AtMostOnce, false).await;
    publisher.publish("a/b/b/c", b"2", QoS::AtMostOnce, false).await;

    assert_eq!(plus.recv_publish().await.payload, Bytes::from_static(b"1"));
    plus.expect_silence().await;

    publisher.publish("a", b"3", QoS::AtMostOnce, false).await;
    publisher.publish("a/b", b"4", QoS::AtMostOnce, false).await;

    let mut payloads = Vec::new();
    for _ in 0..4 {
        payloads.push(hash.recv_publish().await.payload);
    }
    assert_eq!(
        payloads,
        vec![
            Bytes::from_static(b"1"),
            Bytes::from_static(b"2"),
            Bytes::from_static(b"3"),
            Bytes::from_static(b"4"),
        ]
    );
    broker.stop().await;
}

#[tokio::test]
async fn test_sensor_reading_delivered_at_qos1() {
    let broker = TestBroker::start(test_config(next_port())).await;
    let mut c1 = connected(&broker, "c1").await;
    let mut sensor = connected(&broker, "sensor").await;

    let suback = c1.subscribe(1, "sensors/+/temp", QoS::AtLeastOnce).await;
    assert_eq!(
        suback.return_codes,
        vec![SubscribeReturnCode::Granted(QoS::AtLeastOnce)]
    );

    sensor
        .publish("sensors/room1/temp", b"21.5", QoS::AtLeastOnce, false)
        .await;

    let publish = c1.recv_publish().await;
    assert_eq!(&*publish.topic, "sensors/room1/temp");
    assert_eq!(publish.payload, Bytes::from_static(b"21.5"));
    assert_eq!(publish.qos, QoS::AtLeastOnce);
    assert!(!publish.retain);
    let packet_id = publish.packet_id.expect("QoS 1 delivery without packet id");
    c1.send(&Packet::PubAck(PubAck { packet_id })).await;
    c1.expect_silence().await;
    broker.stop().await;
}

#[tokio::test]
async fn test_qos2_publish_is_rejected() {
    let broker = TestBroker::start(test_config(next_port())).await;
    let mut sub = connected(&broker, "sub").await;
    let mut publisher = connected(&broker, "pub").await;
    sub.subscribe(1, "q2", QoS::AtLeastOnce).await;

    publisher
        .send(&Packet::Publish(Publish {
            dup: false,
            qos: QoS::ExactlyOnce,
            retain: false,
            topic: Arc::from("q2"),
            packet_id: Some(9),
            payload: Bytes::from_static(b"x"),
        }))
        .await;

    assert!(publisher.is_closed().await);
    sub.expect_silence().await;
    broker.stop().await;
}

#[tokio::test]
async fn test_retained_message_set_and_clear() {
    let broker = TestBroker::start(test_config(next_port())).await;
    let mut publisher = connected(&broker, "pub").await;

    publisher
        .publish("status/door", b"open", QoS::AtLeastOnce, true)
        .await;

    let mut first = connected(&broker, "first").await;
    first.subscribe(1, "status/#", QoS::AtLeastOnce).await;
    let retained = first.recv_publish().await;
    assert!(retained.retain);
    assert_eq!(&*retained.topic, "status/door");
    assert_eq!(retained.payload, Bytes::from_static(b"open"));

    // An empty retained payload clears retention
    publisher
        .publish("status/door", b"", QoS::AtMostOnce, true)
        .await;
    let cleared = first.recv_publish().await;
    assert!(cleared.payload.is_empty());

    let mut second = connected(&broker, "second").await;
    second.subscribe(1, "status/+", QoS::AtMostOnce).await;
    second.expect_silence().await;
    broker.stop().await;
}

// ============================================================================
// Sessions
// ============================================================================

#[tokio::test]
async fn test_persistent_session_resumes_with_queued_messages() {
    let broker = TestBroker::start(test_config(next_port())).await;

    let mut client = broker.client().await;
    let connack = client.mqtt_connect("durable", false).await;
    assert!(!connack.session_present);
    client.subscribe(1, "jobs/#", QoS::AtLeastOnce).await;
    client.disconnect().await;

    let mut publisher = connected(&broker, "pub").await;
    publisher
        .publish("jobs/42", b"run", QoS::AtLeastOnce, false)
        .await;

    let mut client = broker.client().await;
    let connack = client.mqtt_connect("durable", false).await;
    assert!(connack.session_present);

    let publish = client.recv_publish().await;
    assert_eq!(&*publish.topic, "jobs/42");
    assert_eq!(publish.payload, Bytes::from_static(b"run"));
    client.disconnect().await;

    // A clean connect discards the stored session
    let mut client = broker.client().await;
    let connack = client.mqtt_connect("durable", true).await;
    assert!(!connack.session_present);
    broker.stop().await;
}

#[tokio::test]
async fn test_session_takeover_closes_previous_connection() {
    let broker = TestBroker::start(test_config(next_port())).await;
    let mut first = connected(&broker, "same").await;
    let _second = connected(&broker, "same").await;

    assert!(first.is_closed().await);
    assert_eq!(broker.broker.manager().registry().len(), 1);
    broker.stop().await;
}

#[tokio::test]
async fn test_will_published_on_unclean_close() {
    let broker = TestBroker::start(test_config(next_port())).await;
    let mut watcher = connected(&broker, "watcher").await;
    watcher.subscribe(1, "wills/#", QoS::AtMostOnce).await;

    let mut dying = broker.client().await;
    let connack = dying
        .mqtt_connect_with(Connect {
            client_id: "dying".to_string(),
            will: Some(Will {
                topic: "wills/dying".to_string(),
                payload: Bytes::from_static(b"gone"),
                qos: QoS::AtMostOnce,
                retain: false,
            }),
            ..Default::default()
        })
        .await;
    assert_eq!(connack.return_code, ConnectReturnCode::Accepted);
    drop(dying);

    let will = watcher.recv_publish().await;
    assert_eq!(&*will.topic, "wills/dying");
    assert_eq!(will.payload, Bytes::from_static(b"gone"));
    broker.stop().await;
}

#[tokio::test]
async fn test_shutdown_closes_connections() {
    let broker = TestBroker::start(test_config(next_port())).await;
    let mut client = connected(&broker, "c").await;

    let stats = broker.broker.stats().clone();
    broker.stop().await;
    assert!(client.is_closed().await);
    assert_eq!(stats.get(relaymq::stats::CONNECTIONS_ACTIVE), 0);
    assert!(stats.get(relaymq::stats::CONNECTIONS_ACCEPTED) >= 1);
}

// ============================================================================
// Cluster
// ============================================================================

fn cluster_node(port: u16, hub: &MemoryTransport) -> (Config, Collaborators) {
    let mut config = test_config(port);
    config.cluster.mode = DeployMode::Cluster;
    let transport = hub.attach(&format!("test-{}", port));
    let collaborators = Collaborators {
        store: Arc::new(MemoryStore::new()),
        auth: Arc::new(AllowAll),
        transport: Some(Arc::new(transport)),
    };
    (config, collaborators)
}

#[tokio::test]
async fn test_cluster_publish_reaches_peer_subscribers() {
    let hub = MemoryTransport::new(2);
    let (config_a, collab_a) = cluster_node(next_port(), &hub);
    let (config_b, collab_b) = cluster_node(next_port(), &hub);
    let a = TestBroker::start_with(config_a, collab_a).await;
    let b = TestBroker::start_with(config_b, collab_b).await;

    let mut sub = connected(&b, "remote-sub").await;
    sub.subscribe(1, "fleet/+/pos", QoS::AtMostOnce).await;

    let mut publisher = connected(&a, "truck").await;
    publisher
        .publish("fleet/7/pos", b"52.1,4.3", QoS::AtMostOnce, false)
        .await;

    let publish = sub.recv_publish().await;
    assert_eq!(&*publish.topic, "fleet/7/pos");
    assert_eq!(publish.payload, Bytes::from_static(b"52.1,4.3"));
    sub.expect_silence().await;

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_cluster_connect_takes_over_peer_session() {
    let hub = MemoryTransport::new(2);
    let (config_a, collab_a) = cluster_node(next_port(), &hub);
    let (config_b, collab_b) = cluster_node(next_port(), &hub);
    let a = TestBroker::start_with(config_a, collab_a).await;
    let b = TestBroker::start_with(config_b, collab_b).await;

    let mut on_a = connected(&a, "roaming").await;
    let _on_b = connected(&b, "roaming").await;

    assert!(on_a.is_closed().await);
    a.stop().await;
    b.stop().await;
}
