//! End-to-end tests: a raw MQTT device and a WebSocket session against the
//! real broker listener and HTTP endpoint.

use bytes::{Buf, BytesMut};
use futures::{SinkExt, StreamExt};
use jsonwebtoken::{encode, EncodingKey, Header};
use mqtt_device_bridge::auth::JwtVerifier;
use mqtt_device_bridge::config::{BrokerConfig, IdentityConfig, PolicyGrant};
use mqtt_device_bridge::directory::{
    DeviceRecord, DeviceStatus, MemoryDeviceDirectory, StaticPolicy,
};
use mqtt_device_bridge::mqtt::frame_length;
use mqtt_device_bridge::session::SessionOptions;
use mqtt_device_bridge::{router, AppState, DeviceBroker, DeviceBus, SessionHub};
use mqttrs::{
    decode_slice, encode_slice, Connect, ConnectReturnCode, Packet, Pid, Protocol, Publish, QoS,
    QosPid, Subscribe, SubscribeTopic,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const SECRET: &str = "end-to-end-secret";
const DEVICE: &str = "AABBCCDDEEFF";
const TIMEOUT: Duration = Duration::from_secs(5);

struct Bridge {
    mqtt_addr: SocketAddr,
    http_addr: SocketAddr,
    broker: Arc<DeviceBroker>,
    directory: Arc<MemoryDeviceDirectory>,
    device_id: Uuid,
    cancel: CancellationToken,
}

impl Bridge {
    async fn wait_for_status(&self, status: DeviceStatus) {
        for _ in 0..250 {
            if self.directory.get(self.device_id).map(|d| d.status) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("device never reached {status}");
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn start_bridge() -> Bridge {
    start_bridge_with(SessionOptions::default()).await
}

async fn start_bridge_with(options: SessionOptions) -> Bridge {
    let project = Uuid::new_v4();
    let directory = Arc::new(MemoryDeviceDirectory::new());
    let mut device = DeviceRecord::new(DEVICE);
    device.project_id = Some(project);
    let device_id = directory.insert(device);

    let cancel = CancellationToken::new();
    let broker = Arc::new(DeviceBroker::new(
        BrokerConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            ..BrokerConfig::default()
        },
        directory.clone(),
    ));
    let listener = broker.bind().await.unwrap();
    let mqtt_addr = listener.local_addr().unwrap();
    tokio::spawn(broker.clone().serve(listener, cancel.clone()));

    let identity = IdentityConfig {
        jwt_secret: Some(SECRET.to_string()),
        ..IdentityConfig::default()
    };
    let state = AppState {
        hub: Arc::new(SessionHub::new(2)),
        bus: broker.clone(),
        directory: directory.clone(),
        policy: Arc::new(StaticPolicy::new(vec![PolicyGrant {
            subject: "alice".to_string(),
            domain: format!("project:{project}"),
            object: "devices".to_string(),
            action: "read".to_string(),
        }])),
        verifier: Arc::new(JwtVerifier::from_config(&identity).unwrap()),
        options,
    };
    let app = router(state, "/ws");

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http_addr = listener.local_addr().unwrap();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    });

    Bridge {
        mqtt_addr,
        http_addr,
        broker,
        directory,
        device_id,
        cancel,
    }
}

fn token(user: &str) -> String {
    let exp = chrono::Utc::now().timestamp() + 3600;
    encode(
        &Header::default(),
        &json!({"sub": user, "exp": exp, "owner": "acme"}),
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

// ============================================================================
// Raw MQTT device
// ============================================================================

struct Device {
    stream: TcpStream,
    buf: BytesMut,
}

impl Device {
    async fn open(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            buf: BytesMut::new(),
        }
    }

    async fn connect(addr: SocketAddr, password: &str) -> Self {
        let mut device = Self::open(addr).await;
        device
            .send(&Packet::Connect(Connect {
                protocol: Protocol::MQTT311,
                keep_alive: 60,
                client_id: "dev1",
                clean_session: true,
                last_will: None,
                username: Some("device"),
                password: Some(password.as_bytes()),
            }))
            .await;

        let frame = device.read_frame().await;
        match decode_slice(&frame).unwrap() {
            Some(Packet::Connack(connack)) => {
                assert_eq!(connack.code, ConnectReturnCode::Accepted)
            }
            other => panic!("expected CONNACK, got {other:?}"),
        }
        device
    }

    async fn send(&mut self, packet: &Packet<'_>) {
        let mut out = vec![0u8; 1024];
        let n = encode_slice(packet, &mut out).unwrap();
        self.stream.write_all(&out[..n]).await.unwrap();
    }

    async fn read_frame(&mut self) -> Vec<u8> {
        loop {
            if let Some(len) = frame_length(&self.buf).unwrap() {
                if self.buf.len() >= len {
                    let frame = self.buf[..len].to_vec();
                    self.buf.advance(len);
                    return frame;
                }
            }
            let n = tokio::time::timeout(TIMEOUT, self.stream.read_buf(&mut self.buf))
                .await
                .expect("timed out waiting for MQTT packet")
                .unwrap();
            assert!(n > 0, "broker closed the connection");
        }
    }

    async fn expect_closed(&mut self) {
        let read = tokio::time::timeout(TIMEOUT, self.stream.read_buf(&mut self.buf))
            .await
            .expect("broker kept the connection open");
        assert_eq!(read.unwrap_or(0), 0, "unexpected bytes from broker");
    }

    async fn subscribe_down(&mut self) {
        self.send(&Packet::Subscribe(Subscribe {
            pid: Pid::try_from(1).unwrap(),
            topics: vec![SubscribeTopic {
                topic_path: format!("devices/{DEVICE}/down"),
                qos: QoS::AtLeastOnce,
            }],
        }))
        .await;
        let frame = self.read_frame().await;
        assert!(matches!(decode_slice(&frame).unwrap(), Some(Packet::Suback(_))));
    }

    async fn publish(&mut self, topic: &str, payload: &[u8]) {
        self.publish_with(topic, payload, QosPid::AtMostOnce).await;
    }

    async fn publish_with(&mut self, topic: &str, payload: &[u8], qospid: QosPid) {
        self.send(&Packet::Publish(Publish {
            dup: false,
            qospid,
            retain: false,
            topic_name: topic,
            payload,
        }))
        .await;
    }
}

// ============================================================================
// WebSocket session
// ============================================================================

type Session =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;

async fn open_session(addr: SocketAddr, user: &str) -> Session {
    let url = format!("ws://{addr}/ws?deviceId=aa:bb:cc:dd:ee:ff&token={}", token(user));
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    let welcome = next_json(&mut ws).await;
    assert_eq!(welcome["type"], "connected");
    assert_eq!(welcome["device_id"], DEVICE);
    ws
}

async fn next_json(ws: &mut Session) -> Value {
    loop {
        let message = tokio::time::timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("session closed")
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn expect_session_closed(ws: &mut Session) {
    loop {
        let next = tokio::time::timeout(TIMEOUT, ws.next())
            .await
            .expect("session stayed open");
        match next {
            None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
            Some(Ok(_)) => continue,
        }
    }
}

#[tokio::test]
async fn test_device_data_reaches_session() {
    let bridge = start_bridge().await;
    let mut device = Device::connect(bridge.mqtt_addr, "AA:BB:CC:DD:EE:FF").await;
    let mut ws = open_session(bridge.http_addr, "alice").await;

    device.publish(&format!("devices/{DEVICE}/up"), br#"{"temp":21}"#).await;

    let frame = next_json(&mut ws).await;
    assert_eq!(frame["type"], "device_data");
    assert_eq!(frame["device_id"], DEVICE);
    assert_eq!(frame["data"], json!({"temp": 21}));
    assert!(frame["timestamp"].is_string());
}

#[tokio::test]
async fn test_uplink_topic_passed_through() {
    let bridge = start_bridge().await;
    let mut device = Device::connect(bridge.mqtt_addr, "AA:BB:CC:DD:EE:FF").await;

    let (tx, mut rx) = tokio::sync::mpsc::channel(4);
    bridge.broker.subscribe_to_device(DEVICE, tx).unwrap();
    device.publish("devices/aa:bb:cc:dd:ee:ff/status", b"online").await;

    let event = tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(event.device_key, DEVICE);
    assert_eq!(event.topic, "devices/aa:bb:cc:dd:ee:ff/status");
    assert_eq!(&event.payload[..], b"online");
}

#[tokio::test]
async fn test_command_reaches_device_once() {
    let bridge = start_bridge().await;
    let mut device = Device::connect(bridge.mqtt_addr, "aa-bb-cc-dd-ee-ff").await;
    device.subscribe_down().await;
    let mut ws = open_session(bridge.http_addr, "alice").await;

    let command = json!({
        "type": "device_command",
        "device_id": DEVICE,
        "data": {"cmd": "reboot"},
    });
    ws.send(Message::text(command.to_string())).await.unwrap();

    let ack = next_json(&mut ws).await;
    assert_eq!(ack["type"], "command_ack");
    assert_eq!(ack["data"]["status"], "forwarded");

    let frame = device.read_frame().await;
    match decode_slice(&frame).unwrap() {
        Some(Packet::Publish(publish)) => {
            assert_eq!(publish.topic_name, format!("devices/{DEVICE}/down"));
            let payload: Value = serde_json::from_slice(publish.payload).unwrap();
            assert_eq!(payload, json!({"cmd": "reboot"}));
        }
        other => panic!("expected PUBLISH, got {other:?}"),
    }

    // Nothing else follows the single command.
    device.send(&Packet::Pingreq).await;
    let frame = device.read_frame().await;
    assert!(matches!(decode_slice(&frame).unwrap(), Some(Packet::Pingresp)));
}

#[tokio::test]
async fn test_session_ping_and_mismatch() {
    let bridge = start_bridge().await;
    let mut ws = open_session(bridge.http_addr, "alice").await;

    ws.send(Message::text(r#"{"type":"ping"}"#)).await.unwrap();
    let pong = next_json(&mut ws).await;
    assert_eq!(pong["type"], "pong");
    assert!(pong["data"]["timestamp"].is_string());

    let command = json!({"type": "device_command", "device_id": "112233445566", "data": "x"});
    ws.send(Message::text(command.to_string())).await.unwrap();
    let frame = next_json(&mut ws).await;
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["data"]["code"], "DEVICE_MISMATCH");
}

#[tokio::test]
async fn test_upgrade_rejections() {
    let bridge = start_bridge().await;

    let url = format!("ws://{}/ws?deviceId={DEVICE}", bridge.http_addr);
    match tokio_tungstenite::connect_async(url).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 401),
        other => panic!("expected 401, got {:?}", other.map(|_| ())),
    }

    let url = format!(
        "ws://{}/ws?deviceId={DEVICE}&token={}",
        bridge.http_addr,
        token("mallory")
    );
    match tokio_tungstenite::connect_async(url).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 403),
        other => panic!("expected 403, got {:?}", other.map(|_| ())),
    }

    let url = format!(
        "ws://{}/ws?deviceId=112233445566&token={}",
        bridge.http_addr,
        token("alice")
    );
    match tokio_tungstenite::connect_async(url).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 404),
        other => panic!("expected 404, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_session_limit_sends_registration_error() {
    let bridge = start_bridge().await;
    let _first = open_session(bridge.http_addr, "alice").await;
    let _second = open_session(bridge.http_addr, "alice").await;

    let url = format!(
        "ws://{}/ws?deviceId={DEVICE}&token={}",
        bridge.http_addr,
        token("alice")
    );
    let (mut third, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    let frame = next_json(&mut third).await;
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["data"]["code"], "REGISTRATION_FAILED");
}

#[tokio::test]
async fn test_device_lifecycle_and_kick() {
    let bridge = start_bridge().await;

    let mut device = Device::connect(bridge.mqtt_addr, "AA:BB:CC:DD:EE:FF").await;
    bridge.wait_for_status(DeviceStatus::Online).await;

    device.send(&Packet::Disconnect).await;
    device.expect_closed().await;
    bridge.wait_for_status(DeviceStatus::Offline).await;

    let mut device = Device::connect(bridge.mqtt_addr, "AA:BB:CC:DD:EE:FF").await;
    bridge.wait_for_status(DeviceStatus::Online).await;

    device.publish(&format!("devices/{DEVICE}/status"), b"OFFLINE").await;
    bridge.wait_for_status(DeviceStatus::Offline).await;
    device.publish(&format!("devices/{DEVICE}/up"), b"{}").await;
    bridge.wait_for_status(DeviceStatus::Online).await;

    assert_eq!(bridge.broker.kick("aa:bb:cc:dd:ee:ff").unwrap(), 1);
    device.expect_closed().await;
    bridge.wait_for_status(DeviceStatus::Offline).await;
    assert!(!bridge.broker.is_device_connected(DEVICE));
}

#[tokio::test]
async fn test_denied_qos1_publish_disconnects() {
    let bridge = start_bridge().await;
    let mut device = Device::connect(bridge.mqtt_addr, "AA:BB:CC:DD:EE:FF").await;

    // QoS 0 to a foreign topic is dropped silently
    device.publish("devices/112233445566/up", b"{}").await;
    device.send(&Packet::Pingreq).await;
    let frame = device.read_frame().await;
    assert!(matches!(decode_slice(&frame).unwrap(), Some(Packet::Pingresp)));

    let pid = Pid::try_from(7).unwrap();
    device.publish_with("devices/112233445566/up", b"{}", QosPid::AtLeastOnce(pid)).await;
    device.expect_closed().await;
}

#[tokio::test]
async fn test_unsupported_protocol_refused() {
    let bridge = start_bridge().await;
    let mut device = Device::open(bridge.mqtt_addr).await;

    // CONNECT with protocol level 5
    let connect = [
        0x10, 0x11, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x05, 0x02, 0x00, 0x3C, 0x00, 0x00, 0x04,
        b'd', b'e', b'v', b'1',
    ];
    device.stream.write_all(&connect).await.unwrap();

    let frame = device.read_frame().await;
    match decode_slice(&frame).unwrap() {
        Some(Packet::Connack(connack)) => {
            assert_eq!(connack.code, ConnectReturnCode::RefusedProtocolVersion)
        }
        other => panic!("expected CONNACK, got {other:?}"),
    }
    device.expect_closed().await;
}

#[tokio::test]
async fn test_oversized_frame_closes_session() {
    let bridge = start_bridge_with(SessionOptions {
        max_message_size: 64,
        ..SessionOptions::default()
    })
    .await;
    let mut ws = open_session(bridge.http_addr, "alice").await;

    ws.send(Message::text("x".repeat(500))).await.unwrap();
    expect_session_closed(&mut ws).await;
}

#[tokio::test]
async fn test_idle_session_times_out() {
    let bridge = start_bridge_with(SessionOptions {
        pong_wait: Duration::from_millis(300),
        ping_interval: Duration::from_secs(60),
        ..SessionOptions::default()
    })
    .await;
    let mut ws = open_session(bridge.http_addr, "alice").await;

    expect_session_closed(&mut ws).await;
}
