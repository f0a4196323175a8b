//! Per-client MQTT protocol task
//!
//! Drives one device connection through `Connecting -> Authenticated ->
//! Disconnected`. The first packet must be CONNECT and must arrive within the
//! connect timeout; after CONNACK the task serves inbound packets, downlink
//! commands and the keep-alive deadline until the client leaves or is kicked.

use super::{ClientHandle, DeviceBroker, Downlink};
use crate::error::CodecError;
use crate::mqtt::{
    device_topic, BrokerPacket, ConnackCode, DeviceTopic, MqttCodec, MqttPacket, ParsedConnect,
    ParsedPublish, ParsedSubscribe, ParsedUnsubscribe, TopicKind,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

type DeviceStream = Framed<TcpStream, MqttCodec>;

/// What the loop does after a packet
enum Flow {
    Continue,
    Close(&'static str),
}

/// Accept, authenticate and serve one device connection.
pub(super) async fn handle_connection(
    broker: Arc<DeviceBroker>,
    stream: TcpStream,
    peer: SocketAddr,
    shutdown: CancellationToken,
) {
    let mut framed = Framed::new(stream, MqttCodec::new(broker.config.max_packet_size));

    let connect = match timeout(broker.config.connect_timeout(), framed.next()).await {
        Ok(Some(Ok(MqttPacket::Connect(connect)))) => connect,
        Ok(Some(Ok(other))) => {
            debug!(
                peer = %peer,
                packet = other.packet_type().as_str(),
                "First packet was not CONNECT"
            );
            return;
        }
        Ok(Some(Err(CodecError::UnsupportedProtocol { name, level }))) => {
            warn!(peer = %peer, protocol = %name, level, "Unsupported MQTT protocol");
            let _ = framed
                .send(BrokerPacket::Connack(ConnackCode::UnacceptableProtocol))
                .await;
            return;
        }
        Ok(Some(Err(e))) => {
            debug!(peer = %peer, error = %e, "Failed to read CONNECT");
            return;
        }
        Ok(None) => return,
        Err(_) => {
            debug!(peer = %peer, "CONNECT timeout");
            return;
        }
    };

    let Some(mut client) = authenticate(&broker, framed, peer, connect, &shutdown).await else {
        return;
    };

    broker.lifecycle.connected(&client.device_key);
    let reason = match client.run().await {
        Ok(reason) => reason,
        Err(e) => {
            debug!(client_id = %client.client_id, error = %e, "Connection error");
            "protocol error"
        }
    };

    broker.unregister_client(&client.client_id, client.session_id);
    // A client that took over the same device keeps it online
    if !broker.is_device_connected(&client.device_key) {
        broker.lifecycle.disconnected(&client.device_key);
    }

    info!(
        client_id = %client.client_id,
        device_id = %client.device_key,
        reason,
        "Device disconnected"
    );
}

async fn authenticate(
    broker: &Arc<DeviceBroker>,
    mut framed: DeviceStream,
    peer: SocketAddr,
    connect: ParsedConnect,
    shutdown: &CancellationToken,
) -> Option<ClientConnection> {
    info!(
        client_id = %connect.client_id,
        peer = %peer,
        protocol_version = connect.protocol_version,
        "MQTT CONNECT"
    );

    if connect.client_id.is_empty() && !connect.clean_session {
        warn!(peer = %peer, "Empty client id without clean session");
        let _ = framed
            .send(BrokerPacket::Connack(ConnackCode::IdentifierRejected))
            .await;
        return None;
    }

    let auth_result = broker.authenticator.authenticate(&connect);
    let device_key = match auth_result.device_key {
        Some(key) if auth_result.authenticated => key,
        _ => {
            warn!(
                client_id = %connect.client_id,
                peer = %peer,
                reason = ?auth_result.reason,
                "Authentication failed"
            );
            let _ = framed
                .send(BrokerPacket::Connack(ConnackCode::BadUsernamePassword))
                .await;
            return None;
        }
    };

    let client_id = if connect.client_id.is_empty() {
        format!("auto-{}", Uuid::new_v4().simple())
    } else {
        connect.client_id.clone()
    };

    let (downlink_tx, downlink_rx) = mpsc::channel(broker.config.client_queue_size.max(1));
    let kick = shutdown.child_token();
    let session_id = broker.next_id();

    let previous = broker.register_client(
        &client_id,
        ClientHandle {
            device_key: device_key.clone(),
            session_id,
            kick: kick.clone(),
            downlink: downlink_tx,
            down_qos: None,
        },
    );
    if let Some(previous) = previous {
        info!(client_id = %client_id, "Client id taken over by new connection");
        previous.cancel();
    }

    if let Err(e) = framed.send(BrokerPacket::Connack(ConnackCode::Accepted)).await {
        debug!(client_id = %client_id, error = %e, "Failed to send CONNACK");
        broker.unregister_client(&client_id, session_id);
        return None;
    }

    info!(client_id = %client_id, device_id = %device_key, "Device connected");

    let keep_alive = (connect.keep_alive > 0)
        .then(|| Duration::from_millis(u64::from(connect.keep_alive) * 1500));

    Some(ClientConnection {
        broker: broker.clone(),
        framed,
        client_id,
        device_key,
        session_id,
        kick,
        downlink: downlink_rx,
        keep_alive,
        last_seen: Instant::now(),
        awaiting_pubrel: HashSet::new(),
        next_packet_id: 1,
    })
}

/// An authenticated device connection
struct ClientConnection {
    broker: Arc<DeviceBroker>,
    framed: DeviceStream,
    client_id: String,
    device_key: String,
    session_id: u64,
    kick: CancellationToken,
    downlink: mpsc::Receiver<Downlink>,
    /// 1.5x the client's keep-alive, `None` when disabled
    keep_alive: Option<Duration>,
    last_seen: Instant,
    /// Inbound QoS 2 packet ids between PUBREC and PUBREL
    awaiting_pubrel: HashSet<u16>,
    next_packet_id: u16,
}

impl ClientConnection {
    async fn run(&mut self) -> Result<&'static str, CodecError> {
        loop {
            let deadline = self.keep_alive.map(|d| self.last_seen + d);

            tokio::select! {
                _ = self.kick.cancelled() => return Ok("kicked"),

                frame = self.framed.next() => {
                    let packet = match frame {
                        Some(packet) => packet?,
                        None => return Ok("connection closed"),
                    };
                    self.last_seen = Instant::now();
                    if let Flow::Close(reason) = self.handle_packet(packet).await? {
                        return Ok(reason);
                    }
                }

                Some(downlink) = self.downlink.recv() => {
                    self.deliver(downlink).await?;
                }

                _ = sleep_until_deadline(deadline) => return Ok("keep-alive timeout"),
            }
        }
    }

    async fn handle_packet(&mut self, packet: MqttPacket) -> Result<Flow, CodecError> {
        if self.broker.log_packets {
            debug!(
                client_id = %self.client_id,
                packet = packet.packet_type().as_str(),
                "MQTT packet"
            );
        }

        match packet {
            MqttPacket::Publish(publish) => self.handle_publish(publish).await,
            MqttPacket::Pubrel(pid) => {
                self.awaiting_pubrel.remove(&pid);
                self.framed.send(BrokerPacket::Pubcomp(pid)).await?;
                Ok(Flow::Continue)
            }
            MqttPacket::Subscribe(subscribe) => self.handle_subscribe(subscribe).await,
            MqttPacket::Unsubscribe(unsubscribe) => self.handle_unsubscribe(unsubscribe).await,
            MqttPacket::PingReq => {
                self.framed.send(BrokerPacket::Pingresp).await?;
                Ok(Flow::Continue)
            }
            MqttPacket::Disconnect => Ok(Flow::Close("client disconnect")),
            // Acks for QoS 1 downlinks; nothing is retransmitted
            MqttPacket::Puback(_) | MqttPacket::Pubrec(_) | MqttPacket::Pubcomp(_) => {
                Ok(Flow::Continue)
            }
            MqttPacket::PingResp => Ok(Flow::Continue),
            MqttPacket::Connect(_) => Ok(Flow::Close("second CONNECT")),
            MqttPacket::Other(kind) => {
                warn!(
                    client_id = %self.client_id,
                    packet = kind.as_str(),
                    "Unexpected packet from device"
                );
                Ok(Flow::Close("protocol violation"))
            }
        }
    }

    async fn handle_publish(&mut self, publish: ParsedPublish) -> Result<Flow, CodecError> {
        debug!(
            client_id = %self.client_id,
            topic = %publish.topic,
            qos = publish.qos,
            size = publish.payload.len(),
            "MQTT PUBLISH"
        );

        // Retransmitted QoS 2 publish already handed on
        if let Some(pid) = publish.packet_id {
            if publish.qos == 2 && self.awaiting_pubrel.contains(&pid) {
                self.framed.send(BrokerPacket::Pubrec(pid)).await?;
                return Ok(Flow::Continue);
            }
        }

        let acl_result = self.broker.acl.can_publish(&self.device_key, &publish.topic);

        if !acl_result.allowed {
            warn!(
                client_id = %self.client_id,
                device_id = %self.device_key,
                topic = %publish.topic,
                reason = %acl_result.reason,
                "PUBLISH denied by ACL"
            );
            // No negative ack exists for QoS 0, and a QoS >= 1 sender would retry forever
            return Ok(if publish.qos == 0 {
                Flow::Continue
            } else {
                Flow::Close("publish denied")
            });
        }

        let kind = DeviceTopic::parse(&publish.topic).map_or(TopicKind::Up, |t| t.kind);
        self.broker.on_published(
            &self.device_key,
            &publish.topic,
            kind,
            Bytes::from(publish.payload),
        );

        match (publish.qos, publish.packet_id) {
            (1, Some(pid)) => self.framed.send(BrokerPacket::Puback(pid)).await?,
            (2, Some(pid)) => {
                self.awaiting_pubrel.insert(pid);
                self.framed.send(BrokerPacket::Pubrec(pid)).await?;
            }
            _ => {}
        }

        Ok(Flow::Continue)
    }

    async fn handle_subscribe(&mut self, subscribe: ParsedSubscribe) -> Result<Flow, CodecError> {
        let mut granted = Vec::with_capacity(subscribe.subscriptions.len());
        let mut down_qos = None;

        for sub in &subscribe.subscriptions {
            let acl_result = self.broker.acl.can_subscribe(&self.device_key, &sub.topic_filter);

            let qos = acl_result.granted_qos(sub.qos);
            match qos {
                Some(qos) => down_qos = Some(qos),
                None => warn!(
                    client_id = %self.client_id,
                    topic = %sub.topic_filter,
                    reason = %acl_result.reason,
                    "SUBSCRIBE denied by ACL"
                ),
            }
            granted.push(qos);
        }

        if down_qos.is_some() {
            self.broker
                .set_down_qos(&self.client_id, self.session_id, down_qos);
            debug!(client_id = %self.client_id, qos = ?down_qos, "Subscribed to downlink");
        }

        self.framed
            .send(BrokerPacket::Suback {
                packet_id: subscribe.packet_id,
                granted,
            })
            .await?;
        Ok(Flow::Continue)
    }

    async fn handle_unsubscribe(
        &mut self,
        unsubscribe: ParsedUnsubscribe,
    ) -> Result<Flow, CodecError> {
        let own = device_topic(&self.device_key, TopicKind::Down);
        if unsubscribe.topics.iter().any(|t| *t == own) {
            self.broker.set_down_qos(&self.client_id, self.session_id, None);
        }

        self.framed
            .send(BrokerPacket::Unsuback(unsubscribe.packet_id))
            .await?;
        Ok(Flow::Continue)
    }

    async fn deliver(&mut self, downlink: Downlink) -> Result<(), CodecError> {
        let packet_id = (downlink.qos > 0).then(|| self.allocate_packet_id());
        self.framed
            .send(BrokerPacket::Publish {
                topic: downlink.topic,
                payload: downlink.payload,
                qos: downlink.qos,
                packet_id,
            })
            .await
    }

    fn allocate_packet_id(&mut self) -> u16 {
        let id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.checked_add(1).unwrap_or(1);
        id
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
