//! In-process MQTT broker for integration tests
//!
//! Speaks just enough MQTT (through the crate's own codec) to accept
//! connections, record CONNECT/SUBSCRIBE/PUBACK/DISCONNECT, answer pings and
//! route publishes to matching subscribers.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use mqtt_notify::codec::{Decoder, Encoder};
use mqtt_notify::protocol::{
    ConnAck, Connect, Packet, ProtocolVersion, Publish, QoS, ReasonCode, SubAck, Subscribe,
};
use mqtt_notify::topic::topic_matches_filter;

enum Outbound {
    Packet(Packet),
    Close,
}

struct Client {
    id: usize,
    filters: Vec<String>,
    tx: mpsc::UnboundedSender<Outbound>,
}

#[derive(Default)]
struct State {
    clients: Mutex<Vec<Client>>,
    connects: Mutex<Vec<Connect>>,
    subscribes: Mutex<Vec<Subscribe>>,
    pubacks: Mutex<Vec<u16>>,
    disconnects: AtomicUsize,
    next_id: AtomicUsize,
    connack_code: Mutex<ReasonCode>,
}

pub struct FakeBroker {
    addr: SocketAddr,
    state: Arc<State>,
    task: JoinHandle<()>,
}

impl FakeBroker {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(State::default());

        let accept_state = state.clone();
        let task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let state = accept_state.clone();
                tokio::spawn(handle_connection(socket, state));
            }
        });

        Self { addr, state, task }
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    /// Answer future CONNECTs with `code`
    pub fn refuse_with(&self, code: ReasonCode) {
        *self.state.connack_code.lock() = code;
    }

    /// Send a QoS 0 publish to every subscriber with a matching filter
    pub fn publish(&self, topic: &str, payload: &[u8]) -> usize {
        self.route(topic, payload, QoS::AtMostOnce, None, false)
    }

    /// Send a QoS 1 publish to every subscriber with a matching filter
    pub fn publish_qos1(&self, topic: &str, payload: &[u8], packet_id: u16) -> usize {
        self.route(topic, payload, QoS::AtLeastOnce, Some(packet_id), false)
    }

    /// Send a publish to every connected client, subscribed or not
    pub fn publish_to_all(&self, topic: &str, payload: &[u8]) -> usize {
        self.route(topic, payload, QoS::AtMostOnce, None, true)
    }

    fn route(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        packet_id: Option<u16>,
        everyone: bool,
    ) -> usize {
        let clients = self.state.clients.lock();
        let mut sent = 0;
        for client in clients.iter() {
            let matches = everyone
                || client
                    .filters
                    .iter()
                    .any(|f| topic_matches_filter(topic, f));
            if matches {
                let publish = Packet::Publish(Publish {
                    qos,
                    topic: topic.to_string(),
                    packet_id,
                    payload: Bytes::copy_from_slice(payload),
                    ..Default::default()
                });
                if client.tx.send(Outbound::Packet(publish)).is_ok() {
                    sent += 1;
                }
            }
        }
        sent
    }

    /// Drop every client connection without a DISCONNECT
    pub fn kick_all(&self) {
        for client in self.state.clients.lock().iter() {
            let _ = client.tx.send(Outbound::Close);
        }
    }

    pub fn client_count(&self) -> usize {
        self.state.clients.lock().len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.state
            .clients
            .lock()
            .iter()
            .filter(|c| !c.filters.is_empty())
            .count()
    }

    pub fn connects(&self) -> Vec<Connect> {
        self.state.connects.lock().clone()
    }

    pub fn subscribes(&self) -> Vec<Subscribe> {
        self.state.subscribes.lock().clone()
    }

    pub fn pubacks(&self) -> Vec<u16> {
        self.state.pubacks.lock().clone()
    }

    pub fn disconnect_count(&self) -> usize {
        self.state.disconnects.load(Ordering::SeqCst)
    }

    /// Poll until `check` holds, panicking after five seconds
    pub async fn wait_until(&self, what: &str, check: impl Fn(&Self) -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !check(self) {
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {}", what);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn wait_for_subscribers(&self, n: usize) {
        self.wait_until(&format!("{} subscribers", n), |b| b.subscriber_count() >= n)
            .await;
    }
}

impl Drop for FakeBroker {
    fn drop(&mut self) {
        self.task.abort();
        self.kick_all();
    }
}

async fn handle_connection(socket: TcpStream, state: Arc<State>) {
    let id = state.next_id.fetch_add(1, Ordering::SeqCst);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (mut rd, mut wr) = socket.into_split();

    let mut decoder = Decoder::new();
    let mut encoder = Encoder::new(ProtocolVersion::V311);
    let mut read_buf = BytesMut::with_capacity(4096);
    let mut write_buf = BytesMut::new();
    let mut registered = false;

    'conn: loop {
        tokio::select! {
            outbound = rx.recv() => {
                let packet = match outbound {
                    Some(Outbound::Packet(packet)) => packet,
                    Some(Outbound::Close) | None => break 'conn,
                };
                write_buf.clear();
                encoder.encode(&packet, &mut write_buf).unwrap();
                if wr.write_all(&write_buf).await.is_err() {
                    break 'conn;
                }
            }

            result = rd.read_buf(&mut read_buf) => {
                match result {
                    Ok(0) | Err(_) => break 'conn,
                    Ok(_) => {}
                }

                while let Ok(Some((packet, consumed))) = decoder.decode(&read_buf) {
                    read_buf.advance(consumed);
                    let reply = match packet {
                        Packet::Connect(connect) => {
                            encoder.set_protocol_version(connect.protocol_version);
                            state.connects.lock().push((*connect).clone());
                            let reason_code = *state.connack_code.lock();
                            if reason_code == ReasonCode::Success && !registered {
                                state.clients.lock().push(Client {
                                    id,
                                    filters: Vec::new(),
                                    tx: tx.clone(),
                                });
                                registered = true;
                            }
                            Some(Packet::ConnAck(ConnAck {
                                session_present: false,
                                reason_code,
                            }))
                        }
                        Packet::Subscribe(subscribe) => {
                            let filters: Vec<String> = subscribe
                                .subscriptions
                                .iter()
                                .map(|s| s.filter.clone())
                                .collect();
                            if let Some(client) =
                                state.clients.lock().iter_mut().find(|c| c.id == id)
                            {
                                client.filters.extend(filters);
                            }
                            let reason_codes =
                                vec![ReasonCode::Success; subscribe.subscriptions.len()];
                            let packet_id = subscribe.packet_id;
                            state.subscribes.lock().push(subscribe);
                            Some(Packet::SubAck(SubAck {
                                packet_id,
                                reason_codes,
                            }))
                        }
                        Packet::PubAck(puback) => {
                            state.pubacks.lock().push(puback.packet_id);
                            None
                        }
                        Packet::PingReq => Some(Packet::PingResp),
                        Packet::Disconnect(_) => {
                            state.disconnects.fetch_add(1, Ordering::SeqCst);
                            break 'conn;
                        }
                        _ => None,
                    };

                    if let Some(reply) = reply {
                        write_buf.clear();
                        encoder.encode(&reply, &mut write_buf).unwrap();
                        if wr.write_all(&write_buf).await.is_err() {
                            break 'conn;
                        }
                    }
                }
            }
        }
    }

    state.clients.lock().retain(|c| c.id != id);
}
