//! Broker Session
//!
//! One live connection to one remote broker. `open` performs the TCP connect,
//! CONNECT/CONNACK handshake and SUBSCRIBE, then hands the connection to a
//! spawned task that delivers PUBLISH payloads to a callback, keeps the
//! connection alive, and reconnects after a drop.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::codec::{frame_length, Decoder, Encoder};
use crate::config::BrokerConfig;
use crate::protocol::{
    Connect, DecodeError, Disconnect, EncodeError, Packet, PubAck, QoS, ReasonCode, Subscribe,
    Subscription,
};

/// Lower bound on the delay between reconnect attempts
const MIN_RECONNECT_INTERVAL: Duration = Duration::from_millis(100);

/// Callback for PUBLISH messages: `(topic, payload)`
pub type MessageCallback = Arc<dyn Fn(&str, Bytes) + Send + Sync>;

/// Connection status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Initial handshake in progress
    Connecting,
    /// Connected and subscribed
    Connected,
    /// Connection lost, waiting to reconnect
    Reconnecting,
    /// Closed, or lost with reconnect disabled
    Disconnected,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Connecting => write!(f, "connecting"),
            SessionStatus::Connected => write!(f, "connected"),
            SessionStatus::Reconnecting => write!(f, "reconnecting"),
            SessionStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Failure to establish a broker connection
#[derive(Debug)]
pub enum ConnectError {
    /// Address could not be parsed
    InvalidAddress(&'static str),
    /// Network error
    Io(std::io::Error),
    /// Handshake did not finish within `connect_timeout`
    Timeout,
    /// Broker answered CONNACK with a failure code
    Refused(ReasonCode),
    /// Broker sent something other than the expected packet
    Protocol(String),
    Encode(EncodeError),
    Decode(DecodeError),
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectError::InvalidAddress(reason) => write!(f, "invalid address: {}", reason),
            ConnectError::Io(e) => write!(f, "I/O error: {}", e),
            ConnectError::Timeout => write!(f, "connection timed out"),
            ConnectError::Refused(code) => write!(f, "connection refused by broker: {}", code),
            ConnectError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            ConnectError::Encode(e) => write!(f, "encode error: {}", e),
            ConnectError::Decode(e) => write!(f, "decode error: {}", e),
        }
    }
}

impl std::error::Error for ConnectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectError::Io(e) => Some(e),
            ConnectError::Encode(e) => Some(e),
            ConnectError::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConnectError {
    fn from(e: std::io::Error) -> Self {
        ConnectError::Io(e)
    }
}

impl From<EncodeError> for ConnectError {
    fn from(e: EncodeError) -> Self {
        ConnectError::Encode(e)
    }
}

impl From<DecodeError> for ConnectError {
    fn from(e: DecodeError) -> Self {
        ConnectError::Decode(e)
    }
}

/// Message to the session task
#[derive(Debug)]
enum SessionCommand {
    /// Send DISCONNECT and stop, without reconnecting
    Shutdown,
}

/// Why the message loop returned
enum RunExit {
    Shutdown,
    Lost(String),
}

/// An established, subscribed connection
struct Connection {
    read_half: OwnedReadHalf,
    write_half: OwnedWriteHalf,
    encoder: Encoder,
    decoder: Decoder,
    read_buf: BytesMut,
    write_buf: BytesMut,
    /// PINGREQ sent with nothing received since
    ping_outstanding: bool,
    /// Bytes of an oversized packet still to be thrown away
    discard: usize,
}

impl Connection {
    async fn send(&mut self, packet: &Packet) -> Result<(), ConnectError> {
        self.write_buf.clear();
        self.encoder.encode(packet, &mut self.write_buf)?;
        self.write_half.write_all(&self.write_buf).await?;
        Ok(())
    }

    /// Read until one complete packet is buffered and return it
    async fn recv(&mut self) -> Result<Packet, ConnectError> {
        loop {
            if let Some((packet, consumed)) = self.decoder.decode(&self.read_buf)? {
                self.read_buf.advance(consumed);
                return Ok(packet);
            }
            let n = self.read_half.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(ConnectError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed by broker",
                )));
            }
        }
    }
}

/// A live connection to one broker
#[derive(Debug)]
pub struct BrokerSession {
    config: BrokerConfig,
    status: Arc<RwLock<SessionStatus>>,
    command_tx: Option<mpsc::Sender<SessionCommand>>,
    task: Option<JoinHandle<()>>,
}

impl BrokerSession {
    /// Connect, subscribe and start delivering messages to `on_message`
    ///
    /// Returns once the broker accepted the connection and the SUBSCRIBE has
    /// been written. SUBACK is handled by the session task.
    pub async fn open(
        config: BrokerConfig,
        on_message: MessageCallback,
    ) -> Result<Self, ConnectError> {
        let status = Arc::new(RwLock::new(SessionStatus::Connecting));
        debug!("Broker '{}': Connecting", config.address);

        let conn = Self::establish(&config).await?;
        *status.write() = SessionStatus::Connected;
        info!(
            "Broker '{}': Connected, subscribed to {} topics",
            config.address,
            config.topics.len()
        );

        let (command_tx, command_rx) = mpsc::channel(1);
        let task = tokio::spawn(Self::session_task(
            config.clone(),
            status.clone(),
            conn,
            command_rx,
            on_message,
        ));

        Ok(Self {
            config,
            status,
            command_tx: Some(command_tx),
            task: Some(task),
        })
    }

    /// Close the session without waiting for it
    ///
    /// The task gets `disconnect_grace` to send DISCONNECT before it is
    /// aborted. Closing twice is a no-op.
    pub fn close(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        *self.status.write() = SessionStatus::Disconnected;

        let requested = self
            .command_tx
            .take()
            .is_some_and(|tx| tx.try_send(SessionCommand::Shutdown).is_ok());
        if !requested || task.is_finished() {
            task.abort();
            return;
        }

        let grace = self.config.disconnect_grace;
        let address = self.config.address.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let abort = task.abort_handle();
                handle.spawn(async move {
                    if timeout(grace, task).await.is_err() {
                        debug!("Broker '{}': Disconnect grace expired, aborting", address);
                        abort.abort();
                    }
                });
            }
            Err(_) => task.abort(),
        }
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.read()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == SessionStatus::Connected
    }

    pub fn address(&self) -> &str {
        &self.config.address
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Run the whole handshake under `connect_timeout`
    async fn establish(config: &BrokerConfig) -> Result<Connection, ConnectError> {
        timeout(config.connect_timeout, Self::handshake(config))
            .await
            .map_err(|_| ConnectError::Timeout)?
    }

    async fn handshake(config: &BrokerConfig) -> Result<Connection, ConnectError> {
        let (host, port) = config
            .parse_address()
            .map_err(ConnectError::InvalidAddress)?;

        let stream = TcpStream::connect((host.as_str(), port)).await?;
        stream.set_nodelay(true)?;
        debug!("Broker '{}': TCP connected", config.address);

        let mut decoder = Decoder::new().with_max_packet_size(config.max_packet_size);
        decoder.set_protocol_version(config.protocol_version);
        let (read_half, write_half) = stream.into_split();
        let mut conn = Connection {
            read_half,
            write_half,
            encoder: Encoder::new(config.protocol_version),
            decoder,
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(256),
            ping_outstanding: false,
            discard: 0,
        };

        let connect = Packet::Connect(Box::new(Connect {
            protocol_version: config.protocol_version,
            client_id: config.client_id.clone(),
            clean_start: config.clean_session,
            keep_alive: config.keepalive,
            username: config.effective_username().map(str::to_string),
            password: config
                .effective_password()
                .map(|p| Bytes::copy_from_slice(p.as_bytes())),
            max_packet_size: Some(u32::try_from(config.max_packet_size).unwrap_or(u32::MAX)),
        }));
        conn.send(&connect).await?;

        match conn.recv().await? {
            Packet::ConnAck(connack) => {
                if connack.reason_code != ReasonCode::Success {
                    return Err(ConnectError::Refused(connack.reason_code));
                }
                debug!(
                    "Broker '{}': CONNACK received (session_present={})",
                    config.address, connack.session_present
                );
            }
            other => {
                return Err(ConnectError::Protocol(format!(
                    "expected CONNACK, got packet type {}",
                    other.packet_type()
                )));
            }
        }

        if !config.topics.is_empty() {
            let subscribe = Packet::Subscribe(Subscribe {
                packet_id: 1,
                subscriptions: config
                    .topics
                    .iter()
                    .map(|filter| Subscription {
                        filter: filter.clone(),
                        qos: QoS::AtMostOnce,
                    })
                    .collect(),
            });
            conn.send(&subscribe).await?;
        }

        Ok(conn)
    }

    /// Drive one connection after another until shut down
    async fn session_task(
        config: BrokerConfig,
        status: Arc<RwLock<SessionStatus>>,
        mut conn: Connection,
        mut command_rx: mpsc::Receiver<SessionCommand>,
        on_message: MessageCallback,
    ) {
        loop {
            match Self::run(&config, &mut conn, &mut command_rx, &on_message).await {
                RunExit::Shutdown => {
                    info!("Broker '{}': Disconnected", config.address);
                    *status.write() = SessionStatus::Disconnected;
                    return;
                }
                RunExit::Lost(reason) => {
                    warn!("Broker '{}': Connection lost: {}", config.address, reason);
                    if !config.auto_reconnect {
                        *status.write() = SessionStatus::Disconnected;
                        return;
                    }
                }
            }

            *status.write() = SessionStatus::Reconnecting;
            conn = match Self::reconnect(&config, &mut command_rx).await {
                Some(conn) => conn,
                None => {
                    debug!("Broker '{}': Shutdown during reconnect", config.address);
                    *status.write() = SessionStatus::Disconnected;
                    return;
                }
            };
            *status.write() = SessionStatus::Connected;
            info!("Broker '{}': Reconnected", config.address);
        }
    }

    /// Retry with exponential backoff; `None` if shut down meanwhile
    async fn reconnect(
        config: &BrokerConfig,
        command_rx: &mut mpsc::Receiver<SessionCommand>,
    ) -> Option<Connection> {
        let max_interval = config.max_reconnect_interval.max(MIN_RECONNECT_INTERVAL);
        let mut retry_interval = config.reconnect_interval.max(MIN_RECONNECT_INTERVAL);

        loop {
            debug!(
                "Broker '{}': Reconnecting in {:?}",
                config.address, retry_interval
            );
            tokio::select! {
                _ = tokio::time::sleep(retry_interval) => {}
                _ = command_rx.recv() => return None,
            }

            tokio::select! {
                result = Self::establish(config) => match result {
                    Ok(conn) => return Some(conn),
                    Err(e) => {
                        warn!("Broker '{}': Reconnect failed: {}", config.address, e);
                        retry_interval = std::cmp::min(retry_interval * 2, max_interval);
                    }
                },
                _ = command_rx.recv() => return None,
            }
        }
    }

    /// Message loop for one connection
    async fn run(
        config: &BrokerConfig,
        conn: &mut Connection,
        command_rx: &mut mpsc::Receiver<SessionCommand>,
        on_message: &MessageCallback,
    ) -> RunExit {
        // Bytes that arrived together with CONNACK
        if let Err(reason) = Self::process_packets(config, conn, on_message).await {
            return RunExit::Lost(reason);
        }

        let keepalive_enabled = config.keepalive > 0;
        let keepalive_interval = Duration::from_secs(u64::from(config.keepalive.max(1)));
        let mut keepalive_timer = tokio::time::interval(keepalive_interval);
        keepalive_timer.reset();

        loop {
            tokio::select! {
                // Shutdown requested, or the session handle is gone
                _ = command_rx.recv() => {
                    Self::send_disconnect(config, conn).await;
                    return RunExit::Shutdown;
                }

                result = conn.read_half.read_buf(&mut conn.read_buf) => {
                    match result {
                        Ok(0) => return RunExit::Lost("connection closed by broker".to_string()),
                        Ok(_) => {}
                        Err(e) => return RunExit::Lost(e.to_string()),
                    }
                    if let Err(reason) = Self::process_packets(config, conn, on_message).await {
                        return RunExit::Lost(reason);
                    }
                }

                _ = keepalive_timer.tick(), if keepalive_enabled => {
                    if conn.ping_outstanding {
                        return RunExit::Lost("keepalive timeout".to_string());
                    }
                    if let Err(e) = conn.send(&Packet::PingReq).await {
                        return RunExit::Lost(e.to_string());
                    }
                    conn.ping_outstanding = true;
                    trace!("Broker '{}': PINGREQ sent", config.address);
                }
            }
        }
    }

    /// Handle every complete packet in the read buffer
    async fn process_packets(
        config: &BrokerConfig,
        conn: &mut Connection,
        on_message: &MessageCallback,
    ) -> Result<(), String> {
        loop {
            if conn.discard > 0 {
                let n = conn.discard.min(conn.read_buf.len());
                conn.read_buf.advance(n);
                conn.discard -= n;
                conn.ping_outstanding = false;
                if conn.discard > 0 {
                    return Ok(());
                }
            }

            let (packet, consumed) = match conn.decoder.decode(&conn.read_buf) {
                Ok(Some(decoded)) => decoded,
                Ok(None) => return Ok(()),
                Err(DecodeError::PacketTooLarge) => {
                    let len = match frame_length(&conn.read_buf) {
                        Ok(Some(len)) => len,
                        Ok(None) => return Ok(()),
                        Err(e) => return Err(format!("decode error: {}", e)),
                    };
                    warn!(
                        "Broker '{}': Skipping {} byte packet, above max_packet_size {}",
                        config.address, len, config.max_packet_size
                    );
                    conn.discard = len;
                    continue;
                }
                Err(e) => return Err(format!("decode error: {}", e)),
            };
            conn.read_buf.advance(consumed);
            conn.ping_outstanding = false;

            match packet {
                Packet::Publish(publish) => {
                    trace!(
                        "Broker '{}': PUBLISH on '{}' ({} bytes)",
                        config.address,
                        publish.topic,
                        publish.payload.len()
                    );
                    on_message(&publish.topic, publish.payload);

                    match (publish.qos, publish.packet_id) {
                        (QoS::AtLeastOnce, Some(packet_id)) => {
                            conn.send(&Packet::PubAck(PubAck::new(packet_id)))
                                .await
                                .map_err(|e| e.to_string())?;
                        }
                        (QoS::ExactlyOnce, _) => {
                            debug!(
                                "Broker '{}': Ignoring QoS 2 flow for '{}'",
                                config.address, publish.topic
                            );
                        }
                        _ => {}
                    }
                }
                Packet::SubAck(suback) => {
                    for (filter, code) in config.topics.iter().zip(&suback.reason_codes) {
                        if code.is_error() {
                            warn!(
                                "Broker '{}': Subscription to '{}' rejected: {}",
                                config.address, filter, code
                            );
                        }
                    }
                    debug!("Broker '{}': SUBACK received", config.address);
                }
                Packet::PingResp => {
                    trace!("Broker '{}': PINGRESP received", config.address);
                }
                Packet::Disconnect(disconnect) => {
                    return Err(format!(
                        "broker sent DISCONNECT ({})",
                        disconnect.reason_code
                    ));
                }
                other => {
                    debug!(
                        "Broker '{}': Ignoring unexpected packet type {}",
                        config.address,
                        other.packet_type()
                    );
                }
            }
        }
    }

    async fn send_disconnect(config: &BrokerConfig, conn: &mut Connection) {
        let disconnect = Packet::Disconnect(Disconnect {
            reason_code: ReasonCode::Success,
        });
        match timeout(config.disconnect_grace, conn.send(&disconnect)).await {
            Ok(Ok(())) => {
                let _ = conn.write_half.shutdown().await;
            }
            Ok(Err(e)) => debug!("Broker '{}': DISCONNECT failed: {}", config.address, e),
            Err(_) => debug!("Broker '{}': DISCONNECT timed out", config.address),
        }
    }
}

impl Drop for BrokerSession {
    fn drop(&mut self) {
        self.close();
    }
}
