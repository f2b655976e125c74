//! Shard Connection State Machine
//!
//! Owns one WebSocket connection and everything scoped to it: the frame
//! codec, the send governor, the heartbeat loop, and the resumable session.
//! The shard is driven by commands from its owner and reports back over a
//! typed event channel.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use stratus_codec::{
    CompressionMode, EncodedFrame, Encoding, FrameCodec, Opcode, PackerFactory, ReceivePayload,
    SendPayload,
};

use crate::close::{CLOSE_ABNORMAL, CLOSE_NORMAL, CLOSE_RESUMING, is_resumable};
use crate::error::ShardError;
use crate::events::ShardEvent;
use crate::gate::IdentifyGate;
use crate::governor::SendGovernor;
use crate::session::SessionInfo;
use crate::status::ShardStatus;

/// Gateway protocol version requested in the connection URL.
pub const GATEWAY_VERSION: u8 = 10;

const FALLBACK_HEARTBEAT_INTERVAL_MS: u64 = 45_000;
const MAX_BACKOFF_SHIFT: u32 = 5;

/// Identify handshake properties reported to the gateway.
#[derive(Debug, Clone)]
pub struct IdentifyProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for IdentifyProperties {
    fn default() -> Self {
        IdentifyProperties {
            os: std::env::consts::OS.to_string(),
            browser: "stratus".to_string(),
            device: "stratus".to_string(),
        }
    }
}

/// Per-shard configuration, shared by every shard in the fleet.
#[derive(Clone)]
pub struct ShardConfig {
    pub token: String,
    pub intents: u64,
    pub shard_count: u16,
    pub gateway_url: String,
    pub encoding: Encoding,
    pub compression: CompressionMode,
    pub packer_factory: Option<PackerFactory>,
    pub properties: IdentifyProperties,
}

/// Build the connection URL for a gateway (or resume) base URL.
pub fn build_gateway_url(base: &str, encoding: Encoding, compression: CompressionMode) -> String {
    let mut url = format!(
        "{base}/?v={GATEWAY_VERSION}&encoding={}",
        encoding.as_str()
    );
    if compression == CompressionMode::Stream {
        url.push_str("&compress=zlib-stream");
    }
    url
}

#[derive(Debug)]
enum ShardCommand {
    Connect,
    Send(SendPayload),
    Destroy { code: u16 },
}

/// Handle to a running shard task.
pub struct Shard {
    id: u16,
    commands: mpsc::UnboundedSender<ShardCommand>,
}

impl Shard {
    /// Create the shard task. It stays `Idle` until [`Shard::connect`].
    pub fn spawn(
        id: u16,
        config: ShardConfig,
        gate: Arc<dyn IdentifyGate>,
        session: Option<SessionInfo>,
        events: mpsc::UnboundedSender<ShardEvent>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let runner = ShardRunner {
            id,
            config,
            gate,
            session,
            events,
            commands: commands_rx,
            status: ShardStatus::Idle,
            sequence: -1,
            close_sequence: 0,
            held: Vec::new(),
            destroying: false,
        };
        tokio::spawn(runner.run());
        Shard {
            id,
            commands: commands_tx,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    /// Start connecting. Idempotent once the connection loop is running.
    pub fn connect(&self) -> Result<(), ShardError> {
        self.commands
            .send(ShardCommand::Connect)
            .map_err(|_| ShardError::NotRunning)
    }

    /// Queue a payload for sending. Non-control payloads wait for readiness.
    pub fn send(&self, payload: SendPayload) -> Result<(), ShardError> {
        self.commands
            .send(ShardCommand::Send(payload))
            .map_err(|_| ShardError::NotRunning)
    }

    /// Close the connection and stop the shard task.
    pub fn destroy(&self, code: u16) -> Result<(), ShardError> {
        self.commands
            .send(ShardCommand::Destroy { code })
            .map_err(|_| ShardError::NotRunning)
    }
}

/// How a connection ended, deciding the next step of the outer loop.
enum ConnectionEnd {
    Reconnect { resume: bool },
    Stop,
}

/// What the select loop should do after handling one input.
enum LoopAction {
    Continue,
    Close { code: u16, resume: Option<bool> },
}

/// State scoped to a single connection attempt.
struct ConnState {
    heartbeat: Option<Interval>,
    last_ack: bool,
    last_beat: Option<Instant>,
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

enum Outbound {
    Frame(EncodedFrame),
    Close(u16),
}

type OutboundSender = mpsc::UnboundedSender<Outbound>;

struct ShardRunner {
    id: u16,
    config: ShardConfig,
    gate: Arc<dyn IdentifyGate>,
    session: Option<SessionInfo>,
    events: mpsc::UnboundedSender<ShardEvent>,
    commands: mpsc::UnboundedReceiver<ShardCommand>,
    status: ShardStatus,
    sequence: i64,
    close_sequence: i64,
    /// Non-control payloads held back until the shard reports ready
    held: Vec<SendPayload>,
    destroying: bool,
}

impl ShardRunner {
    async fn run(mut self) {
        // Idle until the owner asks for a connection.
        loop {
            match self.commands.recv().await {
                Some(ShardCommand::Connect) => break,
                Some(ShardCommand::Send(_)) => {
                    self.emit_error("SendError", "shard is not connected");
                }
                Some(ShardCommand::Destroy { .. }) | None => return,
            }
        }

        let mut attempts: u32 = 0;
        loop {
            match self.run_connection().await {
                Ok(ConnectionEnd::Stop) => break,
                Ok(ConnectionEnd::Reconnect { resume }) => {
                    attempts = 0;
                    tracing::info!(shard = self.id, resume, "reconnecting");
                }
                Err(err) => {
                    self.emit_error("ConnectionError", &err.to_string());
                    attempts = attempts.saturating_add(1);
                    let backoff = Duration::from_secs(1u64 << attempts.min(MAX_BACKOFF_SHIFT));
                    tracing::warn!(
                        shard = self.id,
                        "connection attempt failed, retrying in {backoff:?}"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
            if self.destroying {
                break;
            }
        }
        tracing::debug!(shard = self.id, "shard task exiting");
    }

    async fn run_connection(&mut self) -> Result<ConnectionEnd, ShardError> {
        self.status = if self.session.is_some() {
            ShardStatus::Reconnecting
        } else {
            ShardStatus::Connecting
        };
        self.held.clear();

        // The codec decides the effective encoding: a binary packer that
        // fails to initialize downgrades the whole connection to JSON.
        let mut codec = FrameCodec::new(
            self.config.encoding,
            self.config.compression,
            self.config.packer_factory.as_ref(),
        );
        let base = self
            .session
            .as_ref()
            .map(|session| session.resume_url.clone())
            .unwrap_or_else(|| self.config.gateway_url.clone());
        let url = build_gateway_url(&base, codec.encoding(), self.config.compression);
        tracing::debug!(shard = self.id, "connecting to {url}");

        let (stream, _) = connect_async(url.as_str()).await?;
        let (write, mut read) = stream.split();

        let (closed_tx, closed_rx) = watch::channel(false);
        let governor = Arc::new(SendGovernor::new(closed_rx));
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let pump = spawn_outbound_pump(write, out_rx, governor);

        let mut conn = ConnState {
            heartbeat: None,
            last_ack: true,
            last_beat: None,
        };

        let end = loop {
            tokio::select! {
                frame = read.next() => {
                    let (bytes, is_binary) = match frame {
                        Some(Ok(Message::Text(text))) => (text.as_bytes().to_vec(), false),
                        Some(Ok(Message::Binary(bytes))) => (bytes.to_vec(), true),
                        Some(Ok(Message::Close(close))) => {
                            let code = close
                                .map(|frame| u16::from(frame.code))
                                .unwrap_or(CLOSE_ABNORMAL);
                            break self.finish(code, None);
                        }
                        // Ping/pong are answered by the transport.
                        Some(Ok(_)) => continue,
                        Some(Err(err)) => {
                            self.emit_error("TransportError", &err.to_string());
                            break self.finish(CLOSE_ABNORMAL, None);
                        }
                        None => break self.finish(CLOSE_ABNORMAL, None),
                    };
                    let action = match codec.decode(&bytes, is_binary) {
                        Ok(Some(payload)) => {
                            self.handle_payload(payload, &codec, &out_tx, &mut conn).await
                        }
                        Ok(None) => LoopAction::Continue,
                        Err(err) => {
                            // Decode failures are shard errors, not connection-fatal.
                            self.emit_error("CodecError", &err.to_string());
                            LoopAction::Continue
                        }
                    };
                    if let LoopAction::Close { code, resume } = action {
                        let _ = closed_tx.send(true);
                        let _ = out_tx.send(Outbound::Close(code));
                        break self.finish(code, resume);
                    }
                }
                command = self.commands.recv() => match command {
                    Some(ShardCommand::Send(payload)) => {
                        self.enqueue(payload, &codec, &out_tx);
                    }
                    Some(ShardCommand::Connect) => {}
                    Some(ShardCommand::Destroy { code }) => {
                        self.destroying = true;
                        let _ = closed_tx.send(true);
                        let _ = out_tx.send(Outbound::Close(code));
                        break self.finish(code, Some(false));
                    }
                    None => {
                        self.destroying = true;
                        let _ = closed_tx.send(true);
                        let _ = out_tx.send(Outbound::Close(CLOSE_NORMAL));
                        break self.finish(CLOSE_NORMAL, Some(false));
                    }
                },
                _ = tick(&mut conn.heartbeat) => {
                    if !conn.last_ack {
                        tracing::warn!(
                            shard = self.id,
                            "missed heartbeat ack, closing zombie connection"
                        );
                        let _ = closed_tx.send(true);
                        let _ = out_tx.send(Outbound::Close(CLOSE_RESUMING));
                        break self.finish(CLOSE_RESUMING, Some(true));
                    }
                    conn.last_ack = false;
                    conn.last_beat = Some(Instant::now());
                    let heartbeat = self.heartbeat_payload();
                    self.enqueue(heartbeat, &codec, &out_tx);
                }
            }
        };

        let _ = closed_tx.send(true);
        drop(out_tx);
        let _ = pump.await;
        Ok(end)
    }

    async fn handle_payload(
        &mut self,
        payload: ReceivePayload,
        codec: &FrameCodec,
        out: &OutboundSender,
        conn: &mut ConnState,
    ) -> LoopAction {
        match payload.op {
            Opcode::Hello => {
                let interval_ms = payload
                    .d
                    .get("heartbeat_interval")
                    .and_then(Value::as_u64)
                    .unwrap_or(FALLBACK_HEARTBEAT_INTERVAL_MS);
                let period = Duration::from_millis(interval_ms);
                let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
                heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
                conn.heartbeat = Some(heartbeat);

                if let Some(session) = self.session.clone() {
                    tracing::debug!(shard = self.id, "resuming session {}", session.session_id);
                    let resume = resume_payload(&self.config.token, &session);
                    self.enqueue(resume, codec, out);
                } else {
                    // The identify grant may outlast the heartbeat interval
                    // when many shards share a bucket; keep heartbeating
                    // while the wait is pending. Acks are not read here, so
                    // zombie detection stays out of this loop.
                    let gate = Arc::clone(&self.gate);
                    let mut wait = gate.wait_to_identify(self.id);
                    loop {
                        tokio::select! {
                            _ = &mut wait => break,
                            _ = tick(&mut conn.heartbeat) => {
                                conn.last_beat = Some(Instant::now());
                                let heartbeat = self.heartbeat_payload();
                                self.enqueue(heartbeat, codec, out);
                            }
                        }
                    }
                    let identify = self.identify_payload();
                    self.enqueue(identify, codec, out);
                }
                LoopAction::Continue
            }
            Opcode::Heartbeat => {
                // Server-requested immediate heartbeat.
                let heartbeat = self.heartbeat_payload();
                self.enqueue(heartbeat, codec, out);
                LoopAction::Continue
            }
            Opcode::HeartbeatAck => {
                conn.last_ack = true;
                if let Some(at) = conn.last_beat {
                    self.emit(ShardEvent::HeartbeatComplete {
                        latency_ms: at.elapsed().as_millis() as u64,
                    });
                }
                LoopAction::Continue
            }
            Opcode::Reconnect => LoopAction::Close {
                code: CLOSE_RESUMING,
                resume: Some(true),
            },
            Opcode::InvalidSession => {
                let resumable = payload.d.as_bool().unwrap_or(false);
                if resumable {
                    LoopAction::Close {
                        code: CLOSE_RESUMING,
                        resume: Some(true),
                    }
                } else {
                    self.session = None;
                    self.emit(ShardEvent::SessionUpdate { session: None });
                    LoopAction::Close {
                        code: CLOSE_NORMAL,
                        resume: Some(false),
                    }
                }
            }
            Opcode::Dispatch => {
                self.handle_dispatch(payload, codec, out);
                LoopAction::Continue
            }
            _ => LoopAction::Continue,
        }
    }

    fn handle_dispatch(
        &mut self,
        payload: ReceivePayload,
        codec: &FrameCodec,
        out: &OutboundSender,
    ) {
        // Monotonic: stale and duplicate sequence numbers are ignored.
        if let Some(seq) = payload.s
            && (seq as i64) > self.sequence
        {
            self.sequence = seq as i64;
        }

        match payload.event_name() {
            Some("READY") => {
                let session_id = payload
                    .d
                    .get("session_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let resume_url = payload
                    .d
                    .get("resume_gateway_url")
                    .and_then(Value::as_str)
                    .unwrap_or(&self.config.gateway_url)
                    .to_string();
                self.session = Some(SessionInfo {
                    session_id,
                    resume_url,
                    sequence: self.sequence,
                    shard_id: self.id,
                    shard_count: self.config.shard_count,
                });
                self.emit(ShardEvent::SessionUpdate {
                    session: self.session.clone(),
                });
                self.mark_ready(codec, out);
            }
            Some("RESUMED") => {
                let replayed = self.sequence - self.close_sequence;
                tracing::debug!(shard = self.id, "resumed, replayed {replayed} events");
                self.emit(ShardEvent::Resumed { replayed });
                self.mark_ready(codec, out);
            }
            _ => {}
        }

        self.emit(ShardEvent::Dispatch { payload });
    }

    fn mark_ready(&mut self, codec: &FrameCodec, out: &OutboundSender) {
        self.status = ShardStatus::Ready;
        for payload in std::mem::take(&mut self.held) {
            self.enqueue(payload, codec, out);
        }
    }

    /// Record the close, decide resume vs. re-identify vs. stop.
    fn finish(&mut self, code: u16, resume_hint: Option<bool>) -> ConnectionEnd {
        if self.sequence != -1 {
            self.close_sequence = self.sequence;
        }
        if let Some(session) = &mut self.session {
            session.sequence = self.sequence;
        }
        self.sequence = -1;
        if self.session.is_some() {
            // Hand the refreshed session to the owner for persistence.
            self.emit(ShardEvent::SessionUpdate {
                session: self.session.clone(),
            });
        }
        self.emit(ShardEvent::Closed { code });

        if self.destroying {
            self.status = ShardStatus::Disconnected;
            return ConnectionEnd::Stop;
        }

        let resume = resume_hint.unwrap_or_else(|| is_resumable(code)) && self.session.is_some();
        if resume {
            self.status = ShardStatus::Reconnecting;
            ConnectionEnd::Reconnect { resume: true }
        } else {
            if self.session.take().is_some() {
                self.emit(ShardEvent::SessionUpdate { session: None });
            }
            self.status = ShardStatus::Disconnected;
            ConnectionEnd::Reconnect { resume: false }
        }
    }

    fn enqueue(&mut self, payload: SendPayload, codec: &FrameCodec, out: &OutboundSender) {
        if self.status != ShardStatus::Ready && !payload.op.is_control() {
            tracing::debug!(
                shard = self.id,
                "holding non-control payload until the shard is ready"
            );
            self.held.push(payload);
            return;
        }
        match codec.encode(&payload) {
            Ok(frame) => {
                if out.send(Outbound::Frame(frame)).is_err() {
                    self.emit_error("SendError", "outbound channel closed");
                }
            }
            Err(err) => self.emit_error("CodecError", &err.to_string()),
        }
    }

    fn heartbeat_payload(&self) -> SendPayload {
        let d = if self.sequence >= 0 {
            json!(self.sequence)
        } else {
            Value::Null
        };
        SendPayload::new(Opcode::Heartbeat, d)
    }

    fn identify_payload(&self) -> SendPayload {
        SendPayload::new(
            Opcode::Identify,
            json!({
                "token": self.config.token,
                "intents": self.config.intents,
                "shard": [self.id, self.config.shard_count],
                "compress": self.config.compression == CompressionMode::PerMessage,
                "properties": {
                    "os": self.config.properties.os,
                    "browser": self.config.properties.browser,
                    "device": self.config.properties.device,
                },
            }),
        )
    }

    fn emit(&self, event: ShardEvent) {
        let _ = self.events.send(event);
    }

    fn emit_error(&self, name: &str, message: &str) {
        tracing::warn!(shard = self.id, "{name}: {message}");
        self.emit(ShardEvent::Error {
            name: name.to_string(),
            message: message.to_string(),
        });
    }
}

fn resume_payload(token: &str, session: &SessionInfo) -> SendPayload {
    SendPayload::new(
        Opcode::Resume,
        json!({
            "token": token,
            "session_id": session.session_id,
            "seq": session.sequence,
        }),
    )
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Writer task: FIFO admission through the governor, then the socket write.
/// Close frames bypass the governor and end the pump.
fn spawn_outbound_pump(
    mut write: WsSink,
    mut out_rx: mpsc::UnboundedReceiver<Outbound>,
    governor: Arc<SendGovernor>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(item) = out_rx.recv().await {
            match item {
                Outbound::Frame(frame) => match governor.admit().await {
                    Ok(_permit) => {
                        let message = match frame {
                            EncodedFrame::Text(text) => Message::Text(text.into()),
                            EncodedFrame::Binary(bytes) => Message::Binary(bytes.into()),
                        };
                        if write.send(message).await.is_err() {
                            break;
                        }
                    }
                    // Connection closed while waiting: the payload retries
                    // against the next connection's governor, not this one.
                    Err(_) => break,
                },
                Outbound::Close(code) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: "".into(),
                    };
                    let _ = write.send(Message::Close(Some(frame))).await;
                    break;
                }
            }
        }
    })
}
