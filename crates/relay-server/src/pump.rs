//! Per-connection read and write loops.
//!
//! Ingress reads frames under a rolling read deadline that only a pong
//! extends. Egress drains the outbound buffer and sends pings at 9/10 of the
//! deadline. Either side ending tears the connection down.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use metrics::counter;
use relay_core::ClientEvent;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::ServerSettings;
use crate::connection::Connection;
use crate::handler::ChatHandler;
use crate::hub::Hub;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PumpSettings {
    pub pong_wait: Duration,
    pub ping_period: Duration,
    pub write_wait: Duration,
    pub max_frame_size: usize,
}

impl From<&ServerSettings> for PumpSettings {
    fn from(s: &ServerSettings) -> Self {
        Self {
            pong_wait: s.pong_wait(),
            ping_period: s.ping_period(),
            write_wait: s.write_wait(),
            max_frame_size: s.max_frame_size,
        }
    }
}

impl Default for PumpSettings {
    fn default() -> Self {
        Self::from(&ServerSettings::default())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    PeerClosed,
    ReadTimeout,
    FrameTooLarge,
    Transport,
    Cancelled,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PeerClosed => "peer_closed",
            Self::ReadTimeout => "read_timeout",
            Self::FrameTooLarge => "frame_too_large",
            Self::Transport => "transport",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Everything a connection's pumps need from the server.
#[derive(Clone)]
pub struct PumpContext {
    pub hub: Arc<Hub>,
    pub handler: Arc<ChatHandler>,
    pub settings: PumpSettings,
    pub shutdown: CancellationToken,
}

/// Drive one registered connection until it closes.
pub async fn serve(
    socket: WebSocket,
    conn: Arc<Connection>,
    outbound: mpsc::Receiver<Arc<String>>,
    ctx: PumpContext,
) {
    let span = info_span!("connection", connection_id = %conn.id());
    async move {
        let (writer, reader) = socket.split();
        let cancel = ctx.shutdown.child_token();

        let mut egress_task = tokio::spawn(
            egress(writer, outbound, ctx.settings, cancel.clone()).in_current_span(),
        );
        let reason = ingress(reader, &conn, &ctx.handler, &ctx.settings, &cancel).await;
        teardown(&ctx.hub, &conn, reason);

        // Teardown closed the buffer; give egress one write window to flush
        // and send the close frame.
        if tokio::time::timeout(ctx.settings.write_wait, &mut egress_task).await.is_err() {
            cancel.cancel();
            let _ = egress_task.await;
        }
    }
    .instrument(span)
    .await;
}

/// Read frames and dispatch them until the peer goes away, the read
/// deadline passes, a frame is oversized, or `cancel` fires.
pub async fn ingress<R, E>(
    mut reader: R,
    conn: &Connection,
    handler: &ChatHandler,
    settings: &PumpSettings,
    cancel: &CancellationToken,
) -> CloseReason
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let mut deadline = Instant::now() + settings.pong_wait;
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return CloseReason::Cancelled,
            next = tokio::time::timeout_at(deadline, reader.next()) => next,
        };
        let frame = match next {
            Err(_) => {
                debug!("read deadline expired");
                return CloseReason::ReadTimeout;
            }
            Ok(None) => return CloseReason::PeerClosed,
            Ok(Some(Err(e))) => {
                debug!(error = %e, "read error");
                return CloseReason::Transport;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Message::Text(text) => {
                if text.as_str().len() > settings.max_frame_size {
                    warn!(size = text.as_str().len(), limit = settings.max_frame_size, "frame too large");
                    return CloseReason::FrameTooLarge;
                }
                handle_text(conn, handler, text.as_str()).await;
            }
            Message::Binary(data) => {
                if data.len() > settings.max_frame_size {
                    warn!(size = data.len(), limit = settings.max_frame_size, "frame too large");
                    return CloseReason::FrameTooLarge;
                }
                debug!("ignoring binary frame");
            }
            Message::Pong(_) => deadline = Instant::now() + settings.pong_wait,
            // axum answers pings itself
            Message::Ping(_) => {}
            Message::Close(_) => return CloseReason::PeerClosed,
        }
    }
}

async fn handle_text(conn: &Connection, handler: &ChatHandler, text: &str) {
    let event = match ClientEvent::decode(text) {
        Ok(Some(event)) => event,
        Ok(None) => {
            debug!("ignoring frame with unhandled type");
            return;
        }
        Err(e) => {
            warn!(error = %e, "dropping undecodable frame");
            counter!("relay_decode_errors_total").increment(1);
            return;
        }
    };

    let kind = event.kind();
    if let Err(e) = handler.dispatch(conn, event).await {
        let session_id = conn.session_id().map(|s| s.to_string()).unwrap_or_default();
        if e.is_rejection() {
            warn!(event = kind, reason = e.kind(), session_id = %session_id, error = %e, "event rejected");
        } else {
            error!(event = kind, reason = e.kind(), session_id = %session_id, error = %e, "event not applied");
        }
    }
}

/// Flush outbound frames and send pings. Sends a close frame when the buffer
/// is closed or `cancel` fires. Cancels `cancel` on exit so ingress stops too.
pub async fn egress<W>(
    mut writer: W,
    mut outbound: mpsc::Receiver<Arc<String>>,
    settings: PumpSettings,
    cancel: CancellationToken,
) where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    let _stop_ingress = cancel.clone().drop_guard();
    let mut ping = tokio::time::interval_at(Instant::now() + settings.ping_period, settings.ping_period);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = write(&mut writer, Message::Close(None), settings.write_wait).await;
                break;
            }
            item = outbound.recv() => match item {
                Some(payload) => {
                    let frame = Message::Text(String::clone(&payload).into());
                    if let Err(e) = write(&mut writer, frame, settings.write_wait).await {
                        debug!(error = %e, "write failed");
                        break;
                    }
                }
                None => {
                    let _ = write(&mut writer, Message::Close(None), settings.write_wait).await;
                    break;
                }
            },
            _ = ping.tick() => {
                if let Err(e) = write(&mut writer, Message::Ping(Vec::new().into()), settings.write_wait).await {
                    debug!(error = %e, "ping failed");
                    break;
                }
            }
        }
    }
}

async fn write<W>(writer: &mut W, frame: Message, wait: Duration) -> Result<(), String>
where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    match tokio::time::timeout(wait, writer.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("write deadline exceeded".into()),
    }
}

/// Unregister and close the buffer. Safe to call more than once; only the
/// first call that changes anything is logged.
pub fn teardown(hub: &Hub, conn: &Connection, reason: CloseReason) {
    let unregistered = hub.unregister(conn.id());
    let closed = conn.close();
    if !(unregistered || closed) {
        return;
    }
    counter!("relay_connections_closed_total", "reason" => reason.as_str()).increment(1);
    info!(
        reason = reason.as_str(),
        session_id = conn.session_id().map(|s| s.as_str()).unwrap_or(""),
        age_ms = conn.age().as_millis() as u64,
        "connection closed"
    );
}
