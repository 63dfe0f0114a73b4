//! WebSocket signaling channel.
//!
//! Flow:
//! 1. Connect to the relay's upgrade endpoint
//! 2. Spawn a writer task fed by an unbounded channel
//! 3. Spawn a reader task forwarding text frames, in arrival order, as
//!    `ChannelEvent`s to the session
//! 4. Report the close (or error) exactly once, then stop

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use super::message::{FrameCodec, SignalingMessage};
use crate::error::VoiceError;

/// Events produced by the signaling transport, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Socket handshake completed
    Opened,
    /// One inbound text frame
    Frame(String),
    /// Socket closed (by either side)
    Closed { reason: Option<String> },
    /// Transport-level failure; a `Closed` follows
    Error(String),
}

/// Send primitive of the signaling channel.
pub trait SignalingSink: Send + Sync {
    fn send(&self, message: &SignalingMessage) -> Result<(), VoiceError>;
}

/// Outbound half of a connected WebSocket channel
pub struct WsSink {
    codec: FrameCodec,
    tx: mpsc::UnboundedSender<Message>,
}

impl WsSink {
    /// Ask the writer task to send a close frame.
    pub fn close(&self) {
        let _ = self.tx.send(Message::Close(None));
    }
}

impl SignalingSink for WsSink {
    fn send(&self, message: &SignalingMessage) -> Result<(), VoiceError> {
        let frame = self.codec.encode(message)?;
        debug!("[Signaling] -> {}", frame);
        self.tx
            .send(Message::Text(frame))
            .map_err(|_| VoiceError::Transport("signaling writer has stopped".to_string()))
    }
}

/// WebSocket connection to the relay
pub struct WsChannel;

impl WsChannel {
    /// Connect to the relay and start forwarding events.
    ///
    /// `on_event` is called from the reader task for every transport event,
    /// in the order the socket delivered them.
    pub async fn connect<F>(url: &str, codec: FrameCodec, on_event: F) -> Result<WsSink, VoiceError>
    where
        F: Fn(ChannelEvent) + Send + Sync + 'static,
    {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| VoiceError::Transport(format!("Failed to connect to {}: {}", url, e)))?;

        info!("[Signaling] Connected to {}", url);

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = ws_sender.send(msg).await {
                    error!("[Signaling] Send failed: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        on_event(ChannelEvent::Opened);

        tokio::spawn(async move {
            let mut reason = None;
            while let Some(msg_result) = ws_receiver.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => on_event(ChannelEvent::Frame(text)),
                    Ok(Message::Close(frame)) => {
                        reason = frame.map(|f| f.reason.to_string());
                        break;
                    }
                    Ok(Message::Binary(data)) => {
                        debug!("[Signaling] Ignoring {} byte binary frame", data.len());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        on_event(ChannelEvent::Error(e.to_string()));
                        break;
                    }
                }
            }
            on_event(ChannelEvent::Closed { reason });
        });

        Ok(WsSink { codec, tx })
    }
}
