//! WebSocket client for hub participants.
//!
//! Used by worker processes (agent, voice bridge, device assistant), by the
//! `monitor` command and by the end-to-end tests. The connection is split
//! into a writer task fed by a channel and a reader task that forwards
//! binary frames to [`HubClient::recv`].

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{Envelope, MessageType, MonitorFrame, ProtocolError, Subscribe, SubscribeAck};

pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HubClient {
    outgoing: mpsc::Sender<Vec<u8>>,
    incoming: mpsc::Receiver<Vec<u8>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl HubClient {
    /// Connect to `url`, presenting `secret` as a bearer token when given.
    pub async fn connect(url: &str, secret: Option<&str>) -> Result<Self, ProtocolError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| ProtocolError::Transport(e.to_string()))?;
        if let Some(secret) = secret {
            let value = HeaderValue::from_str(&format!("Bearer {secret}"))
                .map_err(|e| ProtocolError::Transport(e.to_string()))?;
            request.headers_mut().insert("authorization", value);
        }

        let (ws_stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| ProtocolError::Transport(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        let writer = tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(256);
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        if in_tx.send(data.into()).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        log::debug!("Hub connection read failed: {e}");
                        break;
                    }
                }
            }
        });

        log::debug!("Connected to hub at {url}");
        Ok(Self {
            outgoing: out_tx,
            incoming: in_rx,
            reader,
            writer,
        })
    }

    pub async fn send_raw(&self, bytes: Vec<u8>) -> Result<(), ProtocolError> {
        self.outgoing
            .send(bytes)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    pub async fn send_envelope(&self, envelope: &Envelope) -> Result<(), ProtocolError> {
        self.send_raw(envelope.encode()?).await
    }

    pub async fn send<T: Serialize>(
        &self,
        conversation_id: &str,
        msg_type: MessageType,
        body: &T,
    ) -> Result<(), ProtocolError> {
        self.send_envelope(&Envelope::new(conversation_id, msg_type, body)?)
            .await
    }

    /// Subscribe and wait for the matching acknowledgement. A negative
    /// acknowledgement is returned as-is; check `success`.
    pub async fn subscribe(&mut self, subscribe: Subscribe) -> Result<SubscribeAck, ProtocolError> {
        let conversation_id = subscribe.conversation_id.clone().unwrap_or_default();
        self.send(&conversation_id, MessageType::Subscribe, &subscribe)
            .await?;
        let ack = self
            .recv_type(MessageType::SubscribeAck, DEFAULT_ACK_TIMEOUT)
            .await?;
        ack.body()
    }

    /// Next raw frame, or `None` once the connection is gone.
    pub async fn recv_raw(&mut self) -> Option<Vec<u8>> {
        self.incoming.recv().await
    }

    pub async fn recv(&mut self) -> Result<Envelope, ProtocolError> {
        let bytes = self
            .recv_raw()
            .await
            .ok_or(ProtocolError::ConnectionClosed)?;
        Envelope::decode(&bytes)
    }

    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Envelope, ProtocolError> {
        tokio::time::timeout(timeout, self.recv())
            .await
            .map_err(|_| ProtocolError::Timeout)?
    }

    /// Skip frames until one of `msg_type` arrives.
    pub async fn recv_type(
        &mut self,
        msg_type: MessageType,
        timeout: Duration,
    ) -> Result<Envelope, ProtocolError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let envelope = tokio::time::timeout_at(deadline, self.recv())
                .await
                .map_err(|_| ProtocolError::Timeout)??;
            if envelope.msg_type == msg_type {
                return Ok(envelope);
            }
            log::trace!("Skipping {} while waiting for {msg_type}", envelope.msg_type);
        }
    }

    /// Next mirrored frame on a monitor connection.
    pub async fn recv_monitor_frame(&mut self) -> Result<MonitorFrame, ProtocolError> {
        let bytes = self
            .recv_raw()
            .await
            .ok_or(ProtocolError::ConnectionClosed)?;
        MonitorFrame::decode(&bytes)
    }

    pub fn is_connected(&self) -> bool {
        !self.writer.is_finished() && !self.reader.is_finished()
    }
}

impl Drop for HubClient {
    fn drop(&mut self) {
        // the writer drains and closes once `outgoing` is dropped
        self.reader.abort();
    }
}
