//! WebSocket bridge to the voice-bot backend
//!
//! One binary frame carries one media chunk in either direction. The reader
//! task feeds the outbound RTP queue; the relay loop pushes inbound chunks
//! through [`WebSocketBridge::forward`], which applies the reconnect policy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::frame::{CloseFrame, Utf8Bytes};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::server::agent::CallState;
use crate::server::rtp::MediaQueue;

/// Close code for a connection lost without a closing handshake
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Close code for a close frame that carried no code
pub const NO_STATUS_RECEIVED: u16 = 1005;

const NORMAL_CLOSURE: u16 = 1000;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Failed to connect to {uri}: {source}")]
    Connect {
        uri: String,
        #[source]
        source: Box<tungstenite::Error>,
    },

    #[error("WebSocket is not connected")]
    NotConnected,

    #[error("WebSocket lost (last close code {0:?}), not reconnecting")]
    Fatal(Option<u16>),
}

/// What to do when a send finds the bridge disconnected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Reconnect immediately and retry the chunk
    Reconnect,
    /// Give up on the call
    Escalate,
}

impl ReconnectPolicy {
    pub fn for_close_code(code: Option<u16>) -> Self {
        match code {
            Some(ABNORMAL_CLOSURE) => ReconnectPolicy::Reconnect,
            _ => ReconnectPolicy::Escalate,
        }
    }
}

struct Reader {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Client connection to the bot backend for one call
pub struct WebSocketBridge {
    name: String,
    uri: String,
    state: Arc<CallState>,
    outbound: Arc<MediaQueue>,
    writer: Mutex<Option<WsSink>>,
    connected: Arc<AtomicBool>,
    reader: parking_lot::Mutex<Option<Reader>>,
}

impl WebSocketBridge {
    /// `outbound` receives every binary frame the backend sends
    pub fn new(
        name: impl Into<String>,
        uri: impl Into<String>,
        state: Arc<CallState>,
        outbound: Arc<MediaQueue>,
    ) -> Self {
        Self {
            name: name.into(),
            uri: uri.into(),
            state,
            outbound,
            writer: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            reader: parking_lot::Mutex::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Open the connection and start the reader task
    pub async fn connect(&self) -> Result<(), BridgeError> {
        let (stream, response) = tokio_tungstenite::connect_async(self.uri.as_str())
            .await
            .map_err(|e| BridgeError::Connect {
                uri: self.uri.clone(),
                source: Box::new(e),
            })?;

        tracing::info!(
            "{} WebSocket connected to {} (handshake status {})",
            self.name,
            self.uri,
            response.status()
        );

        self.stop_reader();
        self.state.clear_ws_close_code().await;

        let (sink, stream) = stream.split();
        *self.writer.lock().await = Some(sink);
        self.connected.store(true, Ordering::Release);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(read_frames(
            self.name.clone(),
            stream,
            self.outbound.clone(),
            self.state.clone(),
            self.connected.clone(),
            cancel.clone(),
        ));
        *self.reader.lock() = Some(Reader { cancel, handle });

        Ok(())
    }

    /// Send one chunk as a binary frame
    pub async fn send(&self, chunk: Bytes) -> Result<(), BridgeError> {
        if !self.is_connected() {
            return Err(BridgeError::NotConnected);
        }

        let mut writer = self.writer.lock().await;
        let Some(sink) = writer.as_mut() else {
            return Err(BridgeError::NotConnected);
        };

        if let Err(e) = sink.send(Message::Binary(chunk)).await {
            tracing::warn!("{} WebSocket send failed: {}", self.name, e);
            self.connected.store(false, Ordering::Release);
            *writer = None;
            if self.state.ws_close_code().await.is_none() {
                self.state.set_ws_close_code(ABNORMAL_CLOSURE).await;
            }
            return Err(BridgeError::NotConnected);
        }

        Ok(())
    }

    /// Send a chunk, reconnecting once if the connection was lost abnormally
    pub async fn forward(&self, chunk: Bytes) -> Result<(), BridgeError> {
        match self.send(chunk.clone()).await {
            Err(BridgeError::NotConnected) => {
                let code = self.state.ws_close_code().await;
                match ReconnectPolicy::for_close_code(code) {
                    ReconnectPolicy::Reconnect => {
                        tracing::info!("{} WebSocket closed abnormally, reconnecting", self.name);
                        self.connect().await?;
                        self.send(chunk).await
                    }
                    ReconnectPolicy::Escalate => Err(BridgeError::Fatal(code)),
                }
            }
            other => other,
        }
    }

    /// Send a normal close frame and stop the reader
    pub async fn close(&self) {
        self.stop_reader();
        self.connected.store(false, Ordering::Release);

        if let Some(mut sink) = self.writer.lock().await.take() {
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: Utf8Bytes::from_static("call ended"),
            };
            if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                tracing::debug!("{} WebSocket close frame not sent: {}", self.name, e);
            }
            if let Err(e) = sink.close().await {
                tracing::debug!("{} WebSocket sink not closed cleanly: {}", self.name, e);
            }
            self.state.set_ws_close_code(NORMAL_CLOSURE).await;
        }

        tracing::info!("{} WebSocket closed", self.name);
    }

    fn stop_reader(&self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.cancel.cancel();
            reader.handle.abort();
        }
    }
}

impl Drop for WebSocketBridge {
    fn drop(&mut self) {
        self.stop_reader();
    }
}

async fn read_frames(
    name: String,
    mut stream: SplitStream<WsStream>,
    outbound: Arc<MediaQueue>,
    state: Arc<CallState>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let code = loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = stream.next() => frame,
        };

        match frame {
            Some(Ok(Message::Binary(data))) => outbound.push(data),
            Some(Ok(Message::Close(frame))) => {
                break frame
                    .map(|f| u16::from(f.code))
                    .unwrap_or(NO_STATUS_RECEIVED);
            }
            Some(Ok(Message::Text(_))) => {
                tracing::debug!("{} ignoring WebSocket text frame", name);
            }
            // Ping/pong are answered by tungstenite
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::warn!("{} WebSocket read failed: {}", name, e);
                break ABNORMAL_CLOSURE;
            }
            None => break ABNORMAL_CLOSURE,
        }
    };

    // Code before flag: a sender that sees the flag down reads this code
    state.set_ws_close_code(code).await;
    connected.store(false, Ordering::Release);
    tracing::info!("{} WebSocket closed by backend with code {}", name, code);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    const WAIT: Duration = Duration::from_secs(2);

    async fn listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let uri = format!("ws://{}", listener.local_addr().unwrap());
        (listener, uri)
    }

    async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
        let (tcp, _) = tokio::time::timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        accept_async(tcp).await.unwrap()
    }

    async fn next_binary(ws: &mut WebSocketStream<TcpStream>) -> Bytes {
        loop {
            match tokio::time::timeout(WAIT, ws.next()).await.unwrap() {
                Some(Ok(Message::Binary(data))) => return data,
                Some(Ok(_)) => continue,
                other => panic!("expected binary frame, got {:?}", other),
            }
        }
    }

    async fn wait_for_close_code(state: &CallState, expected: u16) {
        tokio::time::timeout(WAIT, async {
            while state.ws_close_code().await != Some(expected) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("close code never became {}", expected));
    }

    fn bridge(uri: &str) -> (WebSocketBridge, Arc<CallState>, Arc<MediaQueue>) {
        let state = Arc::new(CallState::new("agent1"));
        let outbound = Arc::new(MediaQueue::new("outbound", 16));
        let bridge = WebSocketBridge::new("agent1", uri, state.clone(), outbound.clone());
        (bridge, state, outbound)
    }

    #[test]
    fn test_reconnect_policy() {
        assert_eq!(ReconnectPolicy::for_close_code(Some(1006)), ReconnectPolicy::Reconnect);
        assert_eq!(ReconnectPolicy::for_close_code(Some(4000)), ReconnectPolicy::Escalate);
        assert_eq!(ReconnectPolicy::for_close_code(Some(1000)), ReconnectPolicy::Escalate);
        assert_eq!(ReconnectPolicy::for_close_code(None), ReconnectPolicy::Escalate);
    }

    #[tokio::test]
    async fn test_relays_binary_frames_both_ways() {
        let (listener, uri) = listener().await;
        let (bridge, _state, outbound) = bridge(&uri);

        let (connected, server) = tokio::join!(bridge.connect(), accept(&listener));
        connected.unwrap();
        let mut server = server;

        bridge.send(Bytes::from_static(b"caller audio")).await.unwrap();
        assert_eq!(next_binary(&mut server).await, Bytes::from_static(b"caller audio"));

        server.send(Message::Text(Utf8Bytes::from_static("ignored"))).await.unwrap();
        server
            .send(Message::Binary(Bytes::from_static(b"bot audio")))
            .await
            .unwrap();
        let chunk = tokio::time::timeout(WAIT, outbound.pop()).await.unwrap();
        assert_eq!(chunk, Bytes::from_static(b"bot audio"));
        assert!(outbound.is_empty());

        bridge.close().await;
        assert!(!bridge.is_connected());
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let (bridge, _, _) = bridge("ws://127.0.0.1:9");
        assert!(matches!(
            bridge.send(Bytes::from_static(b"x")).await,
            Err(BridgeError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_abnormal_closure_reconnects_and_retries() {
        let (listener, uri) = listener().await;
        let (bridge, state, _) = bridge(&uri);

        let (connected, first) = tokio::join!(bridge.connect(), accept(&listener));
        connected.unwrap();
        // Drop the TCP connection without a closing handshake
        drop(first);
        wait_for_close_code(&state, ABNORMAL_CLOSURE).await;
        assert!(!bridge.is_connected());

        let (forwarded, second) = tokio::join!(
            bridge.forward(Bytes::from_static(b"pending chunk")),
            accept(&listener)
        );
        forwarded.unwrap();
        let mut second = second;
        assert_eq!(next_binary(&mut second).await, Bytes::from_static(b"pending chunk"));
        assert!(bridge.is_connected());
        // The new connection starts without the old close code
        assert_eq!(state.ws_close_code().await, None);

        bridge.close().await;
    }

    #[tokio::test]
    async fn test_other_close_code_is_fatal() {
        let (listener, uri) = listener().await;
        let (bridge, state, _) = bridge(&uri);

        let (connected, server) = tokio::join!(bridge.connect(), accept(&listener));
        connected.unwrap();
        let mut server = server;
        server
            .close(Some(CloseFrame {
                code: CloseCode::from(4000),
                reason: Utf8Bytes::from_static("bot done"),
            }))
            .await
            .unwrap();

        wait_for_close_code(&state, 4000).await;
        let result = bridge.forward(Bytes::from_static(b"late chunk")).await;
        assert!(matches!(result, Err(BridgeError::Fatal(Some(4000)))));
    }

    #[tokio::test]
    async fn test_close_code_recorded_before_disconnect_is_visible() {
        let (listener, uri) = listener().await;
        let (bridge, state, _) = bridge(&uri);

        let (connected, server) = tokio::join!(bridge.connect(), accept(&listener));
        connected.unwrap();
        let mut server = server;
        server
            .close(Some(CloseFrame {
                code: CloseCode::from(4000),
                reason: Utf8Bytes::from_static("bot done"),
            }))
            .await
            .unwrap();

        tokio::time::timeout(WAIT, async {
            while bridge.is_connected() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        // Once the flag drops the code is already recorded
        assert_eq!(state.ws_close_code().await, Some(4000));
        assert!(matches!(
            bridge.forward(Bytes::from_static(b"late chunk")).await,
            Err(BridgeError::Fatal(Some(4000)))
        ));
    }

    #[tokio::test]
    async fn test_close_after_peer_vanished_completes() {
        let (listener, uri) = listener().await;
        let (bridge, state, _) = bridge(&uri);

        let (connected, server) = tokio::join!(bridge.connect(), accept(&listener));
        connected.unwrap();
        drop(server);
        wait_for_close_code(&state, ABNORMAL_CLOSURE).await;

        // Close frame and sink shutdown both fail; close still finishes
        tokio::time::timeout(WAIT, bridge.close()).await.unwrap();
        assert!(!bridge.is_connected());
        assert_eq!(state.ws_close_code().await, Some(NORMAL_CLOSURE));
    }
}
