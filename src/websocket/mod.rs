//! Async WebSocket client for the upstream market-data feed.
//!
//! This module is organized by concern:
//! - [`connection`] - One socket: request/reply correlation and read loop
//! - [`manager`] - Connection lifecycle, reconnection and status events
//! - [`request`] - Retrying request sender
//! - [`subscription`] - Deduplicated stream subscriptions and routing
//! - [`handler`] - Incoming message classification

pub mod connection;
pub mod handler;
pub mod manager;
pub mod request;
pub mod subscription;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use tungstenite::Message;

use crate::Result;

pub use connection::{
    Connection, ConnectionEvent, ConnectionId, ConnectionStatus, FeedEvent, ReadyState, Reply,
};
pub use handler::{HistoryReply, StreamPush, history_reply};
pub use manager::{ConnectionManager, Connector, WsConnector};
pub use request::{Requester, RetryPolicy};
pub use subscription::{
    Attachment, Listener, ListenerId, ListenerMode, StreamUpdate, SubscriptionRegistry,
    SubscriptionState,
};

/// Write half of a feed WebSocket connection.
pub type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Read half of a feed WebSocket connection.
pub type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// A frame queued for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    /// Close the transport gracefully.
    Close,
}

/// Channel pair a [`Connection`] talks through.
///
/// The transport behind it ends the connection by dropping its sender of
/// `incoming`.
pub struct Socket {
    pub outgoing: mpsc::UnboundedSender<Outbound>,
    pub incoming: mpsc::UnboundedReceiver<String>,
}

/// Establishes a WebSocket connection to the given URL.
///
/// # Errors
///
/// Returns a [`QuotelineError`](crate::QuotelineError) if the connection or TLS handshake fails.
pub async fn connect(url: &str) -> Result<(WsWriter, WsReader)> {
    let (ws_stream, _) = connect_async(url).await?;
    info!("WebSocket handshake completed");

    Ok(ws_stream.split())
}

/// Bridges a split WebSocket to a [`Socket`] channel pair.
///
/// The spawned pump ends when either side closes.
pub fn spawn_pump(mut write: WsWriter, mut read: WsReader) -> Socket {
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                outbound = out_rx.recv() => match outbound {
                    Some(Outbound::Text(text)) => {
                        if let Err(e) = write.send(Message::Text(text.into())).await {
                            warn!("WebSocket send failed: {e}");
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let _ = write.close().await;
                        debug!("WebSocket closed by client");
                        break;
                    }
                },
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if in_tx.send(text.as_str().to_owned()).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("WebSocket stream ended");
                        break;
                    }
                    Some(Ok(_)) => {} // Binary/Ping/Pong frames
                    Some(Err(e)) => {
                        warn!("WebSocket error: {e}");
                        break;
                    }
                },
            }
        }
    });

    Socket {
        outgoing: out_tx,
        incoming: in_rx,
    }
}
