//! Websocket rendezvous client.
//!
//! Turns one websocket connection into a [`SignalLink`]: a read pump that
//! parses text frames into [`SignalMessage`]s and a write pump that
//! serializes outgoing ones. Unparseable frames are logged and dropped;
//! the rendezvous may speak newer dialects.

use super::{SignalLink, SignalMessage};
use anyhow::{anyhow, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Connect to a rendezvous server and start both pumps.
///
/// The link's incoming stream ends when the socket closes; dropping the
/// outgoing sender closes the socket.
pub async fn connect(relay_addr: &str) -> Result<SignalLink> {
    let url = if relay_addr.starts_with("ws://") || relay_addr.starts_with("wss://") {
        relay_addr.to_string()
    } else {
        format!("ws://{relay_addr}")
    };

    info!(event = "signalling_connect", url = %url, "Connecting to rendezvous");
    let (ws, _) = connect_async(url.as_str())
        .await
        .map_err(|e| anyhow!("failed to connect to rendezvous {url}: {e}"))?;
    let (mut sink, mut stream) = ws.split();

    let (incoming_tx, incoming_rx) = mpsc::unbounded_channel::<SignalMessage>();
    let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<SignalMessage>();

    // Write pump: outgoing queue → socket.
    tokio::spawn(async move {
        while let Some(message) = outgoing_rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    warn!(event = "signalling_encode_failure", error = %e, "Dropping unencodable frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Read pump: socket → incoming queue.
    tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => match serde_json::from_str::<SignalMessage>(&text) {
                    Ok(message) => {
                        if incoming_tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(
                            event = "signalling_parse_failure",
                            error = %e,
                            "Ignoring unparseable rendezvous frame"
                        );
                    }
                },
                Ok(Message::Close(_)) | Err(_) => break,
                // Pings are answered by tungstenite automatically; binary
                // frames are not part of this protocol.
                Ok(_) => {}
            }
        }
        info!(event = "signalling_disconnected", "Rendezvous connection closed");
    });

    Ok(SignalLink {
        outgoing: outgoing_tx,
        incoming: incoming_rx,
    })
}
