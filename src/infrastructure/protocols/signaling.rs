/// WebSocket signaling client
///
/// Bridges the relay socket to two queues: `ClientEvent`s pushed on the
/// outgoing sender are written as JSON text frames by a writer task, and
/// every parsed `ServerEvent` is forwarded by a reader task.
use crate::domain::signaling::{ClientEvent, ServerEvent};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid frame: {0}")]
    Json(#[from] serde_json::Error),
}

pub struct SignalingConnection {
    pub outgoing: mpsc::UnboundedSender<ClientEvent>,
    pub incoming: mpsc::UnboundedReceiver<ServerEvent>,
    writer: JoinHandle<Result<(), SignalingError>>,
    reader: JoinHandle<()>,
}

impl SignalingConnection {
    pub async fn connect(url: &str) -> Result<Self, SignalingError> {
        let (ws_stream, _) = connect_async(url).await?;
        info!("Connected to signaling relay at {}", url);
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<ClientEvent>();
        let (incoming_tx, incoming) = mpsc::unbounded_channel::<ServerEvent>();

        let writer = tokio::spawn(async move {
            while let Some(event) = outgoing_rx.recv().await {
                let text = serde_json::to_string(&event)?;
                ws_write.send(Message::Text(text)).await?;
            }
            ws_write.close().await?;
            Ok::<(), SignalingError>(())
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("Signaling read error: {}", e);
                        break;
                    }
                };
                match serde_json::from_str::<ServerEvent>(&text) {
                    Ok(event) => {
                        if incoming_tx.send(event).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Ignoring unparseable relay frame: {}", e),
                }
            }
            debug!("Signaling reader finished");
        });

        Ok(Self {
            outgoing,
            incoming,
            writer,
            reader,
        })
    }

    /// Split into the queues, leaving the socket tasks running
    pub fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedSender<ClientEvent>,
        mpsc::UnboundedReceiver<ServerEvent>,
    ) {
        (self.outgoing, self.incoming)
    }

    pub fn abort(&self) {
        self.writer.abort();
        self.reader.abort();
    }
}
