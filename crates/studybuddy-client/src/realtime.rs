use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use studybuddy_types::events::{GatewayCommand, GatewayEvent};

use crate::error::{ClientError, ClientResult};

/// A live gateway session. Commands go out through an unbounded queue;
/// events come back through `next_event`.
pub struct RealtimeClient {
    commands: mpsc::UnboundedSender<GatewayCommand>,
    events: mpsc::UnboundedReceiver<GatewayEvent>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl RealtimeClient {
    /// Connect to `gateway_url` (e.g. `ws://host:3000/gateway`).
    pub async fn connect(gateway_url: &str, token: &str) -> ClientResult<Self> {
        let url = format!("{}?token={}", gateway_url, token);
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ClientError::Realtime(e.to_string()))?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<GatewayCommand>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<GatewayEvent>();

        let writer = tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                let json = match serde_json::to_string(&cmd) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("could not encode {:?}: {}", cmd, e);
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_tx.send(Message::Close(None)).await;
        });

        // Pings are answered by tungstenite while this loop keeps reading.
        let reader = tokio::spawn(async move {
            while let Some(Ok(msg)) = ws_rx.next().await {
                match msg {
                    Message::Text(text) => match serde_json::from_str::<GatewayEvent>(&text) {
                        Ok(event) => {
                            if event_tx.send(event).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("unrecognised gateway event: {}", e),
                    },
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            debug!("gateway reader finished");
        });

        info!("connected to gateway");
        Ok(Self {
            commands: cmd_tx,
            events: event_rx,
            reader,
            writer,
        })
    }

    pub fn send(&self, cmd: GatewayCommand) -> ClientResult<()> {
        self.commands
            .send(cmd)
            .map_err(|_| ClientError::Realtime("connection closed".into()))
    }

    /// Start listening to a group and announce presence there. Dropping the
    /// returned handle undoes both.
    pub fn open_group(&self, group_id: i64) -> GroupChannel {
        GroupChannel::open(group_id, self.commands.clone())
    }

    /// Next event from the server, or `None` once the connection is gone.
    pub async fn next_event(&mut self) -> Option<GatewayEvent> {
        self.events.recv().await
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Subscription plus presence for one open group view.
pub struct GroupChannel {
    group_id: i64,
    commands: mpsc::UnboundedSender<GatewayCommand>,
}

impl GroupChannel {
    pub fn open(group_id: i64, commands: mpsc::UnboundedSender<GatewayCommand>) -> Self {
        let _ = commands.send(GatewayCommand::Subscribe { group_id });
        let _ = commands.send(GatewayCommand::Track { group_id });
        Self { group_id, commands }
    }

    pub fn group_id(&self) -> i64 {
        self.group_id
    }
}

impl Drop for GroupChannel {
    fn drop(&mut self) {
        // The session may already be closed; nothing left to undo then.
        let _ = self.commands.send(GatewayCommand::Untrack { group_id: self.group_id });
        let _ = self.commands.send(GatewayCommand::Unsubscribe { group_id: self.group_id });
    }
}
