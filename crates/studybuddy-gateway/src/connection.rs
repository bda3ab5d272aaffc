use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, error, info, warn};

use studybuddy_db::Database;
use studybuddy_types::events::{GatewayCommand, GatewayEvent};
use studybuddy_types::models::Role;

use crate::context::ConnectionContext;
use crate::dispatcher::{Dispatcher, UserMessage};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Handle a WebSocket connection whose caller was authenticated at upgrade.
pub async fn handle_connection(
    socket: WebSocket,
    dispatcher: Dispatcher,
    db: Arc<Database>,
    user_id: i64,
) {
    let (mut sender, receiver) = socket.split();

    info!("user {} connected to gateway", user_id);

    if send_event(&mut sender, &GatewayEvent::Ready { user_id }).await.is_err() {
        return;
    }

    let (conn_id, user_rx) = dispatcher.register_connection(user_id).await;
    let ctx = Arc::new(ConnectionContext::new(conn_id, user_id));

    run_connection_loop(sender, receiver, user_rx, &dispatcher, db, ctx.clone()).await;

    // Same teardown for a clean close, an error, or a heartbeat timeout.
    for group_id in ctx.take_tracked() {
        dispatcher.untrack(group_id, user_id).await;
    }
    dispatcher.unregister_connection(user_id, conn_id).await;
    info!("user {} disconnected from gateway", user_id);
}

async fn run_connection_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut user_rx: tokio::sync::mpsc::UnboundedReceiver<UserMessage>,
    dispatcher: &Dispatcher,
    db: Arc<Database>,
    ctx: Arc<ConnectionContext>,
) {
    let mut broadcast_rx = dispatcher.subscribe();

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward broadcasts + targeted messages -> client, with heartbeat
    let send_ctx = ctx.clone();
    let send_dispatcher = dispatcher.clone();
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = broadcast_rx.recv() => {
                    let msg = match result {
                        Ok(msg) => msg,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Broadcast receiver lagged by {} messages", n);
                            continue;
                        }
                        Err(_) => break,
                    };

                    if let Some(group_id) = msg.group_id {
                        if !send_ctx.is_subscribed(group_id) {
                            continue;
                        }
                    }

                    if sender.send(Message::Text(msg.json.to_string().into())).await.is_err() {
                        break;
                    }
                }
                result = user_rx.recv() => {
                    let Some(msg) = result else { break };

                    match msg {
                        UserMessage::Event(event) => {
                            if send_event(&mut sender, &event).await.is_err() {
                                break;
                            }
                        }
                        UserMessage::Revoke { group_id } => {
                            debug!("user {} lost access to group {}", send_ctx.user_id, group_id);
                            send_ctx.unsubscribe(group_id);
                            if send_ctx.stop_tracking(group_id) {
                                send_dispatcher.untrack(group_id, send_ctx.user_id).await;
                            }
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client
    let recv_dispatcher = dispatcher.clone();
    let recv_ctx = ctx.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => handle_command(&recv_dispatcher, &db, &recv_ctx, cmd).await,
                    Err(e) => {
                        let preview: String = text.chars().take(200).collect();
                        warn!("user {} bad command: {} -- raw: {}", recv_ctx.user_id, e, preview);
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
}

async fn handle_command(
    dispatcher: &Dispatcher,
    db: &Arc<Database>,
    ctx: &ConnectionContext,
    cmd: GatewayCommand,
) {
    let user_id = ctx.user_id;

    match cmd {
        GatewayCommand::Subscribe { group_id } => {
            if !is_member(db, user_id, group_id).await {
                reject(dispatcher, ctx, group_id).await;
                return;
            }
            ctx.subscribe(group_id);
            // A leave revoked between the check and the insert would be missed.
            if !is_member(db, user_id, group_id).await {
                ctx.unsubscribe(group_id);
                reject(dispatcher, ctx, group_id).await;
                return;
            }
            debug!("user {} subscribed to group {}", user_id, group_id);
        }

        GatewayCommand::Unsubscribe { group_id } => {
            ctx.unsubscribe(group_id);
        }

        GatewayCommand::Track { group_id } => {
            if !is_member(db, user_id, group_id).await {
                reject(dispatcher, ctx, group_id).await;
                return;
            }
            let newly_tracked = ctx.start_tracking(group_id);
            let user_ids = if newly_tracked {
                dispatcher.track(group_id, user_id).await
            } else {
                dispatcher.present_in(group_id).await
            };
            if newly_tracked && !confirm_tracking(dispatcher, db, ctx, group_id).await {
                return;
            }
            dispatcher
                .send_to_connection(user_id, ctx.conn_id, GatewayEvent::PresenceSync { group_id, user_ids })
                .await;
        }

        GatewayCommand::Untrack { group_id } => {
            if ctx.stop_tracking(group_id) {
                dispatcher.untrack(group_id, user_id).await;
            }
        }
    }
}

/// Re-check membership once presence is recorded. A `Revoke` handled before
/// `start_tracking` finds nothing to undo, so the undo happens here instead.
async fn confirm_tracking(
    dispatcher: &Dispatcher,
    db: &Arc<Database>,
    ctx: &ConnectionContext,
    group_id: i64,
) -> bool {
    if is_member(db, ctx.user_id, group_id).await {
        return true;
    }
    if ctx.stop_tracking(group_id) {
        dispatcher.untrack(group_id, ctx.user_id).await;
    }
    reject(dispatcher, ctx, group_id).await;
    false
}

async fn reject(dispatcher: &Dispatcher, ctx: &ConnectionContext, group_id: i64) {
    warn!("user {} is not a member of group {}", ctx.user_id, group_id);
    dispatcher
        .send_to_connection(
            ctx.user_id,
            ctx.conn_id,
            GatewayEvent::Error {
                message: format!("not a member of group {}", group_id),
            },
        )
        .await;
}

/// Membership lookup off the async runtime. Store errors count as "no".
async fn is_member(db: &Arc<Database>, user_id: i64, group_id: i64) -> bool {
    let db = db.clone();
    let role: anyhow::Result<Option<Role>> =
        match tokio::task::spawn_blocking(move || db.membership_role(user_id, group_id)).await {
            Ok(result) => result,
            Err(e) => {
                error!("spawn_blocking join error: {}", e);
                return false;
            }
        };

    match role {
        Ok(role) => role.is_some(),
        Err(e) => {
            error!("membership lookup failed: {}", e);
            false
        }
    }
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &GatewayEvent,
) -> Result<(), ()> {
    let text = serde_json::to_string(event).map_err(|e| {
        error!("Failed to serialize gateway event: {}", e);
    })?;
    sender.send(Message::Text(text.into())).await.map_err(|_| ())
}
