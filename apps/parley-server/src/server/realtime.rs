use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use parley_core::{permissions::ConversationPermission, MessageContent, MessageKind};
use parley_protocol::{client_ops, parse_envelope};
use tokio::sync::{mpsc, watch};
use ulid::Ulid;
use uuid::Uuid;

mod connection_registry;
mod delivery;
mod fanout_group;
mod fanout_user;
mod ingress_rate_limit;
mod presence;
mod subscriptions;

use connection_registry::{force_close_connections, remove_connection_state};
use delivery::delivery_targets;
use fanout_group::dispatch_group_payload;
use fanout_user::{dispatch_user_payload, user_connection_ids};
use ingress_rate_limit::allow_gateway_ingress;
use presence::{is_first_connection_of_user, is_last_connection_of_user};
pub(crate) use subscriptions::{add_subscription, remove_connection, remove_subscription};

use super::{
    auth::{authenticate_with_token, bearer_token, conversation_group_key, now_unix},
    core::{AppState, AuthContext, ConnectionControl, ConnectionPresence, MessageRecord},
    errors::ApiFailure,
    gateway_events::{self, GatewayEvent},
    metrics::{
        record_gateway_event_dropped, record_gateway_event_emitted,
        record_gateway_event_parse_rejected, record_rate_limit_hit, record_ws_disconnect,
    },
    permissions::require_conversation_permission,
    store,
    types::{GatewayAuthQuery, GatewayChatScope, GatewayMarkRead, GatewaySendMessage},
};

pub(crate) async fn gateway_ws(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
    Query(query): Query<GatewayAuthQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiFailure> {
    let token = query
        .access_token
        .or_else(|| bearer_token(&headers).map(ToOwned::to_owned))
        .ok_or(ApiFailure::Unauthorized)?;
    let auth = authenticate_with_token(&state, &token).await?;

    Ok(ws.on_upgrade(move |socket| async move {
        handle_gateway_connection(state, socket, auth).await;
    }))
}

#[allow(clippy::too_many_lines)]
pub(crate) async fn handle_gateway_connection(state: AppState, socket: WebSocket, auth: AuthContext) {
    let connection_id = Uuid::new_v4();
    let user_id = auth.user_id.to_string();
    let (mut sink, mut stream) = socket.split();
    let slow_consumer_disconnect = Arc::new(AtomicBool::new(false));

    let (outbound_tx, mut outbound_rx) =
        mpsc::channel::<String>(state.runtime.gateway_outbound_queue);
    state
        .connection_senders
        .write()
        .await
        .insert(connection_id, outbound_tx.clone());
    let (control_tx, mut control_rx) = watch::channel(ConnectionControl::Open);
    state
        .connection_controls
        .write()
        .await
        .insert(connection_id, control_tx);

    // Presence registration and the first-connection check happen under
    // one lock so two devices racing cannot both claim the online edge.
    let conversation_ids = store::list_active_memberships(&state, &user_id).await;
    let came_online = {
        let mut presence = state.connection_presence.write().await;
        let first = is_first_connection_of_user(&presence, &user_id);
        presence.insert(
            connection_id,
            ConnectionPresence {
                user_id: auth.user_id,
                conversation_ids: conversation_ids.iter().cloned().collect(),
            },
        );
        first
    };

    {
        let mut subscriptions = state.subscriptions.write().await;
        for conversation_id in &conversation_ids {
            add_subscription(
                &mut subscriptions,
                conversation_group_key(conversation_id),
                connection_id,
                outbound_tx.clone(),
            );
        }
    }

    let ready_event = gateway_events::ready(auth.user_id, conversation_ids.clone());
    let _ = outbound_tx.send(ready_event.payload).await;
    record_gateway_event_emitted("connection", ready_event.event_type);

    if came_online {
        let online_event = gateway_events::user_online(auth.user_id, now_unix());
        broadcast_presence_event(&state, &user_id, &online_event).await;
    }

    let slow_consumer_disconnect_send = Arc::clone(&slow_consumer_disconnect);
    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(Duration::from_secs(30));
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ping_interval.tick() => {
                    if sink.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
                control_change = control_rx.changed() => {
                    if control_change.is_ok() && *control_rx.borrow() == ConnectionControl::Close {
                        slow_consumer_disconnect_send.store(true, Ordering::Relaxed);
                        record_ws_disconnect("slow_consumer");
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code: 1008,
                                reason: "slow_consumer".into(),
                            })))
                            .await;
                        break;
                    }
                }
                maybe_payload = outbound_rx.recv() => {
                    match maybe_payload {
                        Some(payload) => {
                            if sink.send(Message::Text(payload.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    });

    let mut ingress = VecDeque::new();
    let mut disconnect_reason = "connection_closed";
    while let Some(incoming) = stream.next().await {
        let Ok(message) = incoming else {
            disconnect_reason = "socket_error";
            break;
        };

        let payload: Vec<u8> = match message {
            Message::Text(text) => {
                if text.len() > state.runtime.max_gateway_event_bytes {
                    disconnect_reason = "event_too_large";
                    break;
                }
                text.as_bytes().to_vec()
            }
            Message::Binary(bytes) => {
                if bytes.len() > state.runtime.max_gateway_event_bytes {
                    disconnect_reason = "event_too_large";
                    break;
                }
                bytes.to_vec()
            }
            Message::Close(_) => {
                disconnect_reason = "client_close";
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        if !allow_gateway_ingress(
            &mut ingress,
            state.runtime.gateway_ingress_events_per_window,
            state.runtime.gateway_ingress_window,
        ) {
            record_rate_limit_hit("gateway", "ingress_window");
            disconnect_reason = "ingress_rate_limited";
            break;
        }

        let Ok(envelope) = parse_envelope(&payload) else {
            record_gateway_event_parse_rejected("ingress", "invalid_envelope");
            disconnect_reason = "invalid_envelope";
            break;
        };
        if !envelope.t.is_client_op() {
            record_gateway_event_parse_rejected("ingress", "unknown_op");
            disconnect_reason = "unknown_op";
            break;
        }

        // Malformed payloads tear the connection down; authorization and
        // domain failures answer the caller with an error event and keep
        // the connection open.
        match envelope.t.as_str() {
            client_ops::SEND_MESSAGE => {
                let Ok(request) = serde_json::from_value::<GatewaySendMessage>(envelope.d) else {
                    record_gateway_event_parse_rejected("ingress", "invalid_send_message_payload");
                    disconnect_reason = "invalid_send_message_payload";
                    break;
                };
                if let Err(failure) = handle_send_message(&state, &auth, request).await {
                    send_caller_error(&outbound_tx, &failure, client_ops::SEND_MESSAGE).await;
                }
            }
            client_ops::JOIN_CHAT => {
                let Ok(request) = serde_json::from_value::<GatewayChatScope>(envelope.d) else {
                    record_gateway_event_parse_rejected("ingress", "invalid_join_chat_payload");
                    disconnect_reason = "invalid_join_chat_payload";
                    break;
                };
                if let Err(failure) =
                    handle_join_chat(&state, &auth, connection_id, &outbound_tx, &request).await
                {
                    send_caller_error(&outbound_tx, &failure, client_ops::JOIN_CHAT).await;
                }
            }
            client_ops::LEAVE_CHAT => {
                let Ok(request) = serde_json::from_value::<GatewayChatScope>(envelope.d) else {
                    record_gateway_event_parse_rejected("ingress", "invalid_leave_chat_payload");
                    disconnect_reason = "invalid_leave_chat_payload";
                    break;
                };
                handle_leave_chat(&state, &auth, connection_id, &outbound_tx, &request).await;
            }
            client_ops::MARK_READ => {
                let Ok(request) = serde_json::from_value::<GatewayMarkRead>(envelope.d) else {
                    record_gateway_event_parse_rejected("ingress", "invalid_mark_read_payload");
                    disconnect_reason = "invalid_mark_read_payload";
                    break;
                };
                if let Err(failure) = handle_mark_read(&state, &auth, &request).await {
                    send_caller_error(&outbound_tx, &failure, client_ops::MARK_READ).await;
                }
            }
            client_ops::START_TYPING | client_ops::STOP_TYPING => {
                let started = envelope.t.as_str() == client_ops::START_TYPING;
                let Ok(request) = serde_json::from_value::<GatewayChatScope>(envelope.d) else {
                    record_gateway_event_parse_rejected("ingress", "invalid_typing_payload");
                    disconnect_reason = "invalid_typing_payload";
                    break;
                };
                if let Err(failure) = handle_typing(&state, &auth, &request, started).await {
                    let op = if started {
                        client_ops::START_TYPING
                    } else {
                        client_ops::STOP_TYPING
                    };
                    send_caller_error(&outbound_tx, &failure, op).await;
                }
            }
            _ => {
                record_gateway_event_parse_rejected("ingress", "unknown_op");
                disconnect_reason = "unknown_op";
                break;
            }
        }
    }

    if !slow_consumer_disconnect.load(Ordering::Relaxed) {
        record_ws_disconnect(disconnect_reason);
    }
    finish_connection(&state, connection_id, &user_id).await;
    send_task.abort();
}

/// Tears down a connection's registrations and, when it was the user's
/// last, broadcasts a single offline event. The removal and the
/// last-connection check happen under one lock so two devices closing
/// concurrently cannot both claim the offline edge.
pub(crate) async fn finish_connection(state: &AppState, connection_id: Uuid, user_id: &str) {
    let (removed_presence, went_offline) = {
        let mut presence = state.connection_presence.write().await;
        let mut controls = state.connection_controls.write().await;
        let mut senders = state.connection_senders.write().await;
        let removed =
            remove_connection_state(&mut presence, &mut controls, &mut senders, connection_id);
        let went_offline = removed.is_some() && is_last_connection_of_user(&presence, user_id);
        (removed, went_offline)
    };
    {
        let mut subscriptions = state.subscriptions.write().await;
        remove_connection(&mut subscriptions, connection_id);
    }

    let Some(removed_presence) = removed_presence else {
        return;
    };
    if !went_offline {
        return;
    }

    let disconnected_at = now_unix();
    state
        .last_seen
        .write()
        .await
        .insert(user_id.to_owned(), disconnected_at);
    let offline_event = gateway_events::user_offline(removed_presence.user_id, disconnected_at);
    broadcast_presence_event(state, user_id, &offline_event).await;
}

/// Presence edges go to every live connection except the subject's own.
pub(crate) async fn broadcast_presence_event(
    state: &AppState,
    user_id: &str,
    event: &GatewayEvent,
) {
    let targets = {
        let presence = state.connection_presence.read().await;
        presence
            .iter()
            .filter(|(_, connection)| connection.user_id.to_string() != user_id)
            .map(|(connection_id, _)| *connection_id)
            .collect::<Vec<_>>()
    };
    if targets.is_empty() {
        return;
    }

    let mut slow_connections = Vec::new();
    {
        let mut senders = state.connection_senders.write().await;
        dispatch_user_payload(
            &mut senders,
            &targets,
            &event.payload,
            state.runtime.max_gateway_event_bytes,
            event.event_type,
            &mut slow_connections,
        );
    }
    close_slow_connections(state, &slow_connections).await;
}

pub(crate) async fn handle_send_message(
    state: &AppState,
    auth: &AuthContext,
    request: GatewaySendMessage,
) -> Result<(), ApiFailure> {
    let kind = request.kind.unwrap_or(MessageKind::Text);
    // System messages are minted by the server, never accepted from clients.
    if kind == MessageKind::System {
        return Err(ApiFailure::InvalidRequest);
    }
    let content =
        MessageContent::try_from(request.content).map_err(|_| ApiFailure::InvalidRequest)?;

    require_conversation_permission(
        state,
        auth,
        &request.conversation_id,
        ConversationPermission::SendMessages,
        "conversation.send_messages",
    )
    .await?;
    match kind {
        MessageKind::Image | MessageKind::File | MessageKind::Video => {
            require_conversation_permission(
                state,
                auth,
                &request.conversation_id,
                ConversationPermission::SendMedia,
                "conversation.send_media",
            )
            .await?;
        }
        MessageKind::Audio => {
            require_conversation_permission(
                state,
                auth,
                &request.conversation_id,
                ConversationPermission::SendVoice,
                "conversation.send_voice",
            )
            .await?;
        }
        MessageKind::Text | MessageKind::System => {}
    }

    let record = MessageRecord {
        id: Ulid::new().to_string(),
        sender_id: auth.user_id,
        kind,
        content: content.as_str().to_owned(),
        reply_to_message_id: request.reply_to_message_id,
        created_at_unix: now_unix(),
    };
    store::append_message(state, &request.conversation_id, record.clone()).await?;

    let targets = {
        let conversations = state.conversations.read().await;
        let conversation = conversations
            .get(&request.conversation_id)
            .ok_or(ApiFailure::NotFound)?;
        delivery_targets(&conversation.members, &auth.user_id.to_string())
    };
    for target in &targets {
        store::upsert_delivery_status(state, &record.id, target, parley_core::DeliveryState::Sent)
            .await?;
    }

    let event = gateway_events::receive_message(&request.conversation_id, &record);
    broadcast_group_event(state, &request.conversation_id, &event, &[]).await;
    Ok(())
}

pub(crate) async fn handle_join_chat(
    state: &AppState,
    auth: &AuthContext,
    connection_id: Uuid,
    outbound_tx: &mpsc::Sender<String>,
    request: &GatewayChatScope,
) -> Result<(), ApiFailure> {
    let user_id = auth.user_id.to_string();
    let membership =
        store::membership_snapshot(state, &request.conversation_id, &user_id).await;
    if !membership.is_some_and(|snapshot| snapshot.active) {
        return Err(ApiFailure::Forbidden);
    }

    {
        let mut subscriptions = state.subscriptions.write().await;
        add_subscription(
            &mut subscriptions,
            conversation_group_key(&request.conversation_id),
            connection_id,
            outbound_tx.clone(),
        );
    }
    if let Some(connection) = state
        .connection_presence
        .write()
        .await
        .get_mut(&connection_id)
    {
        connection
            .conversation_ids
            .insert(request.conversation_id.clone());
    }

    let event = gateway_events::joined_chat(&request.conversation_id, auth.user_id);
    send_caller_event(outbound_tx, event).await;
    Ok(())
}

pub(crate) async fn handle_leave_chat(
    state: &AppState,
    auth: &AuthContext,
    connection_id: Uuid,
    outbound_tx: &mpsc::Sender<String>,
    request: &GatewayChatScope,
) {
    // Acknowledged to the caller only; the group never sees subscription churn.
    let event = gateway_events::left_chat(&request.conversation_id, auth.user_id);
    send_caller_event(outbound_tx, event).await;

    {
        let mut subscriptions = state.subscriptions.write().await;
        remove_subscription(
            &mut subscriptions,
            &conversation_group_key(&request.conversation_id),
            connection_id,
        );
    }
    if let Some(connection) = state
        .connection_presence
        .write()
        .await
        .get_mut(&connection_id)
    {
        connection.conversation_ids.remove(&request.conversation_id);
    }
}

pub(crate) async fn handle_mark_read(
    state: &AppState,
    auth: &AuthContext,
    request: &GatewayMarkRead,
) -> Result<(), ApiFailure> {
    let user_id = auth.user_id.to_string();
    let membership =
        store::membership_snapshot(state, &request.conversation_id, &user_id).await;
    if !membership.is_some_and(|snapshot| snapshot.active) {
        return Err(ApiFailure::Forbidden);
    }
    let sender_id = store::message_sender(state, &request.conversation_id, &request.message_id)
        .await
        .ok_or(ApiFailure::NotFound)?;
    store::set_last_read(state, &request.conversation_id, &user_id, &request.message_id).await?;
    // The pointer always advances; your own messages carry no receipt and
    // no notification.
    if sender_id == auth.user_id {
        return Ok(());
    }

    store::upsert_delivery_status(
        state,
        &request.message_id,
        &user_id,
        parley_core::DeliveryState::Read,
    )
    .await?;

    let event = gateway_events::message_read(
        &request.conversation_id,
        &request.message_id,
        auth.user_id,
        now_unix(),
    );
    broadcast_user_event(state, &sender_id.to_string(), &event).await;
    Ok(())
}

pub(crate) async fn handle_typing(
    state: &AppState,
    auth: &AuthContext,
    request: &GatewayChatScope,
    started: bool,
) -> Result<(), ApiFailure> {
    let user_id = auth.user_id.to_string();
    let membership =
        store::membership_snapshot(state, &request.conversation_id, &user_id).await;
    if !membership.is_some_and(|snapshot| snapshot.active) {
        return Err(ApiFailure::Forbidden);
    }

    let event = if started {
        gateway_events::user_typing(&request.conversation_id, auth.user_id)
    } else {
        gateway_events::user_stopped_typing(&request.conversation_id, auth.user_id)
    };
    // Typing never echoes back to any of the caller's own devices.
    let own_connections = {
        let presence = state.connection_presence.read().await;
        user_connection_ids(&presence, &user_id)
    };
    broadcast_group_event(state, &request.conversation_id, &event, &own_connections).await;
    Ok(())
}

pub(crate) async fn broadcast_group_event(
    state: &AppState,
    conversation_id: &str,
    event: &GatewayEvent,
    exclude: &[Uuid],
) {
    let mut slow_connections = Vec::new();
    {
        let mut subscriptions = state.subscriptions.write().await;
        dispatch_group_payload(
            &mut subscriptions,
            &conversation_group_key(conversation_id),
            &event.payload,
            state.runtime.max_gateway_event_bytes,
            event.event_type,
            exclude,
            &mut slow_connections,
        );
    }
    close_slow_connections(state, &slow_connections).await;
}

pub(crate) async fn broadcast_user_event(state: &AppState, user_id: &str, event: &GatewayEvent) {
    let connection_ids = {
        let presence = state.connection_presence.read().await;
        user_connection_ids(&presence, user_id)
    };
    if connection_ids.is_empty() {
        return;
    }

    let mut slow_connections = Vec::new();
    {
        let mut senders = state.connection_senders.write().await;
        dispatch_user_payload(
            &mut senders,
            &connection_ids,
            &event.payload,
            state.runtime.max_gateway_event_bytes,
            event.event_type,
            &mut slow_connections,
        );
    }
    close_slow_connections(state, &slow_connections).await;
}

async fn close_slow_connections(state: &AppState, slow_connections: &[Uuid]) {
    if slow_connections.is_empty() {
        return;
    }
    let controls = state.connection_controls.read().await;
    force_close_connections(&controls, slow_connections);
}

async fn send_caller_error(
    outbound_tx: &mpsc::Sender<String>,
    failure: &ApiFailure,
    op: &'static str,
) {
    let event = gateway_events::error(failure.error_code(), Some(op));
    send_caller_event(outbound_tx, event).await;
}

async fn send_caller_event(outbound_tx: &mpsc::Sender<String>, event: GatewayEvent) {
    match outbound_tx.try_send(event.payload) {
        Ok(()) => record_gateway_event_emitted("connection", event.event_type),
        Err(mpsc::error::TrySendError::Closed(_)) => {
            record_gateway_event_dropped("connection", event.event_type, "closed");
        }
        Err(mpsc::error::TrySendError::Full(_)) => {
            record_gateway_event_dropped("connection", event.event_type, "full_queue");
        }
    }
}
