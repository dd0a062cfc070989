use crate::error::ChatError;
use crate::identity::Identity;
use crate::room::{ChatRoom, Subscription};
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use room_api::{ClientCommand, ServerEvent};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Replies addressed to this connection only (errors) that wait for the writer.
const REPLY_BUFFER: usize = 8;

/// Drive one WebSocket connection until either side goes away.
///
/// The client is registered before history is read, so a message posted in
/// between may arrive both in `init` and as a live event.
pub async fn session(socket: WebSocket, chat: ChatRoom, identity: Identity, room: Option<String>) {
    let sub = match chat.subscribe(room.as_deref(), &identity).await {
        Ok(sub) => sub,
        Err(e) => {
            warn!(error = %e, "websocket subscribe failed");
            return;
        }
    };
    let Subscription {
        room,
        hub,
        mut mailbox,
    } = sub;
    let client = mailbox.id();
    debug!(room = %room, client = %client, user = identity.user_id, "websocket connected");

    let (mut sender, mut receiver) = socket.split();
    match chat.history(&room, chat.settings().history_limit, 0).await {
        Ok(messages) => {
            if let Some(text) = encode(&ServerEvent::Init { messages }) {
                if sender.send(Message::Text(text)).await.is_err() {
                    chat.unsubscribe(&room, hub, client).await;
                    return;
                }
            }
        }
        Err(e) => warn!(room = %room, error = %e, "history load failed"),
    }

    let (reply_tx, mut reply_rx) = mpsc::channel::<Bytes>(REPLY_BUFFER);
    let mut writer = tokio::spawn(async move {
        loop {
            let payload = tokio::select! {
                p = mailbox.recv() => p,
                p = reply_rx.recv() => p,
            };
            // `None` from the mailbox means the hub dropped us.
            let Some(payload) = payload else { break };
            let Ok(text) = String::from_utf8(Vec::from(payload)) else {
                continue;
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    loop {
        tokio::select! {
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    handle_frame(&chat, &identity, &room, &text, &reply_tx).await;
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            _ = &mut writer => break,
        }
    }

    chat.unsubscribe(&room, hub, client).await;
    writer.abort();
    debug!(room = %room, client = %client, "websocket closed");
}

async fn handle_frame(
    chat: &ChatRoom,
    identity: &Identity,
    room: &str,
    text: &str,
    reply: &mpsc::Sender<Bytes>,
) {
    let cmd = match serde_json::from_str::<ClientCommand>(text) {
        Ok(cmd) => cmd,
        Err(_) => {
            debug!(room, "ignoring unknown frame");
            return;
        }
    };
    match cmd {
        ClientCommand::Send(mut req) => {
            req.room = Some(room.to_string());
            if let Err(e) = chat.post(identity, req).await {
                let message = public_message(&e);
                if let Some(text) = encode(&ServerEvent::Error { message }) {
                    let _ = reply.send(Bytes::from(text)).await;
                }
            }
        }
    }
}

/// Error text safe to show the sender.
pub(crate) fn public_message(e: &ChatError) -> String {
    if e.is_validation() || matches!(e, ChatError::RoomDisabled) {
        e.to_string()
    } else {
        warn!(error = %e, "message post failed");
        "internal error".into()
    }
}

fn encode(ev: &ServerEvent) -> Option<String> {
    match serde_json::to_string(ev) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!(error = %e, "event encoding failed");
            None
        }
    }
}
