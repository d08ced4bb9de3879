use crate::auth::{self, Identity, Session};
use crate::error::{AppError, AppResult};
use crate::events::{DomainEvent, EventBus};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// WebSocket message types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsMessage {
    #[serde(rename = "subscribe")]
    Subscribe {
        channel: String, // "group:{id}", "user:{id}"
    },
    #[serde(rename = "unsubscribe")]
    Unsubscribe { channel: String },
    #[serde(rename = "event")]
    Event { channel: String, event: DomainEvent },
    #[serde(rename = "error")]
    Error { message: String },
}

/// Handshake header carrying the user id established by the session layer
pub const USER_HEADER: &str = "x-user-id";

/// Only `group:<uuid>` and `user:<uuid>` can be subscribed to
pub fn is_valid_channel(channel: &str) -> bool {
    match channel.split_once(':') {
        Some(("group", id)) | Some(("user", id)) => Uuid::parse_str(id).is_ok(),
        _ => false,
    }
}

/// Group channels are public; a user channel is readable by its owner only
pub fn authorize_channel(identity: &dyn Identity, channel: &str) -> AppResult<()> {
    if !is_valid_channel(channel) {
        return Err(AppError::Validation(format!("unknown channel {}", channel)));
    }
    let owner = match channel.strip_prefix("user:").map(Uuid::parse_str) {
        Some(Ok(owner)) => owner,
        _ => return Ok(()),
    };

    if auth::authenticate(identity)? == owner {
        Ok(())
    } else {
        Err(AppError::Unauthorized("cannot subscribe to another user's channel".to_string()))
    }
}

/// WebSocket server relaying domain events to subscribed clients
pub struct WebSocketServer {
    /// Broadcast sender for sending messages to all clients
    tx: broadcast::Sender<WsMessage>,
    /// Active subscriptions: channel -> client IDs
    subscriptions: Arc<RwLock<HashMap<String, Vec<Uuid>>>>,
    /// Client subscriptions: client_id -> channels
    client_channels: Arc<RwLock<HashMap<Uuid, Vec<String>>>>,
}

impl WebSocketServer {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1000);

        Self {
            tx,
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            client_channels: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn sender(&self) -> broadcast::Sender<WsMessage> {
        self.tx.clone()
    }

    /// Broadcast a message to all subscribers of a channel
    pub async fn broadcast_to_channel(&self, channel: &str, message: WsMessage) {
        let subscriptions = self.subscriptions.read().await;

        if let Some(subscribers) = subscriptions.get(channel) {
            let count = subscribers.len();
            if count > 0 {
                debug!("Broadcasting to {} subscribers on channel {}", count, channel);
                if let Err(e) = self.tx.send(message) {
                    warn!("Failed to broadcast message: {}", e);
                }
            }
        }
    }

    /// Forward every event on the bus to its `group:` and `user:` channels
    pub fn relay_events(&self, bus: &EventBus) -> JoinHandle<()> {
        let mut events = bus.subscribe();
        let server = self.clone();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        for channel in event.channels() {
                            let message = WsMessage::Event {
                                channel: channel.clone(),
                                event: event.clone(),
                            };
                            server.broadcast_to_channel(&channel, message).await;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Event relay lagged, {} events skipped", skipped);
                    }
                    Err(RecvError::Closed) => {
                        info!("Event bus closed, relay stopping");
                        break;
                    }
                }
            }
        })
    }

    /// Subscribe a client to a channel its identity may read
    pub async fn subscribe(&self, client_id: Uuid, identity: &dyn Identity, channel: String) -> AppResult<()> {
        if let Err(e) = authorize_channel(identity, &channel) {
            warn!("Client {} refused {}: {}", client_id, channel, e);
            return Err(e);
        }

        let mut subscriptions = self.subscriptions.write().await;
        let mut client_channels = self.client_channels.write().await;

        let subscribers = subscriptions.entry(channel.clone()).or_insert_with(Vec::new);
        if !subscribers.contains(&client_id) {
            subscribers.push(client_id);
        }

        let channels = client_channels.entry(client_id).or_insert_with(Vec::new);
        if !channels.contains(&channel) {
            channels.push(channel.clone());
        }

        info!("Client {} subscribed to {}", client_id, channel);
        Ok(())
    }

    /// Unsubscribe a client from a channel
    pub async fn unsubscribe(&self, client_id: Uuid, channel: &str) {
        let mut subscriptions = self.subscriptions.write().await;
        let mut client_channels = self.client_channels.write().await;

        if let Some(subscribers) = subscriptions.get_mut(channel) {
            subscribers.retain(|&id| id != client_id);
            if subscribers.is_empty() {
                subscriptions.remove(channel);
            }
        }

        if let Some(channels) = client_channels.get_mut(&client_id) {
            channels.retain(|c| c != channel);
            if channels.is_empty() {
                client_channels.remove(&client_id);
            }
        }

        info!("Client {} unsubscribed from {}", client_id, channel);
    }

    pub async fn get_client_channels(&self, client_id: Uuid) -> Vec<String> {
        let client_channels = self.client_channels.read().await;
        client_channels.get(&client_id).cloned().unwrap_or_default()
    }

    async fn is_client_subscribed(&self, client_id: Uuid, channel: &str) -> bool {
        let subscriptions = self.subscriptions.read().await;
        subscriptions
            .get(channel)
            .map_or(false, |subscribers| subscribers.contains(&client_id))
    }

    /// Handle a new WebSocket connection.
    ///
    /// The connection is bound to the identity in the `x-user-id` handshake
    /// header; without it only group channels can be subscribed to.
    pub async fn handle_connection(&self, stream: tokio::net::TcpStream) -> AppResult<()> {
        let mut user_header: Option<String> = None;
        let capture_user = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            user_header = request
                .headers()
                .get(USER_HEADER)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            Ok(response)
        };
        let ws_stream = accept_hdr_async(stream, capture_user)
            .await
            .map_err(|e| AppError::Message(format!("WebSocket handshake failed: {}", e)))?;
        let session = Session::from_header(user_header.as_deref())?;

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let mut rx = self.tx.subscribe();
        let client_id = Uuid::new_v4();

        info!("New WebSocket connection: {}", client_id);

        let welcome = serde_json::json!({
            "type": "connected",
            "client_id": client_id.to_string(),
            "user_id": session.current_user_id().map(|id| id.to_string()),
        });
        if let Err(e) = ws_sender.send(Message::Text(welcome.to_string())).await {
            warn!("Failed to send welcome message: {}", e);
        }

        let ws_sender = Arc::new(tokio::sync::Mutex::new(ws_sender));
        let ws_sender_for_receiver = ws_sender.clone();
        let ws_server_for_receiver = self.clone();

        tokio::spawn(async move {
            while let Some(msg) = ws_receiver.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let reply = match serde_json::from_str::<WsMessage>(&text) {
                            Ok(WsMessage::Subscribe { channel }) => {
                                match ws_server_for_receiver.subscribe(client_id, &session, channel.clone()).await {
                                    Ok(()) => serde_json::json!({ "type": "subscribed", "channel": channel }),
                                    Err(e) => serde_json::json!({ "type": "error", "message": e.to_string() }),
                                }
                            }
                            Ok(WsMessage::Unsubscribe { channel }) => {
                                ws_server_for_receiver.unsubscribe(client_id, &channel).await;
                                serde_json::json!({ "type": "unsubscribed", "channel": channel })
                            }
                            Ok(_) => {
                                warn!("Unexpected message type from client {}", client_id);
                                serde_json::json!({ "type": "error", "message": "Unexpected message type" })
                            }
                            Err(_) => {
                                warn!("Failed to parse message from client {}: {}", client_id, text);
                                serde_json::json!({ "type": "error", "message": "Invalid message format" })
                            }
                        };

                        let mut sender = ws_sender_for_receiver.lock().await;
                        if let Err(e) = sender.send(Message::Text(reply.to_string())).await {
                            warn!("Failed to reply to client {}: {}", client_id, e);
                        }
                    }
                    Ok(Message::Close(_)) => {
                        info!("WebSocket connection closed: {}", client_id);
                        break;
                    }
                    Err(e) => {
                        error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            let channels = ws_server_for_receiver.get_client_channels(client_id).await;
            for channel in channels {
                ws_server_for_receiver.unsubscribe(client_id, &channel).await;
            }
        });

        let ws_server_clone = self.clone();
        let ws_sender_for_broadcast = ws_sender.clone();
        tokio::spawn(async move {
            loop {
                let msg = match rx.recv().await {
                    Ok(msg) => msg,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Client {} lagged, {} messages skipped", client_id, skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };

                let should_send = match &msg {
                    WsMessage::Event { channel, .. } => ws_server_clone.is_client_subscribed(client_id, channel).await,
                    _ => false,
                };
                if !should_send {
                    continue;
                }

                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        error!("Failed to serialize message: {}", e);
                        continue;
                    }
                };

                let mut sender = ws_sender_for_broadcast.lock().await;
                if let Err(e) = sender.send(Message::Text(json)).await {
                    debug!("Failed to send message to client {}: {}", client_id, e);
                    break;
                }
            }
        });

        Ok(())
    }
}

impl Clone for WebSocketServer {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            subscriptions: Arc::clone(&self.subscriptions),
            client_channels: Arc::clone(&self.client_channels),
        }
    }
}

impl Default for WebSocketServer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GroupStatus, TransitionReason};
    use std::time::Duration;

    #[test]
    fn test_channel_names() {
        let id = Uuid::new_v4();
        assert!(is_valid_channel(&format!("group:{}", id)));
        assert!(is_valid_channel(&format!("user:{}", id)));
        assert!(!is_valid_channel(&format!("event:{}", id)));
        assert!(!is_valid_channel("group:not-a-uuid"));
        assert!(!is_valid_channel("group"));
    }

    #[test]
    fn test_user_channel_belongs_to_its_owner() {
        let owner = Uuid::new_v4();
        let user_channel = format!("user:{}", owner);

        assert!(authorize_channel(&Session::authenticated(owner), &user_channel).is_ok());
        assert!(matches!(
            authorize_channel(&Session::authenticated(Uuid::new_v4()), &user_channel),
            Err(AppError::Unauthorized(_))
        ));
        assert!(matches!(
            authorize_channel(&Session::anonymous(), &user_channel),
            Err(AppError::Unauthenticated)
        ));

        let group_channel = format!("group:{}", Uuid::new_v4());
        assert!(authorize_channel(&Session::anonymous(), &group_channel).is_ok());
        assert!(matches!(
            authorize_channel(&Session::anonymous(), "user:not-a-uuid"),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            authorize_channel(&Session::anonymous(), "event:x"),
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_subscribe_is_deduplicated_and_cleaned_up() {
        let server = WebSocketServer::new();
        let client = Uuid::new_v4();
        let channel = format!("group:{}", Uuid::new_v4());

        let anonymous = Session::anonymous();
        server.subscribe(client, &anonymous, channel.clone()).await.unwrap();
        server.subscribe(client, &anonymous, channel.clone()).await.unwrap();
        assert_eq!(server.get_client_channels(client).await, vec![channel.clone()]);
        assert!(server.is_client_subscribed(client, &channel).await);

        server.unsubscribe(client, &channel).await;
        assert!(server.get_client_channels(client).await.is_empty());
        assert!(!server.is_client_subscribed(client, &channel).await);
    }

    #[tokio::test]
    async fn test_relay_routes_events_to_subscribed_channels() {
        let server = WebSocketServer::new();
        let bus = EventBus::new(16);
        let group_id = Uuid::new_v4();
        let leader = Uuid::new_v4();
        let group_channel = format!("group:{}", group_id);

        server
            .subscribe(Uuid::new_v4(), &Session::anonymous(), group_channel.clone())
            .await
            .unwrap();
        let mut outbound = server.sender().subscribe();
        let _relay = server.relay_events(&bus);

        bus.publish(DomainEvent::GroupFinalized {
            group_id,
            leader_user_id: leader,
            status: GroupStatus::Failed,
            reason: TransitionReason::ExpiredWithoutFriends,
            actual_friend_count: 0,
        });

        let message = tokio::time::timeout(Duration::from_secs(1), outbound.recv())
            .await
            .expect("relay timed out")
            .unwrap();
        match message {
            WsMessage::Event { channel, event } => {
                assert_eq!(channel, group_channel);
                assert_eq!(event.group_id(), group_id);
            }
            other => panic!("unexpected message {:?}", other),
        }

        // Nobody listens on the leader's user channel, so nothing else goes out
        let nothing = tokio::time::timeout(Duration::from_millis(100), outbound.recv()).await;
        assert!(nothing.is_err());
    }
}
