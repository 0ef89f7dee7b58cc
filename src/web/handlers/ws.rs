//! WebSocket channel for live conversion progress.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::schedule::broadcast::{EventSender, SubscriberId};
use crate::schedule::{Dispatcher, ListChange, TaskEvent, TaskSnapshot};
use crate::AppContext;

/// Requests a client may send.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    JoinConversion { conversion_id: String },
    LeaveConversion { conversion_id: String },
    GetConversionStatus { conversion_id: String },
    GetAllConversions,
}

/// Connection-level messages. Per-task events go out as [`TaskEvent`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ConnectionStatus {
        status: String,
        message: String,
    },
    ActiveConversions {
        active_conversions: Vec<TaskSnapshot>,
        history_count: usize,
    },
    AllConversions {
        active_conversions: Vec<TaskSnapshot>,
        history_count: usize,
    },
    /// A task was created or finished.
    ConversionUpdate(ListChange),
    Error {
        message: String,
    },
}

#[derive(Debug)]
enum Outgoing {
    Server(ServerMessage),
    Task(TaskEvent),
}

impl Outgoing {
    fn to_json(&self) -> serde_json::Result<String> {
        match self {
            Outgoing::Server(msg) => serde_json::to_string(msg),
            Outgoing::Task(event) => serde_json::to_string(event),
        }
    }
}

/// Task subscriptions held by one connection. All of them feed the same
/// channel, so the connection has a single event stream to drain.
struct Session {
    dispatcher: Arc<Dispatcher>,
    events: EventSender,
    joined: HashMap<String, SubscriberId>,
}

impl Session {
    fn new(dispatcher: Arc<Dispatcher>, events: EventSender) -> Self {
        Self {
            dispatcher,
            events,
            joined: HashMap::new(),
        }
    }

    fn error(message: impl Into<String>) -> Vec<Outgoing> {
        vec![Outgoing::Server(ServerMessage::Error {
            message: message.into(),
        })]
    }

    fn handle_text(&mut self, text: &str) -> Vec<Outgoing> {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => self.handle(msg),
            Err(e) => {
                debug!("Unparseable client message: {}", e);
                Self::error(format!("Invalid message: {}", e))
            }
        }
    }

    fn handle(&mut self, msg: ClientMessage) -> Vec<Outgoing> {
        match msg {
            ClientMessage::JoinConversion { conversion_id } => {
                if self.dispatcher.get_status(&conversion_id).is_none() {
                    return Self::error(format!("Conversion not found: {}", conversion_id));
                }
                if !self.joined.contains_key(&conversion_id) {
                    // the snapshot arrives through the event channel
                    let id = self
                        .dispatcher
                        .broadcaster()
                        .subscribe(&conversion_id, self.events.clone());
                    self.joined.insert(conversion_id, id);
                }
                Vec::new()
            }
            ClientMessage::LeaveConversion { conversion_id } => {
                if let Some(id) = self.joined.remove(&conversion_id) {
                    self.dispatcher.broadcaster().unsubscribe(&conversion_id, id);
                }
                Vec::new()
            }
            ClientMessage::GetConversionStatus { conversion_id } => {
                match self.dispatcher.get_status(&conversion_id) {
                    Some(task) => vec![Outgoing::Task(TaskEvent::Status(task))],
                    None => Self::error(format!("Conversion not found: {}", conversion_id)),
                }
            }
            ClientMessage::GetAllConversions => {
                let active = self.dispatcher.list_active();
                vec![Outgoing::Server(ServerMessage::AllConversions {
                    active_conversions: active.active,
                    history_count: active.history_count,
                })]
            }
        }
    }

    fn close(&mut self) {
        let broadcaster = self.dispatcher.broadcaster();
        for (conversion_id, id) in self.joined.drain() {
            broadcaster.unsubscribe(&conversion_id, id);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(ctx): State<Arc<AppContext>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, ctx))
}

async fn handle_socket(socket: WebSocket, ctx: Arc<AppContext>) {
    let (mut sender, mut receiver) = socket.split();
    let dispatcher = ctx.dispatcher.clone();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut list_rx = dispatcher.broadcaster().watch_list();
    let mut session = Session::new(dispatcher.clone(), events_tx);

    info!("WebSocket client connected");

    let active = dispatcher.list_active();
    let greeting = [
        Outgoing::Server(ServerMessage::ConnectionStatus {
            status: "connected".to_string(),
            message: "Connected to conversion service".to_string(),
        }),
        Outgoing::Server(ServerMessage::ActiveConversions {
            active_conversions: active.active,
            history_count: active.history_count,
        }),
    ];
    for msg in &greeting {
        if !send(&mut sender, msg).await {
            return;
        }
    }

    loop {
        let outgoing = tokio::select! {
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => session.handle_text(&text),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    debug!("WebSocket receive failed: {}", e);
                    break;
                }
            },
            Some(event) = events_rx.recv() => vec![Outgoing::Task(event)],
            change = list_rx.recv() => match change {
                Ok(change) => vec![Outgoing::Server(ServerMessage::ConversionUpdate(change))],
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("WebSocket client lagged, skipped {} list updates", n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        for msg in &outgoing {
            if !send(&mut sender, msg).await {
                info!("WebSocket client disconnected");
                return;
            }
        }
    }

    info!("WebSocket client disconnected");
}

async fn send<S>(sender: &mut S, msg: &Outgoing) -> bool
where
    S: futures::Sink<Message> + Unpin,
{
    match msg.to_json() {
        Ok(json) => {
            if sender.send(Message::Text(json)).await.is_err() {
                debug!("WebSocket send failed, client disconnected");
                return false;
            }
            true
        }
        Err(e) => {
            error!("Failed to serialize WebSocket message: {}", e);
            true
        }
    }
}
