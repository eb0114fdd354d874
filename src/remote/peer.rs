use axum::extract::ws::Message;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::message::{self, ButtonRequest, Inbound, Method};
use crate::app::AppHandle;
use crate::orchestrator::LaunchOutcome;

/// One connected client: its outbound queue and the queries it still owes answers to
pub struct Peer {
    outbound: mpsc::UnboundedSender<Message>,
    pending: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    app: AppHandle,
    updates: broadcast::Sender<Value>,
}

impl Peer {
    pub fn new(
        outbound: mpsc::UnboundedSender<Message>,
        app: AppHandle,
        updates: broadcast::Sender<Value>,
    ) -> Self {
        Self {
            outbound,
            pending: Mutex::new(HashMap::new()),
            app,
            updates,
        }
    }

    /// Stamp `data` with a fresh `_id` and queue it. Returns the id.
    pub fn send_json(&self, data: Value) -> String {
        let (id, data) = message::stamp(data);
        if self.outbound.send(Message::Text(data.to_string().into())).is_err() {
            debug!(id = %id, "connection closed, message dropped");
        }
        id
    }

    /// Send a query and get the client's correlated answer on the returned
    /// receiver. Nothing on the server asks clients anything yet; this drives
    /// the answer path in tests.
    #[cfg(test)]
    pub fn request(&self, data: Value) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        let (id, data) = message::stamp(data);
        if self.outbound.send(Message::Text(data.to_string().into())).is_err() {
            // Dropping `tx` tells the caller no answer is coming
            debug!(id = %id, "connection closed, query dropped");
            return rx;
        }
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);
        rx
    }

    /// Handle one text frame. Nothing in here closes the connection.
    pub async fn handle_text(&self, text: &str) {
        let payload: Value = match serde_json::from_str(text) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "malformed JSON message ignored");
                return;
            }
        };

        match message::classify(&payload) {
            Inbound::Request(name) => match Method::parse(name) {
                Some(method) => {
                    debug!(method = name, "dispatching");
                    self.dispatch(method, &payload).await;
                }
                None => warn!(method = name, "cannot dispatch method"),
            },
            Inbound::Response(id) => {
                let waiter = self
                    .pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&id);
                match waiter {
                    Some(tx) => {
                        debug!(id = %id, "got a response we have been waiting for");
                        let _ = tx.send(payload);
                    }
                    None => warn!(id = %id, "response to unknown request dropped"),
                }
            }
            Inbound::Undispatchable => {
                error!(payload = %payload, "don't know what to do with message")
            }
        }
    }

    async fn dispatch(&self, method: Method, payload: &Value) {
        match method {
            Method::Status => {
                let status = message::status_message(&self.app.status().await);
                self.send_json(message::reply_to(payload, status));
            }
            Method::Button => match serde_json::from_value::<ButtonRequest>(payload.clone()) {
                Ok(button) => self.press(button),
                Err(e) => warn!(error = %e, "invalid button request"),
            },
        }
    }

    /// Run the button's action on its own task, then push status to every client
    fn press(&self, button: ButtonRequest) {
        info!(id = %button.id, cmd = ?button.cmd, "button pressed");
        let app = self.app.clone();
        let updates = self.updates.clone();
        tokio::spawn(async move {
            match app.execute(button.action()).await {
                Ok(LaunchOutcome::Completed) => {}
                Ok(LaunchOutcome::Aborted { window }) => {
                    warn!(window = %window, "launch aborted")
                }
                Err(e) => warn!(error = %e, cmd = ?button.cmd, "button action failed"),
            }
            tokio::time::sleep(app.orchestrator().settings().settle_delay).await;
            let status = message::status_message(&app.status().await);
            // No subscribers just means nobody is connected anymore
            let _ = updates.send(status);
        });
    }

    /// Drop every outstanding query; their receivers see the sender vanish
    pub fn close(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if !pending.is_empty() {
            debug!(count = pending.len(), "discarding unanswered queries");
        }
        pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::Action;
    use crate::app::App;
    use crate::config::{Config, Window};
    use crate::orchestrator::{Orchestrator, Settings};
    use crate::tmux::testing::FakeTmux;
    use crate::tmux::TmuxClient;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    struct Harness {
        peer: Peer,
        outbound: mpsc::UnboundedReceiver<Message>,
        updates: broadcast::Receiver<Value>,
        fake: Arc<FakeTmux>,
    }

    fn harness() -> Harness {
        let fake = FakeTmux::new();
        let settings = Settings {
            check_interval: Duration::ZERO,
            settle_delay: Duration::ZERO,
            interrupt_grace: Duration::ZERO,
            ..Settings::default()
        };
        let config = Config::new(
            "robot",
            vec![
                Window::new("core", &["roscore"]),
                Window::new("nav", &["roslaunch nav nav.launch"]).with_tags(&["nav"]),
            ],
        );
        let orch = Arc::new(Orchestrator::new(
            config,
            TmuxClient::with_runner(fake.clone()),
            settings,
        ));
        let (app, handle) = App::new(orch, false);
        tokio::spawn(app.run());

        let (tx, outbound) = mpsc::unbounded_channel();
        let (updates_tx, updates) = broadcast::channel(8);
        Harness {
            peer: Peer::new(tx, handle, updates_tx),
            outbound,
            updates,
            fake,
        }
    }

    fn sent(outbound: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Value> {
        let mut messages = Vec::new();
        while let Ok(msg) = outbound.try_recv() {
            if let Message::Text(text) = msg {
                messages.push(serde_json::from_str(text.as_str()).unwrap());
            }
        }
        messages
    }

    #[tokio::test]
    async fn test_status_round_trip() {
        let mut h = harness();
        h.peer
            .app
            .execute(Action::launch(Some("core".to_string())))
            .await
            .unwrap();
        sent(&mut h.outbound);

        h.peer
            .handle_text(r#"{"method": "status", "_id": "req-1"}"#)
            .await;

        let replies = sent(&mut h.outbound);
        assert_eq!(replies.len(), 1);
        let reply = &replies[0];
        assert_eq!(reply["_response_to"], "req-1");
        assert_eq!(reply["_query"], json!({"method": "status", "_id": "req-1"}));
        assert_eq!(reply["method"], "update_status");
        assert_eq!(reply["windows"], json!({"core": true, "nav": false}));
        assert!(reply["_id"].as_str().is_some_and(|id| id != "req-1"));
    }

    #[tokio::test]
    async fn test_unknown_method_gets_no_reply() {
        let mut h = harness();
        h.peer
            .handle_text(r#"{"method": "self_destruct", "_id": "x"}"#)
            .await;
        h.peer.handle_text("not json at all").await;
        h.peer.handle_text(r#"{"just": "data"}"#).await;
        assert!(sent(&mut h.outbound).is_empty());
    }

    #[tokio::test]
    async fn test_stray_response_is_dropped() {
        let mut h = harness();
        h.peer
            .handle_text(r#"{"_response_to": "never-asked", "_query": {"method": "status"}}"#)
            .await;
        assert!(sent(&mut h.outbound).is_empty());
    }

    #[tokio::test]
    async fn test_pending_response_is_delivered_once() {
        let mut h = harness();
        let rx = h.peer.request(json!({"method": "ping"}));
        let query = sent(&mut h.outbound).remove(0);
        let id = query["_id"].as_str().unwrap().to_string();

        let answer = json!({"_response_to": id, "_query": query, "pong": true});
        h.peer.handle_text(&answer.to_string()).await;
        assert_eq!(rx.await.unwrap()["pong"], true);

        // The entry is gone, so a duplicate answer is just dropped
        h.peer.handle_text(&answer.to_string()).await;
        assert!(sent(&mut h.outbound).is_empty());
    }

    #[tokio::test]
    async fn test_query_on_closed_connection_resolves_immediately() {
        let Harness { peer, outbound, .. } = harness();
        drop(outbound);
        let rx = peer.request(json!({"method": "ping"}));
        assert!(rx.await.is_err());
        assert!(peer.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_close_discards_pending_queries() {
        let h = harness();
        let rx = h.peer.request(json!({"method": "ping"}));
        h.peer.close();
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_button_runs_action_and_broadcasts_status() {
        let mut h = harness();
        h.peer
            .handle_text(r#"{"method": "button", "id": "nav", "cmd": "launch-tag", "_id": "b"}"#)
            .await;

        let update = tokio::time::timeout(Duration::from_secs(5), h.updates.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update["method"], "update_status");
        assert_eq!(update["windows"], json!({"core": false, "nav": true}));
        assert!(h.fake.has_session("robot"));
        // Buttons are answered by the broadcast, not by a reply
        assert!(sent(&mut h.outbound).is_empty());
    }
}
