//! Shared event bus. Events fan out to in-process subscribers over a
//! broadcast channel and are mirrored to the external event service when
//! one is configured. A background task tails the remote feed so that
//! events published by other services (roster changes in particular)
//! reach local subscribers as well.

use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const ROSTER_CHANGED: &str = "tkd.roster.v1.RosterChangedEvent";
pub const ON_CALL_CHANGE: &str = "tkd.pbx3cx.v1.OnCallChangeEvent";
pub const OVERWRITE_CREATED: &str = "tkd.pbx3cx.v1.OverwriteCreatedEvent";
pub const OVERWRITE_DELETED: &str = "tkd.pbx3cx.v1.OverwriteDeletedEvent";
pub const CALL_RECORD_RECEIVED: &str = "tkd.pbx3cx.v1.CallRecordReceived";

const LOCAL_CHANNEL_CAPACITY: usize = 64;
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub type_url: String,
    pub payload: Value,
    #[serde(default)]
    pub retained: bool,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    remote: Option<Remote>,
}

#[derive(Clone)]
struct Remote {
    http: reqwest::Client,
    base_url: String,
}

impl EventBus {
    pub fn new(remote_url: Option<String>) -> Self {
        let (tx, _) = broadcast::channel(LOCAL_CHANNEL_CAPACITY);
        Self {
            tx,
            remote: remote_url.map(|base_url| Remote {
                http: reqwest::Client::new(),
                base_url,
            }),
        }
    }

    /// Publishes an event to local subscribers and, fire-and-forget, to
    /// the remote event service.
    pub fn publish<T: Serialize>(&self, type_url: &str, payload: &T, retained: bool) {
        let payload = match serde_json::to_value(payload) {
            Ok(value) => value,
            Err(err) => {
                error!(error = %err, type_url, "failed to serialize event payload");
                return;
            }
        };

        let event = Event {
            type_url: type_url.to_string(),
            payload,
            retained,
        };

        let _ = self.tx.send(event.clone());

        if let Some(remote) = self.remote.clone() {
            tokio::spawn(async move {
                let url = format!(
                    "{}/tkd.events.v1.EventService/Publish",
                    remote.base_url.trim_end_matches('/')
                );
                match remote.http.post(&url).json(&event).send().await {
                    Ok(response) if !response.status().is_success() => {
                        error!(status = %response.status(), type_url = %event.type_url, "failed to publish event");
                    }
                    Ok(_) => {}
                    Err(err) => {
                        error!(error = %err, type_url = %event.type_url, "failed to publish event");
                    }
                }
            });
        }
    }

    /// Subscribes to events of a single type.
    pub fn subscribe(&self, type_url: &str) -> EventStream {
        EventStream {
            type_url: type_url.to_string(),
            rx: self.tx.subscribe(),
        }
    }

    /// Spawns the task tailing the remote SSE feed into the local
    /// channel. No-op when no event service is configured.
    pub fn start_remote_listener(&self, cancel: CancellationToken) {
        let Some(remote) = self.remote.clone() else {
            return;
        };
        let tx = self.tx.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = tail_remote_feed(&remote, &tx) => {
                        if let Err(err) = result {
                            warn!(error = %err, "event feed disconnected, reconnecting");
                        }
                    }
                }

                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
        });
    }
}

pub struct EventStream {
    type_url: String,
    rx: broadcast::Receiver<Event>,
}

impl EventStream {
    /// Waits for the next event of the subscribed type. Returns `None`
    /// once the bus has shut down. Missed events caused by a lagging
    /// receiver are skipped.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.type_url == self.type_url => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, type_url = %self.type_url, "event subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

async fn tail_remote_feed(remote: &Remote, tx: &broadcast::Sender<Event>) -> anyhow::Result<()> {
    let url = format!("{}/subscribe", remote.base_url.trim_end_matches('/'));

    let response = remote
        .http
        .get(&url)
        .header("accept", "text/event-stream")
        .send()
        .await?
        .error_for_status()?;

    info!("subscribed to remote event feed");

    let mut stream = response.bytes_stream();
    let mut buffer = String::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(pos) = buffer.find('\n') {
            let line = buffer[..pos].trim_end_matches('\r').to_string();
            buffer.drain(..=pos);

            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };

            match serde_json::from_str::<Event>(data.trim()) {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(err) => {
                    warn!(error = %err, "failed to decode remote event");
                }
            }
        }
    }

    Ok(())
}
