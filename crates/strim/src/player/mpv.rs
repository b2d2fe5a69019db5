//! mpv JSON IPC client over the `--input-ipc-server` Unix socket.
//!
//! Requests carry a `request_id`; responses are matched back to the waiting
//! caller. Everything with an `event` field is forwarded to subscribers.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use super::{ObserverId, PlaybackController, PlayerError, PlayerEvent};

const EVENT_CAPACITY: usize = 256;

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, String>>>>>;

#[derive(Serialize)]
struct Request<'a> {
    command: &'a [Value],
    request_id: u64,
}

#[derive(Debug, Deserialize)]
struct Message {
    request_id: Option<u64>,
    error: Option<String>,
    #[serde(default)]
    data: Value,
    event: Option<String>,
    id: Option<u64>,
    name: Option<String>,
}

pub struct MpvIpc {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Pending,
    next_request: AtomicU64,
    next_observer: AtomicU64,
    events: broadcast::Sender<PlayerEvent>,
    reader: JoinHandle<()>,
}

impl MpvIpc {
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, PlayerError> {
        let stream = UnixStream::connect(path.as_ref()).await?;
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: UnixStream) -> Self {
        let (read, write) = stream.into_split();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let reader = tokio::spawn(read_loop(read, Arc::clone(&pending), events.clone()));

        Self {
            writer: tokio::sync::Mutex::new(write),
            pending,
            next_request: AtomicU64::new(1),
            next_observer: AtomicU64::new(1),
            events,
            reader,
        }
    }

    pub async fn request(&self, command: Vec<Value>) -> Result<Value, PlayerError> {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let mut line = serde_json::to_vec(&Request {
            command: &command,
            request_id,
        })?;
        line.push(b'\n');

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id, tx);

        let written = {
            let mut writer = self.writer.lock().await;
            writer.write_all(&line).await
        };
        if let Err(e) = written {
            self.pending.lock().remove(&request_id);
            return Err(e.into());
        }

        match rx.await {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(reason)) => Err(PlayerError::Rejected {
                command: describe(&command),
                reason,
            }),
            Err(_) => Err(PlayerError::Closed),
        }
    }
}

impl Drop for MpvIpc {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl PlaybackController for MpvIpc {
    async fn get_property(&self, name: &str) -> Result<Value, PlayerError> {
        self.request(vec!["get_property".into(), name.into()]).await
    }

    async fn set_property(&self, name: &str, value: Value) -> Result<(), PlayerError> {
        self.request(vec!["set_property".into(), name.into(), value])
            .await
            .map(drop)
    }

    async fn command(&self, args: Vec<Value>) -> Result<Value, PlayerError> {
        self.request(args).await
    }

    async fn observe_property(&self, name: &str) -> Result<ObserverId, PlayerError> {
        let id = self.next_observer.fetch_add(1, Ordering::Relaxed);
        self.request(vec!["observe_property".into(), id.into(), name.into()])
            .await?;
        Ok(id)
    }

    async fn unobserve_property(&self, id: ObserverId) -> Result<(), PlayerError> {
        self.request(vec!["unobserve_property".into(), id.into()])
            .await
            .map(drop)
    }

    fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.events.subscribe()
    }
}

async fn read_loop(read: OwnedReadHalf, pending: Pending, events: broadcast::Sender<PlayerEvent>) {
    let mut lines = BufReader::new(read).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                log::warn!("mpv IPC read failed: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let message: Message = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Ignoring malformed mpv message {:?}: {}", line, e);
                continue;
            }
        };

        if let Some(event) = message.event.as_deref() {
            let _ = events.send(map_event(event, &message));
            continue;
        }

        if let Some(request_id) = message.request_id {
            let Some(tx) = pending.lock().remove(&request_id) else {
                log::debug!("mpv response for unknown request {}", request_id);
                continue;
            };
            let result = match message.error.as_deref() {
                None | Some("success") => Ok(message.data),
                Some(reason) => Err(reason.to_string()),
            };
            let _ = tx.send(result);
        }
    }

    // Dropping the senders fails every outstanding request with `Closed`.
    pending.lock().clear();
    let _ = events.send(PlayerEvent::Shutdown);
}

fn map_event(event: &str, message: &Message) -> PlayerEvent {
    match event {
        "property-change" => PlayerEvent::PropertyChange {
            id: message.id.unwrap_or_default(),
            name: message.name.clone().unwrap_or_default(),
            data: message.data.clone(),
        },
        "seek" => PlayerEvent::Seek,
        "playback-restart" => PlayerEvent::PlaybackRestart,
        "file-loaded" => PlayerEvent::FileLoaded,
        "end-file" => PlayerEvent::EndFile,
        "shutdown" => PlayerEvent::Shutdown,
        other => PlayerEvent::Other(other.to_string()),
    }
}

fn describe(command: &[Value]) -> String {
    command
        .iter()
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}
