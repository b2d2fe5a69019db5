#[cfg(unix)]
pub mod mpv;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::debounce::{Clock, Debouncer};
use crate::net::{Packet, PacketError, PacketKind};

pub type ObserverId = u64;

#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    PropertyChange {
        id: ObserverId,
        name: String,
        data: Value,
    },
    Seek,
    PlaybackRestart,
    FileLoaded,
    EndFile,
    Shutdown,
    Other(String),
}

impl PlayerEvent {
    pub fn property(&self, property: &str) -> Option<&Value> {
        match self {
            PlayerEvent::PropertyChange { name, data, .. } if name == property => Some(data),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PlayerError {
    #[error("player rejected `{command}`: {reason}")]
    Rejected { command: String, reason: String },
    #[error("property `{name}` is not a {expected}")]
    PropertyType { name: String, expected: &'static str },
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("player connection closed")]
    Closed,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed player message: {0}")]
    Json(#[from] serde_json::Error),
}

/// Control surface of the media engine.
///
/// Events from [`PlaybackController::subscribe`] are delivered in order on a
/// single channel; consumers handle them sequentially.
#[async_trait]
pub trait PlaybackController: Send + Sync {
    async fn get_property(&self, name: &str) -> Result<Value, PlayerError>;

    async fn set_property(&self, name: &str, value: Value) -> Result<(), PlayerError>;

    async fn command(&self, args: Vec<Value>) -> Result<Value, PlayerError>;

    async fn observe_property(&self, name: &str) -> Result<ObserverId, PlayerError>;

    async fn unobserve_property(&self, id: ObserverId) -> Result<(), PlayerError>;

    fn subscribe(&self) -> broadcast::Receiver<PlayerEvent>;

    async fn is_paused(&self) -> Result<bool, PlayerError> {
        let value = self.get_property("pause").await?;
        value.as_bool().ok_or_else(|| PlayerError::PropertyType {
            name: "pause".into(),
            expected: "boolean",
        })
    }

    async fn set_paused(&self, paused: bool) -> Result<(), PlayerError> {
        self.set_property("pause", Value::Bool(paused)).await
    }

    async fn playback_time(&self) -> Result<f64, PlayerError> {
        let value = self.get_property("playback-time").await?;
        value.as_f64().ok_or_else(|| PlayerError::PropertyType {
            name: "playback-time".into(),
            expected: "number",
        })
    }

    async fn seek_to(&self, position: f64) -> Result<(), PlayerError> {
        self.set_property("playback-time", Value::from(position))
            .await
    }

    async fn load(&self, url: &str) -> Result<(), PlayerError> {
        self.command(vec!["loadfile".into(), url.into(), "replace".into()])
            .await
            .map(drop)
    }

    async fn stop(&self) -> Result<(), PlayerError> {
        self.command(vec!["stop".into()]).await.map(drop)
    }

    async fn media_title(&self) -> Result<String, PlayerError> {
        string_property(self.get_property("media-title").await?, "media-title")
    }

    async fn set_title(&self, title: &str) -> Result<(), PlayerError> {
        self.set_property("force-media-title", Value::from(title))
            .await
    }

    async fn path(&self) -> Result<String, PlayerError> {
        string_property(self.get_property("path").await?, "path")
    }
}

fn string_property(value: Value, name: &str) -> Result<String, PlayerError> {
    match value {
        Value::String(s) => Ok(s),
        _ => Err(PlayerError::PropertyType {
            name: name.into(),
            expected: "string",
        }),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error(transparent)]
    Player(#[from] PlayerError),
    #[error(transparent)]
    Packet(#[from] PacketError),
}

/// Applies a remote `Pause`, `Resume` or `Seek` to the local player, marking
/// the kind as debounced before the player reports the change back. Other
/// kinds are ignored.
pub async fn apply_packet<P, C>(
    packet: &Packet,
    debouncer: &Debouncer<C>,
    player: &P,
) -> Result<(), ApplyError>
where
    P: PlaybackController + ?Sized,
    C: Clock,
{
    match packet.kind() {
        PacketKind::Pause => {
            debouncer.debounce(PacketKind::Pause);
            player.set_paused(true).await?;
        }
        PacketKind::Resume => {
            debouncer.debounce(PacketKind::Resume);
            player.set_paused(false).await?;
        }
        PacketKind::Seek => {
            let position = packet.position()?;
            debouncer.debounce(PacketKind::Seek);
            player.seek_to(position).await?;
        }
        PacketKind::Init | PacketKind::Ready | PacketKind::Idle => {}
    }
    Ok(())
}

/// Waits for the first event matching `pred`, skipping everything else.
pub async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<PlayerEvent>,
    what: &'static str,
    timeout: Duration,
    mut pred: F,
) -> Result<PlayerEvent, PlayerError>
where
    F: FnMut(&PlayerEvent) -> bool,
{
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return Ok(event),
                Ok(PlayerEvent::Shutdown) => return Err(PlayerError::Closed),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Skipped {} player events while waiting for {}", skipped, what);
                }
                Err(broadcast::error::RecvError::Closed) => return Err(PlayerError::Closed),
            }
        }
    };

    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| PlayerError::Timeout(what))?
}
