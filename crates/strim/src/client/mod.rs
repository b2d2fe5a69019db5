mod config;

pub use config::ClientConfig;

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::ToSocketAddrs;
use tokio::sync::broadcast;

use crate::debounce::Debouncer;
use crate::net::{
    ConnectionError, InitPayload, Packet, PacketConn, PacketError, PacketKind, PacketWriter,
    dial_control,
};
use crate::player::{
    ApplyError, PlaybackController, PlayerError, PlayerEvent, apply_packet, wait_for_event,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPhase {
    Connecting,
    AwaitingInit,
    Loading,
    Ready,
    Active,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("malformed packet from server: {0}")]
    Packet(#[from] PacketError),
    #[error("player error: {0}")]
    Player(#[from] PlayerError),
}

enum Step {
    Remote(Result<Option<Packet>, ConnectionError>),
    Local(Result<PlayerEvent, broadcast::error::RecvError>),
}

/// The viewer side: mirrors the host's playback on a local player and
/// reports local pause and seek changes back to the host.
pub struct Client {
    player: Arc<dyn PlaybackController>,
    config: ClientConfig,
    debouncer: Debouncer,
    phase: ClientPhase,
}

impl Client {
    pub fn new(player: Arc<dyn PlaybackController>, config: ClientConfig) -> Self {
        Self {
            player,
            config,
            debouncer: Debouncer::new(),
            phase: ClientPhase::Connecting,
        }
    }

    pub fn phase(&self) -> ClientPhase {
        self.phase
    }

    /// Connects to a host and runs the session until either side closes it.
    pub async fn connect<A: ToSocketAddrs>(&mut self, addr: A) -> Result<(), ClientError> {
        self.phase = ClientPhase::Connecting;
        let stream = dial_control(addr).await?;
        let peer = stream.peer_addr()?;
        log::info!("Connected to {}", peer);

        self.run(stream, format!("http://{}/", peer)).await
    }

    /// Runs a session over an established control connection. `stream_url`
    /// is where the local player fetches the host's media from.
    pub async fn run<S>(&mut self, stream: S, stream_url: String) -> Result<(), ClientError>
    where
        S: AsyncRead + AsyncWrite + Send,
    {
        let mut events = self.player.subscribe();
        self.player.observe_property("pause").await?;

        let (mut reader, mut writer) = PacketConn::new(stream).split();
        self.phase = ClientPhase::AwaitingInit;

        loop {
            let step = tokio::select! {
                packet = reader.read_packet() => Step::Remote(packet),
                event = events.recv() => Step::Local(event),
            };

            match step {
                Step::Remote(Ok(Some(packet))) => {
                    self.handle_packet(packet, &stream_url, &mut events, &mut writer)
                        .await?;
                }
                Step::Remote(Ok(None)) => {
                    log::info!("Host closed the connection");
                    return Ok(());
                }
                Step::Remote(Err(e)) => return Err(e.into()),
                Step::Local(Ok(PlayerEvent::Shutdown)) => {
                    log::info!("Local player shut down");
                    return Ok(());
                }
                Step::Local(Ok(event)) => self.handle_local(event, &mut writer).await?,
                Step::Local(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    log::warn!("Skipped {} local player events", skipped);
                }
                Step::Local(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(PlayerError::Closed.into());
                }
            }
        }
    }

    async fn handle_packet<W>(
        &mut self,
        packet: Packet,
        stream_url: &str,
        events: &mut broadcast::Receiver<PlayerEvent>,
        writer: &mut PacketWriter<W>,
    ) -> Result<(), ClientError>
    where
        W: AsyncWrite + Unpin,
    {
        match packet.kind() {
            PacketKind::Init => {
                let init = packet.init_payload()?;
                self.initialize(init, stream_url, events, writer).await?;
            }
            PacketKind::Pause | PacketKind::Resume | PacketKind::Seek => {
                if self.phase != ClientPhase::Active {
                    log::debug!("Ignoring {:?} before initialization", packet.kind());
                    return Ok(());
                }
                match apply_packet(&packet, &self.debouncer, &*self.player).await {
                    Ok(()) => {}
                    Err(ApplyError::Packet(e)) => return Err(e.into()),
                    Err(ApplyError::Player(e)) => {
                        log::warn!("Failed to apply {:?}: {}", packet.kind(), e);
                    }
                }
            }
            PacketKind::Idle => {
                log::info!("Host is switching media");
                if let Err(e) = self.player.stop().await {
                    log::warn!("Failed to stop playback: {}", e);
                }
                self.phase = ClientPhase::AwaitingInit;
            }
            PacketKind::Ready => {
                log::debug!("Ignoring Ready from host");
            }
        }
        Ok(())
    }

    async fn initialize<W>(
        &mut self,
        init: InitPayload,
        stream_url: &str,
        events: &mut broadcast::Receiver<PlayerEvent>,
        writer: &mut PacketWriter<W>,
    ) -> Result<(), ClientError>
    where
        W: AsyncWrite + Unpin,
    {
        log::info!("Loading {:?} at {:.3}s", init.title, init.position);
        self.phase = ClientPhase::Loading;

        self.debouncer.debounce(PacketKind::Pause);
        self.player.set_paused(true).await?;
        self.player.load(stream_url).await?;
        wait_for_event(events, "file-loaded", self.config.load_timeout, |event| {
            matches!(event, PlayerEvent::FileLoaded)
        })
        .await?;

        if let Err(e) = self.player.set_title(&init.title).await {
            log::warn!("Failed to set title: {}", e);
        }

        if init.position != 0.0 {
            self.debouncer.debounce(PacketKind::Seek);
            self.player.seek_to(init.position).await?;
            wait_for_event(events, "playback-restart", self.config.seek_timeout, |event| {
                matches!(event, PlayerEvent::PlaybackRestart)
            })
            .await?;
        }

        self.phase = ClientPhase::Ready;
        writer.write_packet(&Packet::ready()).await?;

        // Whatever the player reported while loading is stale now.
        *events = events.resubscribe();
        self.phase = ClientPhase::Active;
        log::info!("Ready, waiting for the host");
        Ok(())
    }

    async fn handle_local<W>(
        &mut self,
        event: PlayerEvent,
        writer: &mut PacketWriter<W>,
    ) -> Result<(), ClientError>
    where
        W: AsyncWrite + Unpin,
    {
        if self.phase != ClientPhase::Active {
            return Ok(());
        }

        let packet = match event {
            PlayerEvent::PropertyChange { name, data, .. } if name == "pause" => {
                let Some(paused) = data.as_bool() else {
                    return Ok(());
                };
                let kind = PacketKind::for_pause_state(paused);
                if self.debouncer.is_debounced(kind) {
                    return Ok(());
                }
                Packet::empty(kind)
            }
            PlayerEvent::Seek => {
                if self.debouncer.is_debounced(PacketKind::Seek) {
                    return Ok(());
                }
                match self.player.playback_time().await {
                    Ok(position) => Packet::seek(position),
                    Err(e) => {
                        log::warn!("Could not read position after seek: {}", e);
                        return Ok(());
                    }
                }
            }
            _ => return Ok(()),
        };

        log::debug!("Sending local {:?}", packet.kind());
        writer.write_packet(&packet).await?;
        Ok(())
    }
}
