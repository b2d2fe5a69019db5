mod config;
mod events;
mod registry;
pub mod stream;

pub use config::ServerConfig;
pub use events::{DisconnectReason, ServerEvent};
pub use registry::{
    Admission, Origin, ReadyOutcome, Retired, ServerStats, Viewer, ViewerId, ViewerInfo,
    ViewerPhase, ViewerRegistry,
};

use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::debounce::Debouncer;
use crate::net::{
    Cmux, ConnectionError, ListenerClosed, MuxStream, Packet, PacketConn, PacketError, PacketKind,
    PacketReader, PacketWriter,
};
use crate::player::{PlaybackController, PlayerError, PlayerEvent, apply_packet, wait_for_event};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("media path unavailable: {0}")]
    MediaPath(#[source] PlayerError),
    #[error(transparent)]
    Player(#[from] PlayerError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
enum JoinError {
    #[error("viewer left before initialization")]
    Retired,
    #[error("could not read host position: {0}")]
    Player(#[from] PlayerError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

struct Inner {
    player: Arc<dyn PlaybackController>,
    cmux: Arc<Cmux>,
    config: ServerConfig,
    registry: Mutex<ViewerRegistry>,
    stream_server: Mutex<Option<JoinHandle<()>>>,
    debouncer: Debouncer,
    events: broadcast::Sender<ServerEvent>,
    shutdown: CancellationToken,
    started_at: Instant,
}

/// The host side hub: relays playback changes between the host player and
/// every connected viewer and gates playback on viewers being ready.
///
/// Cloning is cheap and every clone drives the same hub.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

impl Server {
    pub fn new(
        player: Arc<dyn PlaybackController>,
        listener: TcpListener,
        config: ServerConfig,
    ) -> io::Result<Self> {
        let cmux = Arc::new(Cmux::new(listener)?);
        let (events, _) = broadcast::channel(config.event_capacity);

        Ok(Self {
            inner: Arc::new(Inner {
                player,
                cmux,
                registry: Mutex::new(ViewerRegistry::new(String::new())),
                stream_server: Mutex::new(None),
                debouncer: Debouncer::new(),
                events,
                shutdown: CancellationToken::new(),
                started_at: Instant::now(),
                config,
            }),
        })
    }

    pub async fn bind(player: Arc<dyn PlaybackController>, config: ServerConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind).await?;
        Self::new(player, listener, config)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.cmux.local_addr()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.events.subscribe()
    }

    pub fn stats(&self) -> ServerStats {
        self.lock().stats()
    }

    pub fn uptime(&self) -> Duration {
        self.inner.started_at.elapsed()
    }

    pub fn is_running(&self) -> bool {
        !self.inner.shutdown.is_cancelled()
    }

    /// Bootstraps the hub and runs it until the player shuts down or
    /// [`Server::shutdown`] is called.
    pub async fn run(&self) -> Result<(), ServerError> {
        let mut player_events = self.inner.player.subscribe();
        let path = match self.bootstrap(&mut player_events).await {
            Ok(path) => path,
            Err(e) => {
                log::error!("Could not start hosting: {}", e);
                self.emit(ServerEvent::Error {
                    message: e.to_string(),
                });
                self.shutdown();
                return Err(e);
            }
        };
        let player = &self.inner.player;
        let title = self.read_title(&path).await;
        let paused = match player.is_paused().await {
            Ok(paused) => paused,
            Err(e) => {
                log::warn!("Could not read host pause state: {}", e);
                false
            }
        };
        {
            let mut registry = self.lock();
            registry.set_title(title.clone());
            registry.set_paused(paused);
        }
        // Drop what the player reported during bootstrap, including the
        // initial value of the pause observer.
        let player_events = player_events.resubscribe();

        self.replace_stream_server(stream::spawn(self.inner.cmux.stream(), &path));
        let mux = tokio::spawn(Arc::clone(&self.inner.cmux).serve());
        let accept = tokio::spawn(self.clone().accept_loop());

        log::info!("Hosting {:?} on {}", title, self.local_addr());
        self.emit(ServerEvent::Listening {
            addr: self.local_addr(),
            title,
        });

        let result = self.event_loop(player_events).await;
        if let Err(e) = &result {
            log::error!("Server stopped: {}", e);
            self.emit(ServerEvent::Error {
                message: e.to_string(),
            });
        }

        self.shutdown();
        let _ = accept.await;
        let _ = mux.await;
        result
    }

    async fn bootstrap(
        &self,
        events: &mut broadcast::Receiver<PlayerEvent>,
    ) -> Result<String, ServerError> {
        self.inner.player.observe_property("pause").await?;
        self.wait_path(events).await.map_err(ServerError::MediaPath)
    }

    /// Closes the listeners and every viewer connection. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();
        self.inner.cmux.close();
        // Graceful shutdown would wait on viewers still streaming.
        if let Some(stream_server) = self.inner.stream_server.lock().take() {
            stream_server.abort();
        }

        let retired = self.lock().retire_all();
        for viewer_id in retired {
            self.emit(ServerEvent::ViewerDisconnected {
                viewer_id,
                reason: DisconnectReason::Shutdown,
            });
        }
    }

    /// Applies `packet` to the host player when `origin` calls for it and
    /// sends it to every viewer except the one it came from.
    pub async fn dispatch(&self, origin: Origin, packet: &Packet) {
        match packet.encode() {
            Ok(raw) => self.dispatch_raw(origin, packet.clone(), raw).await,
            Err(e) => log::warn!("Dropping {:?} packet: {}", packet.kind(), e),
        }
    }

    async fn dispatch_raw(&self, origin: Origin, packet: Packet, raw: Bytes) {
        let mut next = Some((origin, packet, raw));

        // A failed send can retire the last pending viewer, which opens the
        // gate and queues a resume for everyone.
        while let Some((origin, packet, raw)) = next.take() {
            if origin.applies_locally() {
                if let Err(e) = apply_packet(&packet, &self.inner.debouncer, &*self.inner.player).await
                {
                    log::warn!("Failed to apply {:?} on the host: {}", packet.kind(), e);
                }
            }

            let failed = {
                let mut registry = self.lock();
                match packet.kind() {
                    PacketKind::Pause => registry.set_paused(true),
                    PacketKind::Resume => registry.set_paused(false),
                    _ => {}
                }
                registry.broadcast(origin.excluded(), &raw)
            };

            let mut gate_opened = false;
            for viewer_id in failed {
                log::warn!("Viewer {} is not keeping up, disconnecting", viewer_id);
                gate_opened |= self.retire(viewer_id, DisconnectReason::SendFailed);
            }

            if gate_opened {
                self.emit(ServerEvent::AllReady);
                let resume = Packet::resume();
                next = resume.encode().ok().map(|raw| (Origin::Hub, resume, raw));
            }
        }
    }

    async fn open_gate(&self) {
        log::info!("All viewers ready, resuming");
        self.emit(ServerEvent::AllReady);
        self.dispatch(Origin::Hub, &Packet::resume()).await;
    }

    /// Retires a viewer once, reporting whether that opened the gate.
    fn retire(&self, viewer_id: ViewerId, reason: DisconnectReason) -> bool {
        let retired = self.lock().retire(viewer_id);
        match retired {
            Some(retired) => {
                log::info!("Viewer {} {}", viewer_id, reason.as_str());
                self.emit(ServerEvent::ViewerDisconnected { viewer_id, reason });
                retired.gate_opened
            }
            None => false,
        }
    }

    async fn accept_loop(self) {
        let control = self.inner.cmux.control();
        loop {
            let conn = match control.accept().await {
                Ok(conn) => conn,
                Err(ListenerClosed) => break,
            };
            let server = self.clone();
            tokio::spawn(async move { server.handle_viewer(conn).await });
        }
        log::debug!("Control accept loop stopped");
    }

    async fn handle_viewer(self, conn: MuxStream) {
        let addr = conn.peer_addr();
        let (reader, mut writer) = PacketConn::new(conn).split();
        let (outbox, rx) = mpsc::channel(self.inner.config.viewer_queue_capacity);
        let cancel = self.inner.shutdown.child_token();

        let admission = self.lock().admit(addr, outbox, cancel.clone());
        let viewer_id = admission.viewer_id;
        log::info!("Viewer {} connected from {}", viewer_id, addr);
        self.emit(ServerEvent::ViewerConnected { viewer_id, addr });

        if admission.pause_host {
            self.dispatch(Origin::Hub, &Packet::pause()).await;
        }

        if let Err(e) = self.send_init(viewer_id, &mut writer).await {
            log::warn!("Failed to initialize viewer {}: {}", viewer_id, e);
            if self.retire(viewer_id, DisconnectReason::JoinFailed) {
                self.open_gate().await;
            }
            return;
        }

        let writer_task = {
            let server = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { server.write_loop(viewer_id, writer, rx, cancel).await })
        };

        let reason = self.receive_loop(viewer_id, reader, &cancel).await;
        if self.retire(viewer_id, reason) {
            self.open_gate().await;
        }
        let _ = writer_task.await;
    }

    async fn send_init<W>(&self, viewer_id: ViewerId, writer: &mut PacketWriter<W>) -> Result<(), JoinError>
    where
        W: AsyncWrite + Unpin,
    {
        // Broadcasts queue up behind the Init from here on.
        let initialized = self.lock().mark_initialized(viewer_id);
        if !initialized {
            return Err(JoinError::Retired);
        }

        let position = self.inner.player.playback_time().await?;
        let title = self.lock().title().to_owned();
        writer.write_packet(&Packet::init(&title, position)).await?;
        log::debug!("Sent Init at {:.3}s to viewer {}", position, viewer_id);
        Ok(())
    }

    async fn write_loop<W>(
        self,
        viewer_id: ViewerId,
        mut writer: PacketWriter<W>,
        mut rx: mpsc::Receiver<Bytes>,
        cancel: CancellationToken,
    ) where
        W: AsyncWrite + Unpin,
    {
        loop {
            let raw = tokio::select! {
                _ = cancel.cancelled() => break,
                raw = rx.recv() => match raw {
                    Some(raw) => raw,
                    None => break,
                },
            };

            let written = tokio::select! {
                _ = cancel.cancelled() => break,
                written = writer.write_raw(&raw) => written,
            };
            if let Err(e) = written {
                log::warn!("Write to viewer {} failed: {}", viewer_id, e);
                if self.retire(viewer_id, DisconnectReason::SendFailed) {
                    self.open_gate().await;
                }
                break;
            }
        }
        let _ = writer.shutdown().await;
    }

    async fn receive_loop<R>(
        &self,
        viewer_id: ViewerId,
        mut reader: PacketReader<R>,
        cancel: &CancellationToken,
    ) -> DisconnectReason
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => return DisconnectReason::Shutdown,
                frame = reader.read_frame() => frame,
            };

            let raw = match frame {
                Ok(Some(raw)) => raw,
                Ok(None) => return DisconnectReason::Graceful,
                Err(e) => {
                    log::warn!("Read from viewer {} failed: {}", viewer_id, e);
                    return DisconnectReason::ReadFailed;
                }
            };

            if let Err(e) = self.handle_frame(viewer_id, raw).await {
                log::warn!("Viewer {} sent a malformed packet: {}", viewer_id, e);
                return DisconnectReason::Protocol;
            }
        }
    }

    async fn handle_frame(&self, viewer_id: ViewerId, raw: Bytes) -> Result<(), PacketError> {
        let packet = Packet::decode_bytes(&raw)?;
        match packet.kind() {
            PacketKind::Ready => self.handle_ready(viewer_id).await,
            PacketKind::Pause | PacketKind::Resume => {
                self.dispatch_raw(Origin::Viewer(viewer_id), packet, raw).await;
            }
            PacketKind::Seek => {
                packet.position()?;
                self.dispatch_raw(Origin::Viewer(viewer_id), packet, raw).await;
            }
            PacketKind::Init | PacketKind::Idle => {
                log::debug!("Ignoring {:?} from viewer {}", packet.kind(), viewer_id);
            }
        }
        Ok(())
    }

    async fn handle_ready(&self, viewer_id: ViewerId) {
        let outcome = self.lock().mark_ready(viewer_id);
        match outcome {
            ReadyOutcome::Accepted { gate_opened } => {
                log::info!("Viewer {} is ready", viewer_id);
                self.emit(ServerEvent::ViewerReady { viewer_id });
                if gate_opened {
                    self.open_gate().await;
                }
            }
            ReadyOutcome::Stale => {
                log::debug!("Viewer {} answered the previous Init", viewer_id);
            }
            ReadyOutcome::Ignored => {
                log::debug!("Ignoring duplicate Ready from viewer {}", viewer_id);
            }
        }
    }

    async fn event_loop(
        &self,
        mut events: broadcast::Receiver<PlayerEvent>,
    ) -> Result<(), ServerError> {
        loop {
            let event = tokio::select! {
                _ = self.inner.shutdown.cancelled() => return Ok(()),
                event = events.recv() => event,
            };

            match event {
                Ok(PlayerEvent::Shutdown) => {
                    log::info!("Host player shut down");
                    return Ok(());
                }
                Ok(event) => self.handle_player_event(event).await?,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Skipped {} host player events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }

    async fn handle_player_event(&self, event: PlayerEvent) -> Result<(), ServerError> {
        match event {
            PlayerEvent::PropertyChange { name, data, .. } if name == "pause" => {
                let Some(paused) = data.as_bool() else {
                    return Ok(());
                };
                let changed = {
                    let mut registry = self.lock();
                    let changed = registry.paused() != paused;
                    registry.set_paused(paused);
                    changed
                };

                let kind = PacketKind::for_pause_state(paused);
                if !changed {
                    return Ok(());
                }
                if self.inner.debouncer.is_debounced(kind) {
                    log::debug!("Host {:?} debounced", kind);
                    return Ok(());
                }
                self.dispatch(Origin::Host, &Packet::empty(kind)).await;
            }
            PlayerEvent::Seek => {
                if self.inner.debouncer.is_debounced(PacketKind::Seek) {
                    log::debug!("Host seek debounced");
                    return Ok(());
                }
                match self.inner.player.playback_time().await {
                    Ok(position) => self.dispatch(Origin::Host, &Packet::seek(position)).await,
                    Err(e) => log::warn!("Could not read host position after seek: {}", e),
                }
            }
            PlayerEvent::FileLoaded => self.reinitialize().await?,
            _ => {}
        }
        Ok(())
    }

    /// Moves every viewer over to the media the host just loaded.
    async fn reinitialize(&self) -> Result<(), ServerError> {
        let (alive, was_paused) = {
            let registry = self.lock();
            (registry.alive_count(), registry.paused())
        };

        if alive > 0 {
            self.inner.debouncer.debounce(PacketKind::Pause);
            if let Err(e) = self.inner.player.set_paused(true).await {
                log::warn!("Could not pause the host for reload: {}", e);
            }
            self.lock().set_paused(true);
        }
        self.dispatch(Origin::Host, &Packet::idle()).await;

        let path = self
            .inner
            .player
            .path()
            .await
            .map_err(ServerError::MediaPath)?;
        let title = self.read_title(&path).await;

        let listener = self.inner.cmux.rearm_stream();
        self.replace_stream_server(stream::spawn(listener, &path));

        self.lock().restart_join(title.clone(), !was_paused);
        log::info!("Media changed to {:?}", title);
        self.emit(ServerEvent::MediaChanged {
            title: title.clone(),
        });

        let position = match self.inner.player.playback_time().await {
            Ok(position) => position,
            Err(e) => {
                log::warn!("Could not read host position after reload: {}", e);
                0.0
            }
        };
        self.dispatch(Origin::Host, &Packet::init(&title, position)).await;
        Ok(())
    }

    async fn wait_path(
        &self,
        events: &mut broadcast::Receiver<PlayerEvent>,
    ) -> Result<String, PlayerError> {
        let player = &self.inner.player;
        match player.path().await {
            Ok(path) => return Ok(path),
            Err(e) => log::debug!("Media path not available yet: {}", e),
        }

        log::info!("Waiting for the host player to open a file");
        let observer = player.observe_property("path").await?;
        let event = wait_for_event(events, "media path", self.inner.config.path_timeout, |event| {
            matches!(event.property("path"), Some(Value::String(_)))
        })
        .await;
        if let Err(e) = player.unobserve_property(observer).await {
            log::debug!("Failed to drop path observer: {}", e);
        }

        match event?.property("path") {
            Some(Value::String(path)) => Ok(path.clone()),
            _ => Err(PlayerError::PropertyType {
                name: "path".into(),
                expected: "string",
            }),
        }
    }

    async fn read_title(&self, path: &str) -> String {
        match self.inner.player.media_title().await {
            Ok(title) if !title.is_empty() => title,
            Ok(_) => file_name(path),
            Err(e) => {
                log::debug!("No media title, using the file name: {}", e);
                file_name(path)
            }
        }
    }

    /// Installs the server for the current media. The previous one only
    /// serves the old file, which viewers have stopped playing.
    fn replace_stream_server(&self, stream_server: JoinHandle<()>) {
        let mut current = self.inner.stream_server.lock();
        // `shutdown` cancels before taking the handle.
        if self.inner.shutdown.is_cancelled() {
            stream_server.abort();
        } else if let Some(previous) = current.replace(stream_server) {
            previous.abort();
        }
    }

    fn emit(&self, event: ServerEvent) {
        let _ = self.inner.events.send(event);
    }

    fn lock(&self) -> MutexGuard<'_, ViewerRegistry> {
        self.inner.registry.lock()
    }
}

fn file_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}
