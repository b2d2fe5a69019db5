#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use strim::{
    ObserverId, Packet, PacketConn, PacketReader, PacketWriter, PlaybackController, PlayerError,
    PlayerEvent, Server, ServerConfig, ServerError, ServerEvent, dial_control,
};

pub const TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    SetPaused(bool),
    Seek(f64),
    Load(String),
    Stop,
    SetTitle(String),
}

#[derive(Debug)]
struct FakeState {
    paused: bool,
    position: f64,
    path: Option<String>,
    title: Option<String>,
    calls: Vec<Call>,
    next_observer: ObserverId,
    position_unavailable: bool,
}

/// In-memory player that behaves like mpv as far as the hub and the client
/// can tell: property writes produce the matching events.
pub struct FakePlayer {
    state: Mutex<FakeState>,
    events: broadcast::Sender<PlayerEvent>,
}

impl FakePlayer {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            state: Mutex::new(FakeState {
                paused: false,
                position: 0.0,
                path: None,
                title: None,
                calls: Vec::new(),
                next_observer: 1,
                position_unavailable: false,
            }),
            events,
        })
    }

    pub fn with_media(path: &str, title: &str, position: f64) -> Arc<Self> {
        let player = Self::new();
        {
            let mut state = player.state.lock();
            state.path = Some(path.to_string());
            state.title = Some(title.to_string());
            state.position = position;
        }
        player
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn paused(&self) -> bool {
        self.state.lock().paused
    }

    pub fn set_position(&self, position: f64) {
        self.state.lock().position = position;
    }

    /// Makes `playback-time` reads fail, as mpv does before a file is loaded.
    pub fn set_position_unavailable(&self, unavailable: bool) {
        self.state.lock().position_unavailable = unavailable;
    }

    /// Pause toggled by the person in front of the player.
    pub fn user_pause(&self, paused: bool) {
        self.state.lock().paused = paused;
        self.emit_property("pause", Value::Bool(paused));
    }

    pub fn user_seek(&self, position: f64) {
        self.state.lock().position = position;
        self.emit(PlayerEvent::Seek);
        self.emit(PlayerEvent::PlaybackRestart);
    }

    pub fn open(&self, path: &str, title: &str) {
        {
            let mut state = self.state.lock();
            state.path = Some(path.to_string());
            state.title = Some(title.to_string());
            state.position = 0.0;
        }
        self.emit_property("path", Value::from(path));
        self.emit(PlayerEvent::FileLoaded);
    }

    pub fn quit(&self) {
        self.emit(PlayerEvent::Shutdown);
    }

    pub async fn wait_for_call<F>(&self, mut pred: F) -> Call
    where
        F: FnMut(&Call) -> bool,
    {
        let wait = async {
            loop {
                let found = self.state.lock().calls.iter().find(|c| pred(c)).cloned();
                if let Some(call) = found {
                    return call;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(TIMEOUT, wait)
            .await
            .expect("expected player call never happened")
    }

    fn emit(&self, event: PlayerEvent) {
        let _ = self.events.send(event);
    }

    fn emit_property(&self, name: &str, data: Value) {
        self.emit(PlayerEvent::PropertyChange {
            id: 0,
            name: name.to_string(),
            data,
        });
    }

    fn rejected(command: &str) -> PlayerError {
        PlayerError::Rejected {
            command: command.to_string(),
            reason: "property unavailable".to_string(),
        }
    }
}

#[async_trait]
impl PlaybackController for FakePlayer {
    async fn get_property(&self, name: &str) -> Result<Value, PlayerError> {
        let state = self.state.lock();
        match name {
            "pause" => Ok(Value::Bool(state.paused)),
            "playback-time" if state.position_unavailable => Err(Self::rejected(name)),
            "playback-time" => Ok(Value::from(state.position)),
            "path" => state
                .path
                .clone()
                .map(Value::from)
                .ok_or_else(|| Self::rejected(name)),
            "media-title" => state
                .title
                .clone()
                .map(Value::from)
                .ok_or_else(|| Self::rejected(name)),
            _ => Err(Self::rejected(name)),
        }
    }

    async fn set_property(&self, name: &str, value: Value) -> Result<(), PlayerError> {
        match name {
            "pause" => {
                let paused = value.as_bool().unwrap_or_default();
                let changed = {
                    let mut state = self.state.lock();
                    state.calls.push(Call::SetPaused(paused));
                    let changed = state.paused != paused;
                    state.paused = paused;
                    changed
                };
                if changed {
                    self.emit_property("pause", Value::Bool(paused));
                }
            }
            "playback-time" => {
                let position = value.as_f64().unwrap_or_default();
                {
                    let mut state = self.state.lock();
                    state.calls.push(Call::Seek(position));
                    state.position = position;
                }
                self.emit(PlayerEvent::Seek);
                self.emit(PlayerEvent::PlaybackRestart);
            }
            "force-media-title" => {
                let title = value.as_str().unwrap_or_default().to_string();
                self.state.lock().calls.push(Call::SetTitle(title));
            }
            _ => return Err(Self::rejected(name)),
        }
        Ok(())
    }

    async fn command(&self, args: Vec<Value>) -> Result<Value, PlayerError> {
        match args.first().and_then(Value::as_str) {
            Some("loadfile") => {
                let url = args.get(1).and_then(Value::as_str).unwrap_or_default();
                self.state.lock().calls.push(Call::Load(url.to_string()));
                self.emit(PlayerEvent::FileLoaded);
            }
            Some("stop") => {
                self.state.lock().calls.push(Call::Stop);
                self.emit(PlayerEvent::EndFile);
            }
            _ => return Err(Self::rejected("command")),
        }
        Ok(Value::Null)
    }

    async fn observe_property(&self, name: &str) -> Result<ObserverId, PlayerError> {
        let (id, current) = {
            let mut state = self.state.lock();
            let id = state.next_observer;
            state.next_observer += 1;
            let current = match name {
                "pause" => Some(Value::Bool(state.paused)),
                "path" => state.path.clone().map(Value::from),
                _ => None,
            };
            (id, current)
        };
        if let Some(data) = current {
            self.emit(PlayerEvent::PropertyChange {
                id,
                name: name.to_string(),
                data,
            });
        }
        Ok(id)
    }

    async fn unobserve_property(&self, _id: ObserverId) -> Result<(), PlayerError> {
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.events.subscribe()
    }
}

pub struct RunningServer {
    pub server: Server,
    pub addr: SocketAddr,
    pub events: broadcast::Receiver<ServerEvent>,
    pub task: JoinHandle<Result<(), ServerError>>,
}

pub async fn start_server(player: Arc<FakePlayer>) -> RunningServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server = Server::new(player, listener, ServerConfig::default()).unwrap();
    let addr = server.local_addr();
    let mut events = server.subscribe_events();

    let task = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    wait_event(&mut events, |e| matches!(e, ServerEvent::Listening { .. })).await;

    RunningServer {
        server,
        addr,
        events,
        task,
    }
}

pub async fn wait_event<F>(events: &mut broadcast::Receiver<ServerEvent>, mut pred: F) -> ServerEvent
where
    F: FnMut(&ServerEvent) -> bool,
{
    let wait = async {
        loop {
            let event = events.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    };
    tokio::time::timeout(TIMEOUT, wait)
        .await
        .expect("expected server event never arrived")
}

/// A bare control connection speaking the wire protocol directly.
pub struct TestViewer {
    reader: PacketReader<tokio::io::ReadHalf<TcpStream>>,
    writer: PacketWriter<tokio::io::WriteHalf<TcpStream>>,
}

impl TestViewer {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = dial_control(addr).await.unwrap();
        let (reader, writer) = PacketConn::new(stream).split();
        Self { reader, writer }
    }

    /// Connects and consumes the `Init` the hub sends on join.
    pub async fn join(addr: SocketAddr) -> (Self, Packet) {
        let mut viewer = Self::connect(addr).await;
        let init = viewer.recv().await;
        assert_eq!(init.kind(), strim::PacketKind::Init);
        (viewer, init)
    }

    pub async fn recv(&mut self) -> Packet {
        tokio::time::timeout(TIMEOUT, self.reader.read_packet())
            .await
            .expect("timed out waiting for a packet")
            .unwrap()
            .expect("connection closed")
    }

    pub async fn expect_silence(&mut self, window: Duration) {
        if let Ok(packet) = tokio::time::timeout(window, self.reader.read_packet()).await {
            panic!("unexpected packet: {:?}", packet);
        }
    }

    pub async fn expect_closed(&mut self) {
        let read = tokio::time::timeout(TIMEOUT, self.reader.read_packet())
            .await
            .expect("connection stayed open");
        assert!(matches!(read, Ok(None) | Err(_)), "got {:?}", read);
    }

    pub async fn send(&mut self, packet: &Packet) {
        self.writer.write_packet(packet).await.unwrap();
    }

    pub async fn send_raw(&mut self, raw: &[u8]) {
        self.writer.write_raw(raw).await.unwrap();
    }
}
