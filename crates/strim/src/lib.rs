#[cfg(not(unix))]
compile_error!("strim talks to mpv over a Unix socket and only builds on unix targets");

pub mod client;
pub mod debounce;
pub mod net;
pub mod player;
pub mod server;

pub use client::{Client, ClientConfig, ClientError, ClientPhase};
pub use debounce::{Clock, DEBOUNCE_THRESHOLD, Debouncer, ManualClock, SystemClock};
pub use net::{
    CONTROL_BYTE, Cmux, ConnectionError, DEFAULT_PORT, InitPayload, ListenerClosed,
    MAX_PACKET_SIZE, MuxStream, Packet, PacketConn, PacketError, PacketKind, PacketReader,
    PacketWriter, VirtualListener, dial_control,
};
pub use player::{
    ApplyError, ObserverId, PlaybackController, PlayerError, PlayerEvent, apply_packet,
    wait_for_event,
};
pub use server::{
    DisconnectReason, Origin, Server, ServerConfig, ServerError, ServerEvent, ServerStats,
    ViewerId, ViewerInfo, ViewerPhase,
};
