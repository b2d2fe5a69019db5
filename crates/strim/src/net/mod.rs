mod cmux;
mod connection;
mod protocol;

pub use cmux::{CONTROL_BYTE, Cmux, ListenerClosed, MuxStream, VirtualListener, dial_control};
pub use connection::{ConnectionError, PacketConn, PacketReader, PacketWriter};
pub use protocol::{
    DEFAULT_PORT, InitPayload, MAX_PACKET_SIZE, Packet, PacketError, PacketKind,
};
