use std::net::SocketAddr;

use super::registry::ViewerId;

#[derive(Debug, Clone)]
pub enum ServerEvent {
    Listening {
        addr: SocketAddr,
        title: String,
    },
    ViewerConnected {
        viewer_id: ViewerId,
        addr: SocketAddr,
    },
    ViewerReady {
        viewer_id: ViewerId,
    },
    ViewerDisconnected {
        viewer_id: ViewerId,
        reason: DisconnectReason,
    },
    AllReady,
    MediaChanged {
        title: String,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Graceful,
    ReadFailed,
    SendFailed,
    JoinFailed,
    Protocol,
    Shutdown,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Graceful => "disconnected",
            DisconnectReason::ReadFailed => "lost connection",
            DisconnectReason::SendFailed => "stopped receiving",
            DisconnectReason::JoinFailed => "failed to join",
            DisconnectReason::Protocol => "sent a malformed packet",
            DisconnectReason::Shutdown => "disconnected by shutdown",
        }
    }
}
