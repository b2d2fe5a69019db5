use bytes::{BufMut, Bytes, BytesMut};

pub const MAX_PACKET_SIZE: usize = 1024;
pub const DEFAULT_PORT: u16 = 5300;

const POSITION_SIZE: usize = 8;
const MAX_TITLE_SIZE: usize = MAX_PACKET_SIZE - 1 - POSITION_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    Init = 0,
    Ready = 1,
    Pause = 2,
    Resume = 3,
    Seek = 4,
    Idle = 5,
}

impl PacketKind {
    pub const ALL: [PacketKind; 6] = [
        PacketKind::Init,
        PacketKind::Ready,
        PacketKind::Pause,
        PacketKind::Resume,
        PacketKind::Seek,
        PacketKind::Idle,
    ];

    pub fn for_pause_state(paused: bool) -> Self {
        if paused {
            PacketKind::Pause
        } else {
            PacketKind::Resume
        }
    }
}

impl TryFrom<u8> for PacketKind {
    type Error = PacketError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            0 => Ok(PacketKind::Init),
            1 => Ok(PacketKind::Ready),
            2 => Ok(PacketKind::Pause),
            3 => Ok(PacketKind::Resume),
            4 => Ok(PacketKind::Seek),
            5 => Ok(PacketKind::Idle),
            other => Err(PacketError::UnknownKind(other)),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("empty packet")]
    Empty,
    #[error("unknown packet kind {0}")]
    UnknownKind(u8),
    #[error("{kind:?} payload truncated: expected at least {expected} bytes, got {actual}")]
    Truncated {
        kind: PacketKind,
        expected: usize,
        actual: usize,
    },
    #[error("packet of {0} bytes exceeds the {MAX_PACKET_SIZE} byte limit")]
    TooLarge(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct InitPayload {
    pub position: f64,
    pub title: String,
}

/// A single control message. The encoded form is one kind byte followed by
/// the payload, with no length prefix: a packet must arrive in exactly one
/// transport read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    kind: PacketKind,
    payload: Bytes,
}

impl Packet {
    pub fn new(kind: PacketKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    pub fn empty(kind: PacketKind) -> Self {
        Self::new(kind, Bytes::new())
    }

    /// Builds an `Init` packet, truncating the title on a character boundary
    /// so the encoded packet fits in [`MAX_PACKET_SIZE`].
    pub fn init(title: &str, position: f64) -> Self {
        let title = truncate_on_char_boundary(title, MAX_TITLE_SIZE);
        let mut buf = BytesMut::with_capacity(POSITION_SIZE + title.len());
        buf.put_f64(position);
        buf.put_slice(title.as_bytes());
        Self::new(PacketKind::Init, buf.freeze())
    }

    pub fn seek(position: f64) -> Self {
        Self::new(PacketKind::Seek, Bytes::copy_from_slice(&position.to_be_bytes()))
    }

    pub fn ready() -> Self {
        Self::empty(PacketKind::Ready)
    }

    pub fn pause() -> Self {
        Self::empty(PacketKind::Pause)
    }

    pub fn resume() -> Self {
        Self::empty(PacketKind::Resume)
    }

    pub fn idle() -> Self {
        Self::empty(PacketKind::Idle)
    }

    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn encoded_len(&self) -> usize {
        1 + self.payload.len()
    }

    pub fn encode(&self) -> Result<Bytes, PacketError> {
        let len = self.encoded_len();
        if len > MAX_PACKET_SIZE {
            return Err(PacketError::TooLarge(len));
        }

        let mut buf = BytesMut::with_capacity(len);
        buf.put_u8(self.kind as u8);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    pub fn decode(raw: &[u8]) -> Result<Self, PacketError> {
        let (&kind, payload) = raw.split_first().ok_or(PacketError::Empty)?;
        Ok(Self::new(
            PacketKind::try_from(kind)?,
            Bytes::copy_from_slice(payload),
        ))
    }

    /// Zero-copy variant of [`Packet::decode`] for buffers that are kept for
    /// verbatim rebroadcast.
    pub fn decode_bytes(raw: &Bytes) -> Result<Self, PacketError> {
        let kind = *raw.first().ok_or(PacketError::Empty)?;
        Ok(Self::new(PacketKind::try_from(kind)?, raw.slice(1..)))
    }

    pub fn position(&self) -> Result<f64, PacketError> {
        read_position(self.kind, &self.payload)
    }

    pub fn init_payload(&self) -> Result<InitPayload, PacketError> {
        let position = read_position(self.kind, &self.payload)?;
        let title = String::from_utf8_lossy(&self.payload[POSITION_SIZE..]).into_owned();
        Ok(InitPayload { position, title })
    }
}

/// Length of the first packet in `raw`. Every kind except `Init` has a fixed
/// size, so several packets delivered in one read can be told apart as long
/// as an `Init` comes last. Unknown kinds claim the whole buffer.
pub(crate) fn frame_len(raw: &[u8]) -> usize {
    let kind = raw.first().and_then(|&byte| PacketKind::try_from(byte).ok());
    match kind {
        Some(PacketKind::Seek) => raw.len().min(1 + POSITION_SIZE),
        Some(PacketKind::Ready | PacketKind::Pause | PacketKind::Resume | PacketKind::Idle) => 1,
        Some(PacketKind::Init) | None => raw.len(),
    }
}

fn read_position(kind: PacketKind, payload: &[u8]) -> Result<f64, PacketError> {
    let bytes: [u8; POSITION_SIZE] = payload
        .get(..POSITION_SIZE)
        .and_then(|slice| slice.try_into().ok())
        .ok_or(PacketError::Truncated {
            kind,
            expected: POSITION_SIZE,
            actual: payload.len(),
        })?;
    Ok(f64::from_be_bytes(bytes))
}

fn truncate_on_char_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
