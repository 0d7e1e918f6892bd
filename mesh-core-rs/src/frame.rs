//! Frame codec for the station wire protocol
//!
//! Every exchange is an ordered list of frames:
//!
//! ```text
//! [routing address][description][payload ...][service key]
//! ```
//!
//! The service key trailer is only present on traffic from external callers.
//! Loopback traffic carries an empty delimiter frame right after the routing
//! address, which the codec strips on decode and restores on encode.
//!
//! ## Description layout
//!
//! | byte | meaning |
//! |------|---------|
//! | 0 | declared frame size (frames after the description) |
//! | 1 | command |
//! | 2 .. 2+size | one frame type per frame, starting at frame index 2 |
//! | 2+size | tag |

use bytes::Bytes;

use crate::error::FrameError;

/// Literal payload of a ping request in frame 1
pub const PING_MARKER: &[u8] = b"\x04PING";

/// Largest frame size accepted from requesters and workers
///
/// The size is one byte on the wire; the remaining range is headroom for the
/// global id, requester, station and trace frames appended on the way.
pub const MAX_FRAME_SIZE: usize = 240;

/// First command byte of the extension range handled by station types
pub const EXTENSION_BASE: u8 = 0x20;

/// Command carried in byte 1 of the description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    None,
    Ping,
    Plan,
    GlobalId,
    HeartJoin,
    HeartReady,
    HeartPitpat,
    HeartLeft,
    /// Station-type specific command
    Extension(u8),
    /// Anything outside the defined ranges
    Unknown(u8),
}

impl Command {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x01 => Command::None,
            0x02 => Command::Ping,
            0x03 => Command::Plan,
            0x04 => Command::GlobalId,
            0x10 => Command::HeartJoin,
            0x11 => Command::HeartReady,
            0x12 => Command::HeartPitpat,
            0x13 => Command::HeartLeft,
            b if b >= EXTENSION_BASE => Command::Extension(b),
            b => Command::Unknown(b),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            Command::None => 0x01,
            Command::Ping => 0x02,
            Command::Plan => 0x03,
            Command::GlobalId => 0x04,
            Command::HeartJoin => 0x10,
            Command::HeartReady => 0x11,
            Command::HeartPitpat => 0x12,
            Command::HeartLeft => 0x13,
            Command::Extension(b) | Command::Unknown(b) => b,
        }
    }

    pub fn is_heartbeat(self) -> bool {
        matches!(
            self,
            Command::HeartJoin | Command::HeartReady | Command::HeartPitpat | Command::HeartLeft
        )
    }
}

/// Marker describing what a frame carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Requester,
    RequestId,
    StationId,
    StationType,
    Status,
    GlobalId,
    ServiceKey,
    Command,
    Argument,
    Content,
    Plan,
    Other(u8),
}

impl FrameType {
    pub fn from_byte(b: u8) -> Self {
        match b {
            b'>' => FrameType::Requester,
            b'+' => FrameType::RequestId,
            b'S' => FrameType::StationId,
            b's' => FrameType::StationType,
            b'=' => FrameType::Status,
            b'G' => FrameType::GlobalId,
            b'&' => FrameType::ServiceKey,
            b'$' => FrameType::Command,
            b'%' => FrameType::Argument,
            b'T' => FrameType::Content,
            b'P' => FrameType::Plan,
            other => FrameType::Other(other),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            FrameType::Requester => b'>',
            FrameType::RequestId => b'+',
            FrameType::StationId => b'S',
            FrameType::StationType => b's',
            FrameType::Status => b'=',
            FrameType::GlobalId => b'G',
            FrameType::ServiceKey => b'&',
            FrameType::Command => b'$',
            FrameType::Argument => b'%',
            FrameType::Content => b'T',
            FrameType::Plan => b'P',
            FrameType::Other(b) => b,
        }
    }
}

/// Where a trace record was taken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracePoint {
    /// Request accepted by the station
    In,
    /// Job handed to a worker or dispatcher
    Forward,
    /// Job completed or abandoned
    End,
}

/// Role marker in the last description byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Normal,
    /// Heartbeat traffic on a worker socket
    ExtendEnd,
    /// Final result frame list
    ResultEnd,
    Trace(TracePoint),
}

impl Tag {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x01 => Tag::Trace(TracePoint::In),
            0x02 => Tag::Trace(TracePoint::Forward),
            0x03 => Tag::Trace(TracePoint::End),
            0xFE => Tag::ResultEnd,
            0xFF => Tag::ExtendEnd,
            _ => Tag::Normal,
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            Tag::Normal => 0x00,
            Tag::Trace(TracePoint::In) => 0x01,
            Tag::Trace(TracePoint::Forward) => 0x02,
            Tag::Trace(TracePoint::End) => 0x03,
            Tag::ResultEnd => 0xFE,
            Tag::ExtendEnd => 0xFF,
        }
    }
}

/// Typed header frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Description {
    frame_size: usize,
    command: Command,
    frames: Vec<FrameType>,
    tag: Tag,
    size: usize,
}

impl Description {
    pub fn new(command: Command) -> Self {
        Self {
            frame_size: 0,
            command,
            frames: Vec::new(),
            tag: Tag::Normal,
            size: 3,
        }
    }

    /// Parse a raw description frame
    ///
    /// Only the first two bytes are mandatory; consistency with the frame list
    /// is checked by [`Envelope::validate`].
    pub fn parse(raw: &[u8]) -> Result<Self, FrameError> {
        if raw.len() < 2 {
            return Err(FrameError::DescriptionTooShort(raw.len()));
        }
        let frame_size = raw[0] as usize;
        let types_end = raw.len().min(2 + frame_size);
        let frames = raw[2..types_end]
            .iter()
            .map(|b| FrameType::from_byte(*b))
            .collect();
        let tag = raw
            .get(2 + frame_size)
            .map(|b| Tag::from_byte(*b))
            .unwrap_or(Tag::Normal);

        Ok(Self {
            frame_size,
            command: Command::from_byte(raw[1]),
            frames,
            tag,
            size: raw.len(),
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = Vec::with_capacity(3 + self.frames.len());
        out.push(self.frame_size as u8);
        out.push(self.command.to_byte());
        out.extend(self.frames.iter().map(|f| f.to_byte()));
        out.push(self.tag.to_byte());
        Bytes::from(out)
    }

    pub fn with_frame(mut self, frame_type: FrameType) -> Self {
        self.push(frame_type);
        self
    }

    pub fn with_tag(mut self, tag: Tag) -> Self {
        self.tag = tag;
        self
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn set_command(&mut self, command: Command) {
        self.command = command;
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn set_tag(&mut self, tag: Tag) {
        self.tag = tag;
    }

    /// Declared number of frames after the description
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Encoded length of the description frame
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn frame_types(&self) -> &[FrameType] {
        &self.frames
    }

    /// Type of the frame at `index` in the full envelope
    pub fn frame_type_at(&self, index: usize) -> Option<FrameType> {
        index.checked_sub(2).and_then(|i| self.frames.get(i)).copied()
    }

    /// Envelope index of the first frame of the given type
    pub fn index_of(&self, frame_type: FrameType) -> Option<usize> {
        self.frames
            .iter()
            .position(|f| *f == frame_type)
            .map(|i| i + 2)
    }

    pub fn contains(&self, frame_type: FrameType) -> bool {
        self.frames.contains(&frame_type)
    }

    fn push(&mut self, frame_type: FrameType) {
        self.frames.push(frame_type);
        self.resized();
    }

    fn insert_at(&mut self, index: usize, frame_type: FrameType) {
        let i = index.saturating_sub(2).min(self.frames.len());
        self.frames.insert(i, frame_type);
        self.resized();
    }

    fn remove_at(&mut self, index: usize) -> Option<FrameType> {
        let i = index.checked_sub(2)?;
        if i >= self.frames.len() {
            return None;
        }
        let removed = self.frames.remove(i);
        self.resized();
        Some(removed)
    }

    fn resized(&mut self) {
        self.frame_size = self.frames.len();
        self.size = 3 + self.frames.len();
    }
}

/// Which side of the station a frame list came from or goes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// TCP callers; service key trailer required
    External,
    /// In-process callers; delimiter frame, no service key
    Loopback,
}

/// Drop the REQ-style delimiter from loopback traffic
pub fn strip_delimiter(mut raw: Vec<Bytes>, origin: Origin) -> Vec<Bytes> {
    if origin == Origin::Loopback && raw.len() >= 2 {
        raw.remove(1);
    }
    raw
}

/// Whether frame 1 is the literal ping marker
pub fn is_ping_request(frames: &[Bytes]) -> bool {
    frames
        .get(1)
        .map(|f| f.as_ref() == PING_MARKER)
        .unwrap_or(false)
}

/// A decoded frame list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    origin: Origin,
    /// `[address][description placeholder][frames ...]`, delimiter removed
    frames: Vec<Bytes>,
    description: Description,
}

impl Envelope {
    /// Start a new envelope addressed to `address`
    pub fn new(origin: Origin, address: Bytes, description: Description) -> Self {
        let mut description = description;
        description.frames.clear();
        description.resized();
        Self {
            origin,
            frames: vec![address, Bytes::new()],
            description,
        }
    }

    /// Status reply for `address`
    pub fn status(origin: Origin, address: Bytes, status: &str) -> Self {
        let description = Description::new(Command::None).with_tag(Tag::ResultEnd);
        Self::new(origin, address, description)
            .with_frame(FrameType::Status, Bytes::copy_from_slice(status.as_bytes()))
    }

    /// Decode a raw frame list
    pub fn decode(raw: Vec<Bytes>, origin: Origin) -> Result<Self, FrameError> {
        Self::from_frames(strip_delimiter(raw, origin), origin)
    }

    /// Decode frames that already had the loopback delimiter removed
    pub fn from_frames(frames: Vec<Bytes>, origin: Origin) -> Result<Self, FrameError> {
        if frames.len() < 2 {
            return Err(FrameError::TooFewFrames(frames.len()));
        }
        let description = Description::parse(&frames[1])?;
        Ok(Self {
            origin,
            frames,
            description,
        })
    }

    /// Check the command range and the frame-size invariant
    pub fn validate(&self) -> Result<(), FrameError> {
        if let Command::Unknown(b) = self.description.command {
            return Err(FrameError::InvalidCommand(b));
        }
        self.check_frame_limit()?;
        let declared = self.description.frame_size();
        let description_len = self.description.size();
        if declared + 1 > description_len || declared + 2 != self.frames.len() {
            return Err(FrameError::SizeMismatch {
                declared,
                actual: self.frames.len(),
                description_len,
            });
        }
        Ok(())
    }

    /// Reject declared sizes above [`MAX_FRAME_SIZE`]
    pub fn check_frame_limit(&self) -> Result<(), FrameError> {
        let declared = self.description.frame_size();
        if declared > MAX_FRAME_SIZE {
            return Err(FrameError::TooManyFrames(declared));
        }
        Ok(())
    }

    /// Whether the declared and actual trailing frame is the expected key
    pub fn has_service_key(&self, expected: &[u8]) -> bool {
        if self.origin != Origin::External {
            return false;
        }
        let last = self.description.frame_size() + 1;
        self.description.frame_type_at(last) == Some(FrameType::ServiceKey)
            && self
                .frames
                .last()
                .map(|f| f.as_ref() == expected)
                .unwrap_or(false)
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn address(&self) -> &Bytes {
        &self.frames[0]
    }

    pub fn set_address(&mut self, address: Bytes) {
        self.frames[0] = address;
    }

    pub fn description(&self) -> &Description {
        &self.description
    }

    pub fn description_mut(&mut self) -> &mut Description {
        &mut self.description
    }

    /// Number of frames, delimiter excluded
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frame_at(&self, index: usize) -> Option<&Bytes> {
        if index == 1 {
            return None;
        }
        self.frames.get(index)
    }

    /// First frame of the given type
    pub fn frame(&self, frame_type: FrameType) -> Option<&Bytes> {
        self.description
            .index_of(frame_type)
            .and_then(|i| self.frames.get(i))
    }

    /// Frames after the description, service key excluded
    pub fn payload(&self) -> &[Bytes] {
        let end = self.service_key_index().unwrap_or(self.frames.len());
        &self.frames[2.min(end)..end]
    }

    fn service_key_index(&self) -> Option<usize> {
        let last = self.frames.len().checked_sub(1)?;
        if last >= 2 && self.description.frame_type_at(last) == Some(FrameType::ServiceKey) {
            Some(last)
        } else {
            None
        }
    }

    /// Append a typed frame, keeping the service key last
    pub fn append_frame(&mut self, frame_type: FrameType, value: Bytes) {
        match self.service_key_index() {
            Some(i) => {
                self.frames.insert(i, value);
                self.description.insert_at(i, frame_type);
            }
            None => {
                self.frames.push(value);
                self.description.push(frame_type);
            }
        }
    }

    pub fn with_frame(mut self, frame_type: FrameType, value: Bytes) -> Self {
        self.append_frame(frame_type, value);
        self
    }

    /// Remove the first frame of the given type
    pub fn remove_frame(&mut self, frame_type: FrameType) -> Option<Bytes> {
        let i = self.description.index_of(frame_type)?;
        if i >= self.frames.len() {
            return None;
        }
        self.description.remove_at(i);
        Some(self.frames.remove(i))
    }

    pub fn strip_service_key(&mut self) -> Option<Bytes> {
        let i = self.service_key_index()?;
        self.description.remove_at(i);
        Some(self.frames.remove(i))
    }

    /// Build the raw frame list for `dest`
    ///
    /// External destinations get the service key trailer; loopback
    /// destinations get the delimiter frame and never a key.
    pub fn encode(mut self, dest: Origin, service_key: &[u8]) -> Vec<Bytes> {
        match dest {
            Origin::External => {
                if self.service_key_index().is_none() {
                    self.frames.push(Bytes::copy_from_slice(service_key));
                    self.description.push(FrameType::ServiceKey);
                }
            }
            Origin::Loopback => {
                self.strip_service_key();
            }
        }
        self.frames[1] = self.description.to_bytes();
        if dest == Origin::Loopback {
            self.frames.insert(1, Bytes::new());
        }
        self.frames
    }

    /// Frame list starting at the description, for REQ/DEALER/PUB sockets
    ///
    /// The socket itself adds whatever routing prefix it needs.
    pub fn encode_unaddressed(self, dest: Origin, service_key: &[u8]) -> Vec<Bytes> {
        let skip = match dest {
            Origin::External => 1,
            Origin::Loopback => 2,
        };
        self.encode(dest, service_key).into_iter().skip(skip).collect()
    }
}
