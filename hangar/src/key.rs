//! Catalog keys and their wire forms
//!
//! A [`TableKey`] is the structural triple `(kind, command, path)` taken from a
//! Flight descriptor. Tickets handed out in `FlightInfo` endpoints are the
//! key's strict binary encoding rendered as lowercase hex:
//!
//! ```text
//! "HK" | version u8 | kind tag u8 | has_cmd u8 [| cmd_len u32 | cmd bytes]
//!      | segment_count u32 | (segment_len u32 | utf-8 bytes)*
//! ```
//!
//! All integers are big-endian. Decoding never evaluates its input; any
//! deviation from the layout is a `MalformedTicket`.

use std::fmt;

use arrow_flight::flight_descriptor::DescriptorType;
use arrow_flight::FlightDescriptor;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{HangarError, Result};

const TICKET_MAGIC: &[u8; 2] = b"HK";
const TICKET_VERSION: u8 = 1;

/// Which half of a Flight descriptor identifies the table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DescriptorKind {
    Command,
    Path,
}

impl DescriptorKind {
    fn tag(self) -> u8 {
        match self {
            DescriptorKind::Command => 1,
            DescriptorKind::Path => 2,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(DescriptorKind::Command),
            2 => Some(DescriptorKind::Path),
            _ => None,
        }
    }
}

/// Structural catalog key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableKey {
    kind: DescriptorKind,
    command: Option<Bytes>,
    path: Vec<String>,
}

/// Build a key from its parts, rejecting shapes no descriptor can produce.
///
/// A command key carries non-empty command bytes and no path; a path key
/// carries no command and at least one non-empty segment.
pub fn encode_key(
    kind: DescriptorKind,
    command: Option<Bytes>,
    path: Vec<String>,
) -> Result<TableKey> {
    match kind {
        DescriptorKind::Command => {
            match &command {
                Some(cmd) if !cmd.is_empty() => {}
                _ => {
                    return Err(HangarError::MalformedDescriptor(
                        "command descriptor has an empty command".to_string(),
                    ))
                }
            }
            if !path.is_empty() {
                return Err(HangarError::MalformedDescriptor(
                    "command descriptor must not carry a path".to_string(),
                ));
            }
        }
        DescriptorKind::Path => {
            if command.is_some() {
                return Err(HangarError::MalformedDescriptor(
                    "path descriptor must not carry a command".to_string(),
                ));
            }
            if path.is_empty() {
                return Err(HangarError::MalformedDescriptor(
                    "path descriptor has no segments".to_string(),
                ));
            }
            if path.iter().any(|s| s.is_empty()) {
                return Err(HangarError::MalformedDescriptor(
                    "path descriptor has an empty segment".to_string(),
                ));
            }
        }
    }

    Ok(TableKey { kind, command, path })
}

/// Decode a printable ticket back into its key.
pub fn parse_ticket(ticket: &str) -> Result<TableKey> {
    let raw = hex::decode(ticket)
        .map_err(|e| HangarError::MalformedTicket(format!("not hex: {}", e)))?;
    decode_ticket_bytes(&raw)
}

impl TableKey {
    /// Key for a named table, as used by the client facade.
    pub fn command(name: impl Into<Bytes>) -> Result<Self> {
        encode_key(DescriptorKind::Command, Some(name.into()), Vec::new())
    }

    pub fn path<I, S>(segments: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        encode_key(
            DescriptorKind::Path,
            None,
            segments.into_iter().map(Into::into).collect(),
        )
    }

    pub fn from_descriptor(descriptor: &FlightDescriptor) -> Result<Self> {
        match DescriptorType::try_from(descriptor.r#type) {
            Ok(DescriptorType::Cmd) => encode_key(
                DescriptorKind::Command,
                Some(descriptor.cmd.clone()),
                descriptor.path.clone(),
            ),
            Ok(DescriptorType::Path) => {
                if !descriptor.cmd.is_empty() {
                    return Err(HangarError::MalformedDescriptor(
                        "path descriptor must not carry a command".to_string(),
                    ));
                }
                encode_key(DescriptorKind::Path, None, descriptor.path.clone())
            }
            _ => Err(HangarError::MalformedDescriptor(format!(
                "unsupported descriptor type {}",
                descriptor.r#type
            ))),
        }
    }

    pub fn to_descriptor(&self) -> FlightDescriptor {
        match self.kind {
            DescriptorKind::Command => {
                FlightDescriptor::new_cmd(self.command.clone().unwrap_or_default())
            }
            DescriptorKind::Path => FlightDescriptor::new_path(self.path.clone()),
        }
    }

    pub fn kind(&self) -> DescriptorKind {
        self.kind
    }

    pub fn command_bytes(&self) -> Option<&Bytes> {
        self.command.as_ref()
    }

    pub fn segments(&self) -> &[String] {
        &self.path
    }

    /// Human-facing table name: the command as UTF-8, or the path joined by `/`
    pub fn name(&self) -> String {
        match &self.command {
            Some(cmd) => String::from_utf8_lossy(cmd).into_owned(),
            None => self.path.join("/"),
        }
    }

    /// Printable ticket for this key
    pub fn to_ticket(&self) -> String {
        hex::encode(self.to_ticket_bytes())
    }

    fn to_ticket_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_slice(TICKET_MAGIC);
        buf.put_u8(TICKET_VERSION);
        buf.put_u8(self.kind.tag());
        match &self.command {
            Some(cmd) => {
                buf.put_u8(1);
                buf.put_u32(cmd.len() as u32);
                buf.put_slice(cmd);
            }
            None => buf.put_u8(0),
        }
        buf.put_u32(self.path.len() as u32);
        for segment in &self.path {
            buf.put_u32(segment.len() as u32);
            buf.put_slice(segment.as_bytes());
        }
        buf.freeze()
    }
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DescriptorKind::Command => write!(f, "cmd:{}", self.name()),
            DescriptorKind::Path => write!(f, "path:{}", self.name()),
        }
    }
}

fn malformed(msg: &str) -> HangarError {
    HangarError::MalformedTicket(msg.to_string())
}

fn take_u8(buf: &mut &[u8], what: &str) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(malformed(&format!("truncated before {}", what)));
    }
    Ok(buf.get_u8())
}

fn take_u32(buf: &mut &[u8], what: &str) -> Result<usize> {
    if buf.remaining() < 4 {
        return Err(malformed(&format!("truncated before {}", what)));
    }
    Ok(buf.get_u32() as usize)
}

fn take_bytes<'a>(buf: &mut &'a [u8], len: usize, what: &str) -> Result<&'a [u8]> {
    if buf.len() < len {
        return Err(malformed(&format!(
            "{} declares {} bytes, {} remain",
            what,
            len,
            buf.len()
        )));
    }
    let whole: &'a [u8] = *buf;
    let (head, tail) = whole.split_at(len);
    *buf = tail;
    Ok(head)
}

fn decode_ticket_bytes(raw: &[u8]) -> Result<TableKey> {
    let mut buf = raw;

    let magic = take_bytes(&mut buf, TICKET_MAGIC.len(), "magic")?;
    if magic != TICKET_MAGIC {
        return Err(malformed("bad magic"));
    }
    let version = take_u8(&mut buf, "version")?;
    if version != TICKET_VERSION {
        return Err(malformed(&format!("unsupported version {}", version)));
    }
    let tag = take_u8(&mut buf, "kind")?;
    let kind = DescriptorKind::from_tag(tag)
        .ok_or_else(|| malformed(&format!("unknown kind tag {}", tag)))?;

    let command = match take_u8(&mut buf, "command flag")? {
        0 => None,
        1 => {
            let len = take_u32(&mut buf, "command length")?;
            Some(Bytes::copy_from_slice(take_bytes(&mut buf, len, "command")?))
        }
        other => return Err(malformed(&format!("bad command flag {}", other))),
    };

    let count = take_u32(&mut buf, "segment count")?;
    // Every segment needs at least its length prefix.
    if count > buf.len() / 4 {
        return Err(malformed("segment count exceeds ticket length"));
    }
    let mut path = Vec::with_capacity(count);
    for _ in 0..count {
        let len = take_u32(&mut buf, "segment length")?;
        let segment = take_bytes(&mut buf, len, "segment")?;
        let segment = std::str::from_utf8(segment)
            .map_err(|_| malformed("segment is not valid UTF-8"))?;
        path.push(segment.to_string());
    }

    if !buf.is_empty() {
        return Err(malformed(&format!("{} trailing bytes", buf.len())));
    }

    encode_key(kind, command, path).map_err(|e| match e {
        HangarError::MalformedDescriptor(msg) => HangarError::MalformedTicket(msg),
        other => other,
    })
}
