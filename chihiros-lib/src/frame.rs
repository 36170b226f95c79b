//! # Chihiros UART frame codec
//!
//! Every message on the Nordic UART link has the same shape:
//!
//! ```text
//! [cmd_id, 0x01, length, msg_hi, msg_lo, mode, *params, checksum]
//! ```
//!
//! - `length` is `params.len() + K`, with `K = 5` for the A5/5A families and
//!   `K = 2` for the LED-style 5B family.
//! - `checksum` is the XOR of every byte from index 1 through the last
//!   parameter.
//! - The sentinel `0x5A` never appears in the checksum, the message id or a
//!   parameter: parameter bytes are remapped to `0x59`, and a checksum that
//!   lands on the sentinel is avoided by rotating the message id.
//!
//! Building is pure; the caller owns the message-id sequence and threads it
//! through [`build_frame`].

use crate::constants::{
    CHECKSUM_REBUILD_ATTEMPTS, CMD_LED_QUERY, HEADER_SIZE, LENGTH_BIAS_5B, LENGTH_BIAS_A5, MIN_FRAME_SIZE,
    PROTOCOL_VERSION, SENTINEL, SENTINEL_REPLACEMENT,
};
use crate::error::{ChihirosError, Result};
use crate::message_id::MessageId;
use bytes::Bytes;
use std::fmt;
use tracing::warn;

/// Command families distinguished by their length-field bias.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandFamily {
    /// 0xA5 doser and 0x5A LED commands
    A5,
    /// 0x5B LED-style queries and totals responses
    Led5B,
}

impl CommandFamily {
    pub fn of(cmd_id: u8) -> Self {
        if cmd_id == CMD_LED_QUERY {
            CommandFamily::Led5B
        } else {
            CommandFamily::A5
        }
    }

    pub fn length_bias(self) -> u8 {
        match self {
            CommandFamily::A5 => LENGTH_BIAS_A5,
            CommandFamily::Led5B => LENGTH_BIAS_5B,
        }
    }

    /// Longest parameter list the one-byte length field can describe.
    pub fn max_params(self) -> usize {
        usize::from(u8::MAX - self.length_bias())
    }
}

/// Reject parameter lists whose length would overflow the length byte.
pub fn check_param_len(cmd_id: u8, len: usize) -> Result<()> {
    let max = CommandFamily::of(cmd_id).max_params();
    if len > max {
        return Err(ChihirosError::InvalidParameter(format!(
            "{len} parameter bytes exceed the {max}-byte limit for command {cmd_id:#04x}"
        )));
    }
    Ok(())
}

/// A complete, immutable protocol frame.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Frame(Bytes);

impl Frame {
    pub fn cmd_id(&self) -> u8 {
        self.0[0]
    }

    pub fn mode(&self) -> u8 {
        self.0[5]
    }

    pub fn msg_id(&self) -> MessageId {
        MessageId::new(self.0[3], self.0[4])
    }

    pub fn params(&self) -> &[u8] {
        &self.0[HEADER_SIZE..self.0.len() - 1]
    }

    pub fn checksum(&self) -> u8 {
        self.0[self.0.len() - 1]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_bytes(&self) -> Bytes {
        self.0.clone()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Frame {
    /// Space-separated upper-case hex, e.g. `A5 01 0A 00 01 1B ...`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&spaced_hex(&self.0))
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame[{}]", spaced_hex(&self.0))
    }
}

/// XOR of `buf[1..]`; zero for buffers shorter than two bytes.
pub fn xor_checksum(buf: &[u8]) -> u8 {
    buf.iter().skip(1).fold(0, |acc, b| acc ^ b)
}

/// Remap parameter bytes equal to the sentinel.
pub fn sanitize_params(params: &[u8]) -> Vec<u8> {
    params
        .iter()
        .map(|&b| if b == SENTINEL { SENTINEL_REPLACEMENT } else { b })
        .collect()
}

/// Narrow caller-supplied integers to parameter bytes, rejecting anything
/// outside `0..=255`.
pub fn params_from_ints(values: &[i64]) -> Result<Vec<u8>> {
    values
        .iter()
        .map(|&v| {
            u8::try_from(v).map_err(|_| ChihirosError::InvalidParameter(format!("parameter byte out of range 0..=255: {v}")))
        })
        .collect()
}

/// Build a frame, rotating the message id while the checksum hits the sentinel.
///
/// Returns the frame together with the message id embedded in it; callers
/// continue their sequence from that id. After
/// [`CHECKSUM_REBUILD_ATTEMPTS`] collisions the last attempt is returned
/// as-is (observed firmware tolerance, unverified).
///
/// A starting id containing the sentinel is advanced to the next clean id.
/// `params` must fit the length byte; see [`check_param_len`].
pub fn build_frame(cmd_id: u8, mode: u8, msg_id: MessageId, params: &[u8]) -> (Frame, MessageId) {
    let params = sanitize_params(params);
    let length = (params.len() as u8).wrapping_add(CommandFamily::of(cmd_id).length_bias());

    let mut id = msg_id.normalized();
    let mut body = Vec::with_capacity(MIN_FRAME_SIZE + params.len());
    for attempt in 0..CHECKSUM_REBUILD_ATTEMPTS {
        if attempt > 0 {
            id = id.next();
        }
        body.clear();
        body.extend_from_slice(&[cmd_id, PROTOCOL_VERSION, length, id.hi, id.lo, mode]);
        body.extend_from_slice(&params);
        let checksum = xor_checksum(&body);
        if checksum != SENTINEL {
            body.push(checksum);
            return (Frame(Bytes::from(body)), id);
        }
    }

    warn!(cmd_id, mode, msg_id = %id, "checksum still equals sentinel after rotation, sending last attempt");
    let checksum = xor_checksum(&body);
    body.push(checksum);
    (Frame(Bytes::from(body)), id)
}

/// Build an LED-style 0x5B frame.
pub fn encode_5b(mode: u8, msg_id: MessageId, params: &[u8]) -> (Frame, MessageId) {
    build_frame(CMD_LED_QUERY, mode, msg_id, params)
}

/// Structural view of an arbitrary byte string laid out as a frame.
///
/// Never fails: short input simply leaves later fields empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameView {
    pub raw: Bytes,
    pub cmd_id: Option<u8>,
    pub version: Option<u8>,
    pub length: Option<u8>,
    pub msg_hi: Option<u8>,
    pub msg_lo: Option<u8>,
    pub mode: Option<u8>,
    pub params: Vec<u8>,
    pub checksum: Option<u8>,
}

impl FrameView {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let at = |i: usize| bytes.get(i).copied();
        let (params, checksum) = if bytes.len() >= MIN_FRAME_SIZE {
            (bytes[HEADER_SIZE..bytes.len() - 1].to_vec(), bytes.last().copied())
        } else {
            (Vec::new(), None)
        };
        Self {
            raw: Bytes::copy_from_slice(bytes),
            cmd_id: at(0),
            version: at(1),
            length: at(2),
            msg_hi: at(3),
            msg_lo: at(4),
            mode: at(5),
            params,
            checksum,
        }
    }

    /// Parameter count implied by the length field, if it is consistent.
    pub fn declared_param_len(&self) -> Option<usize> {
        let bias = CommandFamily::of(self.cmd_id?).length_bias();
        self.length?.checked_sub(bias).map(usize::from)
    }

    pub fn length_consistent(&self) -> bool {
        self.declared_param_len() == Some(self.params.len())
    }

    pub fn checksum_ok(&self) -> bool {
        match self.checksum {
            Some(checksum) => xor_checksum(&self.raw[..self.raw.len() - 1]) == checksum,
            None => false,
        }
    }

    /// Promote to a [`Frame`] when the bytes form a complete frame.
    pub fn to_frame(&self) -> Option<Frame> {
        (self.raw.len() >= MIN_FRAME_SIZE).then(|| Frame(self.raw.clone()))
    }
}

impl fmt::Display for FrameView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let field = |v: Option<u8>| v.map_or_else(|| "????".to_string(), |b| b.to_string());
        writeln!(f, "  Command Print    : {:?}", self.raw.as_ref())?;
        writeln!(f, "  Command ID       : {}", field(self.cmd_id))?;
        writeln!(f, "  Version          : {}", field(self.version))?;
        writeln!(f, "  Command Length   : {}", field(self.length))?;
        writeln!(f, "  Message ID High  : {}", field(self.msg_hi))?;
        writeln!(f, "  Message ID Low   : {}", field(self.msg_lo))?;
        writeln!(f, "  Mode             : {}", field(self.mode))?;
        writeln!(f, "  Parameters       : {:?}", self.params)?;
        write!(
            f,
            "  Checksum         : {} ({})",
            field(self.checksum),
            if self.checksum_ok() { "ok" } else { "mismatch" }
        )
    }
}

/// Upper-case hex with single spaces between bytes.
pub fn spaced_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect::<Vec<_>>().join(" ")
}

/// Parse a hex payload, ignoring whitespace (`"A5 01 0A"` or `"a5010a"`).
pub fn parse_hex_blob(blob: &str) -> Result<Vec<u8>> {
    let compact: String = blob.split_whitespace().collect();
    if compact.len() % 2 != 0 {
        return Err(ChihirosError::InvalidParameter("Hex length must be even.".to_string()));
    }
    Ok(hex::decode(compact)?)
}
