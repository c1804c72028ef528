//! Wire-format definitions for protocol messages.
//!
//! Every frame exchanged between an agency and the central server is a
//! [`Message`].  This module is responsible for:
//! - Defining the on-wire binary layout of each of the seven message kinds.
//! - Serialising a [`Message`] into a byte buffer ready for transmission.
//! - Deserialising a frame body back into a [`Message`], returning errors for
//!   unknown tags and truncated or malformed input.
//! - Telling a stream reader how many bytes the next piece of a frame needs
//!   ([`FrameAssembler`]), since frames carry no outer length.
//!
//! No I/O happens here; this is pure data transformation.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.  Every frame starts with a
//! 2-byte type tag, the only discriminator used for decoding.
//!
//! ```text
//! RegisterBatch  : type(2) count(4) { betLen(8) bet(betLen) }*count
//!   bet          : agency(4) nameLen(4) name surnameLen(4) surname
//!                  holderId(4) birthUnix(8) number(4)
//! RegisterOk     : type(2)
//! RegisterFailed : type(2) errorCode(2)
//! Ack            : type(2)
//! AllSent        : type(2)
//! RequestWinners : type(2)
//! InformWinners  : type(2) [ winnerCount(8) { holderId(4) }*winnerCount ]
//! ```
//!
//! `InformWinners` omits the count entirely when there are no winners.

use thiserror::Error;

use crate::wager::{Wager, WAGER_FIXED_LEN};

/// Byte length of the type tag that opens every frame.
pub const TAG_LEN: usize = 2;
/// Byte length of the wager count of a `RegisterBatch`.
pub const BATCH_COUNT_LEN: usize = 4;
/// Byte length of the per-wager length prefix inside a `RegisterBatch`.
pub const BET_LEN_PREFIX: usize = 8;
/// Byte length of the winner count of a non-empty `InformWinners`.
pub const WINNER_COUNT_LEN: usize = 8;
/// Byte length of one holder id in `InformWinners`.
pub const HOLDER_ID_LEN: usize = 4;
/// Byte length of the `RegisterFailed` error code.
pub const ERROR_CODE_LEN: usize = 2;

/// Largest single wager a peer may announce.
pub const MAX_BET_LEN: usize = 64 * 1024;
/// Largest winner list a peer may announce.
pub const MAX_WINNERS: u64 = 1 << 20;
/// Largest complete frame a peer may send, tag included.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Framing bytes spent on a `RegisterBatch` of `count` wagers, on top of the
/// wagers' own serialized size.
pub const fn batch_overhead(count: usize) -> usize {
    TAG_LEN + BATCH_COUNT_LEN + BET_LEN_PREFIX * count
}

/// Error codes carried by `RegisterFailed`.  Never zero.
pub mod error_codes {
    /// A wager in the batch is missing a required field.
    pub const INVALID_WAGER: u16 = 1;
    /// A wager names a different agency than the connection's.
    pub const AGENCY_MISMATCH: u16 = 2;
    /// The persistence layer refused the batch.
    pub const STORE_FAILED: u16 = 3;
}

// ---------------------------------------------------------------------------
// Message type tags
// ---------------------------------------------------------------------------

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    RegisterBatch = 1,
    RegisterOk = 2,
    RegisterFailed = 3,
    Ack = 4,
    AllSent = 5,
    RequestWinners = 6,
    InformWinners = 7,
}

impl MessageType {
    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            1 => MessageType::RegisterBatch,
            2 => MessageType::RegisterOk,
            3 => MessageType::RegisterFailed,
            4 => MessageType::Ack,
            5 => MessageType::AllSent,
            6 => MessageType::RequestWinners,
            7 => MessageType::InformWinners,
            _ => return None,
        })
    }

    pub fn to_u16(self) -> u16 {
        self as u16
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    RegisterBatch { wagers: Vec<Wager> },
    RegisterOk,
    RegisterFailed { error_code: u16 },
    Ack,
    AllSent,
    RequestWinners,
    InformWinners { holder_ids: Vec<u32> },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::RegisterBatch { .. } => MessageType::RegisterBatch,
            Message::RegisterOk => MessageType::RegisterOk,
            Message::RegisterFailed { .. } => MessageType::RegisterFailed,
            Message::Ack => MessageType::Ack,
            Message::AllSent => MessageType::AllSent,
            Message::RequestWinners => MessageType::RequestWinners,
            Message::InformWinners { .. } => MessageType::InformWinners,
        }
    }

    /// Serialise this message into a newly allocated frame.
    ///
    /// Length fields that do not fit their wire width are written as the
    /// field's maximum, which the receiving side rejects.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&self.message_type().to_u16().to_be_bytes());

        match self {
            Message::RegisterBatch { wagers } => {
                buf.extend_from_slice(&wire_len(wagers.len(), u32::MAX).to_be_bytes());
                for wager in wagers {
                    buf.extend_from_slice(&wire_len(wager.encoded_len(), i64::MAX).to_be_bytes());
                    encode_wager(wager, &mut buf);
                }
            }
            Message::RegisterFailed { error_code } => {
                buf.extend_from_slice(&error_code.to_be_bytes());
            }
            Message::InformWinners { holder_ids } if !holder_ids.is_empty() => {
                buf.extend_from_slice(&wire_len(holder_ids.len(), u64::MAX).to_be_bytes());
                for id in holder_ids {
                    buf.extend_from_slice(&id.to_be_bytes());
                }
            }
            _ => {}
        }

        buf
    }

    /// Exact length of [`encode`](Self::encode)'s output.
    pub fn encoded_len(&self) -> usize {
        match self {
            Message::RegisterBatch { wagers } => {
                batch_overhead(wagers.len()) + wagers.iter().map(Wager::encoded_len).sum::<usize>()
            }
            Message::RegisterFailed { .. } => TAG_LEN + ERROR_CODE_LEN,
            Message::InformWinners { holder_ids } if !holder_ids.is_empty() => {
                TAG_LEN + WINNER_COUNT_LEN + HOLDER_ID_LEN * holder_ids.len()
            }
            _ => TAG_LEN,
        }
    }

    /// Decode the body that follows a type tag.
    ///
    /// `body` must hold exactly one frame's worth of bytes after the tag.
    /// Returns [`Err`] if:
    /// - `tag` is not a known message type,
    /// - `body` ends before a field is complete, or
    /// - a length or text field is invalid, or bytes are left over.
    pub fn decode(tag: u16, body: &[u8]) -> Result<Self, DecodeError> {
        let kind = MessageType::from_u16(tag).ok_or(DecodeError::UnknownMessageType(tag))?;
        let mut r = Reader::new(body);

        let msg = match kind {
            MessageType::RegisterBatch => {
                let count = checked_batch_count(r.u32()?)?;
                let mut wagers = Vec::with_capacity(count.min(1024) as usize);
                for _ in 0..count {
                    let len = checked_bet_len(r.i64()?)?;
                    let mut bet = Reader::new(r.take(len)?);
                    wagers.push(decode_wager(&mut bet)?);
                    bet.finish()?;
                }
                Message::RegisterBatch { wagers }
            }
            MessageType::RegisterOk => Message::RegisterOk,
            MessageType::RegisterFailed => Message::RegisterFailed {
                error_code: r.u16()?,
            },
            MessageType::Ack => Message::Ack,
            MessageType::AllSent => Message::AllSent,
            MessageType::RequestWinners => Message::RequestWinners,
            MessageType::InformWinners => {
                let mut holder_ids = Vec::new();
                if !r.is_empty() {
                    let count = checked_winner_count(r.u64()?)?;
                    holder_ids.reserve(count);
                    for _ in 0..count {
                        holder_ids.push(r.u32()?);
                    }
                }
                Message::InformWinners { holder_ids }
            }
        };

        r.finish()?;
        Ok(msg)
    }

    /// Decode a complete frame, tag included.
    pub fn decode_frame(frame: &[u8]) -> Result<Self, DecodeError> {
        if frame.len() < TAG_LEN {
            return Err(DecodeError::Truncated {
                needed: TAG_LEN,
                available: frame.len(),
            });
        }
        let tag = u16::from_be_bytes([frame[0], frame[1]]);
        Self::decode(tag, &frame[TAG_LEN..])
    }
}

/// Errors that can arise when parsing a frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown message type {0}")]
    UnknownMessageType(u16),
    #[error("truncated frame: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("invalid {field} {value}")]
    InvalidLength { field: &'static str, value: i128 },
    #[error("{0} is not valid UTF-8")]
    InvalidText(&'static str),
    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),
    #[error("frame of at least {len} bytes exceeds the {limit}-byte limit")]
    FrameTooLarge { len: usize, limit: usize },
}

fn wire_len<T: TryFrom<usize>>(len: usize, max: T) -> T {
    T::try_from(len).unwrap_or(max)
}

/// Reject counts whose smallest possible frame already exceeds
/// [`MAX_FRAME_LEN`].
fn checked_batch_count(count: u32) -> Result<u32, DecodeError> {
    let per_bet = (BET_LEN_PREFIX + WAGER_FIXED_LEN) as u64;
    let smallest = (TAG_LEN + BATCH_COUNT_LEN) as u64 + u64::from(count) * per_bet;
    if smallest > MAX_FRAME_LEN as u64 {
        return Err(DecodeError::InvalidLength {
            field: "batch count",
            value: i128::from(count),
        });
    }
    Ok(count)
}

fn checked_bet_len(len: i64) -> Result<usize, DecodeError> {
    if len <= 0 || len as u64 > MAX_BET_LEN as u64 {
        return Err(DecodeError::InvalidLength {
            field: "bet length",
            value: i128::from(len),
        });
    }
    Ok(len as usize)
}

fn checked_winner_count(count: u64) -> Result<usize, DecodeError> {
    if count == 0 || count > MAX_WINNERS {
        return Err(DecodeError::InvalidLength {
            field: "winner count",
            value: i128::from(count),
        });
    }
    Ok(count as usize)
}

fn encode_wager(wager: &Wager, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&wager.agency.to_be_bytes());
    buf.extend_from_slice(&wire_len(wager.name.len(), u32::MAX).to_be_bytes());
    buf.extend_from_slice(wager.name.as_bytes());
    buf.extend_from_slice(&wire_len(wager.surname.len(), u32::MAX).to_be_bytes());
    buf.extend_from_slice(wager.surname.as_bytes());
    buf.extend_from_slice(&wager.holder_id.to_be_bytes());
    buf.extend_from_slice(&wager.birth_unix.to_be_bytes());
    buf.extend_from_slice(&wager.number.to_be_bytes());
}

fn decode_wager(r: &mut Reader<'_>) -> Result<Wager, DecodeError> {
    let agency = r.u32()?;
    let name = r.text("name")?;
    let surname = r.text("surname")?;
    let holder_id = r.u32()?;
    let birth_unix = r.i64()?;
    let number = r.u32()?;
    Ok(Wager {
        agency,
        name,
        surname,
        holder_id,
        birth_unix,
        number,
    })
}

/// Bounds-checked big-endian cursor over a frame body.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos == self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let available = self.buf.len() - self.pos;
        if n > available {
            return Err(DecodeError::Truncated {
                needed: n,
                available,
            });
        }
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        self.array().map(u16::from_be_bytes)
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        self.array().map(u32::from_be_bytes)
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        self.array().map(u64::from_be_bytes)
    }

    fn i64(&mut self) -> Result<i64, DecodeError> {
        self.array().map(i64::from_be_bytes)
    }

    fn text(&mut self, field: &'static str) -> Result<String, DecodeError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidText(field))
    }

    fn finish(&self) -> Result<(), DecodeError> {
        match self.buf.len() - self.pos {
            0 => Ok(()),
            n => Err(DecodeError::TrailingBytes(n)),
        }
    }
}

// ---------------------------------------------------------------------------
// FrameAssembler
// ---------------------------------------------------------------------------

/// How many bytes the next step of a frame needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Need {
    /// Exactly this many bytes must follow.
    Exact(usize),
    /// Exactly this many bytes, or a clean end of stream (frame complete).
    ExactOrEnd(usize),
}

impl Need {
    pub fn len(self) -> usize {
        match self {
            Need::Exact(n) | Need::ExactOrEnd(n) => n,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Tag,
    Fixed(usize),
    BatchCount,
    BetLen { left: u32 },
    Bet { left: u32, len: usize },
    WinnerCount,
    Winners(usize),
    Done,
}

/// Incrementally collects one frame from a byte stream.
///
/// The reader asks [`need`](Self::need) how many bytes to read, hands them to
/// [`push`](Self::push), and repeats until `need` returns `None`; then
/// [`finish`](Self::finish) decodes the collected frame.
#[derive(Debug)]
pub struct FrameAssembler {
    frame: Vec<u8>,
    step: Step,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self {
            frame: Vec::with_capacity(64),
            step: Step::Tag,
        }
    }

    /// `true` until the first byte of the frame has been pushed.
    pub fn is_fresh(&self) -> bool {
        self.step == Step::Tag
    }

    /// The next read this frame requires, or `None` once it is complete.
    pub fn need(&self) -> Option<Need> {
        Some(match self.step {
            Step::Tag => Need::Exact(TAG_LEN),
            Step::Fixed(n) => Need::Exact(n),
            Step::BatchCount => Need::Exact(BATCH_COUNT_LEN),
            Step::BetLen { .. } => Need::Exact(BET_LEN_PREFIX),
            Step::Bet { len, .. } => Need::Exact(len),
            Step::WinnerCount => Need::ExactOrEnd(WINNER_COUNT_LEN),
            Step::Winners(count) => Need::Exact(count * HOLDER_ID_LEN),
            Step::Done => return None,
        })
    }

    /// Append the bytes requested by [`need`](Self::need) and advance.
    pub fn push(&mut self, chunk: &[u8]) -> Result<(), DecodeError> {
        let wanted = self.need().map_or(0, Need::len);
        if chunk.len() != wanted {
            return Err(DecodeError::Truncated {
                needed: wanted,
                available: chunk.len(),
            });
        }
        self.frame.extend_from_slice(chunk);

        self.step = match self.step {
            Step::Tag => {
                let tag = u16::from_be_bytes([chunk[0], chunk[1]]);
                match MessageType::from_u16(tag).ok_or(DecodeError::UnknownMessageType(tag))? {
                    MessageType::RegisterBatch => Step::BatchCount,
                    MessageType::RegisterFailed => Step::Fixed(ERROR_CODE_LEN),
                    MessageType::InformWinners => Step::WinnerCount,
                    _ => Step::Done,
                }
            }
            Step::BatchCount => match checked_batch_count(Reader::new(chunk).u32()?)? {
                0 => Step::Done,
                left => Step::BetLen { left },
            },
            Step::BetLen { left } => Step::Bet {
                left,
                len: checked_bet_len(Reader::new(chunk).i64()?)?,
            },
            Step::Bet { left, .. } if left > 1 => Step::BetLen { left: left - 1 },
            Step::WinnerCount => Step::Winners(checked_winner_count(Reader::new(chunk).u64()?)?),
            Step::Bet { .. } | Step::Fixed(_) | Step::Winners(_) | Step::Done => Step::Done,
        };

        if let Some(need) = self.need() {
            let len = self.frame.len() + need.len();
            if len > MAX_FRAME_LEN {
                return Err(DecodeError::FrameTooLarge {
                    len,
                    limit: MAX_FRAME_LEN,
                });
            }
        }
        Ok(())
    }

    /// Record a clean end of stream where [`Need::ExactOrEnd`] allowed one.
    pub fn end(&mut self) -> Result<(), DecodeError> {
        match self.need() {
            Some(Need::ExactOrEnd(_)) => {
                self.step = Step::Done;
                Ok(())
            }
            other => Err(DecodeError::Truncated {
                needed: other.map_or(0, Need::len),
                available: 0,
            }),
        }
    }

    /// Decode the collected frame.
    pub fn finish(self) -> Result<Message, DecodeError> {
        if let Some(need) = self.need() {
            return Err(DecodeError::Truncated {
                needed: need.len(),
                available: 0,
            });
        }
        Message::decode_frame(&self.frame)
    }
}
