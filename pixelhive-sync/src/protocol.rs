//! Binary and text wire protocol for live canvas events.
//!
//! High-frequency traffic uses fixed big-endian layouts behind a one-byte
//! opcode:
//! ```text
//! ┌────────┬──────────────────────────────┐
//! │ opcode │ fixed payload (per opcode)   │
//! │ 1 byte │ variable                     │
//! └────────┴──────────────────────────────┘
//! ```
//! A pixel update packs the chunk coordinate into one u16 and carries any
//! number of `(offset: u16, color: u8)` cells:
//! ```text
//! ┌────────┬─────┬─────┬────────────────────────┐
//! │ 0xC1   │ i   │ j   │ (offset u16, color u8)*│
//! └────────┴─────┴─────┴────────────────────────┘
//! ```
//! Low-frequency chat-like traffic uses `"<2-letter tag>,<JSON array>"`;
//! the tag is split off at the first comma so routing never needs a full
//! JSON parse. Command/reply messages are plain JSON arrays whose first
//! element is the verb.
//!
//! Every codec here is an exact inverse pair: `decode(encode(x)) == x`,
//! and out-of-range values are rejected at construction instead of being
//! truncated on the wire.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Opcode byte leading every binary frame.
///
/// `0xA0..` are registration/session opcodes, `0xB0` is the heartbeat,
/// `0xC0..` carry canvas data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Select the canvas this connection watches (client → server)
    RegCanvas = 0xA0,
    /// Watch a single chunk (client → server)
    RegChunk = 0xA1,
    /// Stop watching a single chunk (client → server)
    DeRegChunk = 0xA2,
    /// Watch many chunks at once (client → server)
    RegMChunks = 0xA3,
    /// Stop watching many chunks at once (client → server)
    DeRegMChunks = 0xA4,
    /// Identity changed server-side, client must reload and reconnect
    ChangeMe = 0xA6,
    /// Viewer counts, total and per canvas
    OnlineCounter = 0xA7,
    /// One-byte heartbeat, no distinct reply
    Ping = 0xB0,
    /// Pixel cells within one chunk (both directions)
    PixelUpdate = 0xC1,
    /// Current placement cooldown in milliseconds
    CoolDown = 0xC2,
    /// Verdict for a pixel placement request
    PixelReturn = 0xC3,
    /// Verdict for a captcha solution
    CaptchaReturn = 0xC6,
    /// Client should refresh its view state
    Refresh = 0xC7,
    /// A fish appeared for this viewer
    FishAppears = 0xC8,
    /// A fish was caught by this viewer
    FishCatched = 0xC9,
}

impl Opcode {
    pub fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0xA0 => Ok(Self::RegCanvas),
            0xA1 => Ok(Self::RegChunk),
            0xA2 => Ok(Self::DeRegChunk),
            0xA3 => Ok(Self::RegMChunks),
            0xA4 => Ok(Self::DeRegMChunks),
            0xA6 => Ok(Self::ChangeMe),
            0xA7 => Ok(Self::OnlineCounter),
            0xB0 => Ok(Self::Ping),
            0xC1 => Ok(Self::PixelUpdate),
            0xC2 => Ok(Self::CoolDown),
            0xC3 => Ok(Self::PixelReturn),
            0xC6 => Ok(Self::CaptchaReturn),
            0xC7 => Ok(Self::Refresh),
            0xC8 => Ok(Self::FishAppears),
            0xC9 => Ok(Self::FishCatched),
            other => Err(ProtocolError::UnknownOpcode(other)),
        }
    }
}

/// Pack chunk coordinates into the 16-bit chunk id used on the wire.
pub fn pack_chunk_id(i: u8, j: u8) -> u16 {
    (u16::from(i) << 8) | u16::from(j)
}

/// Split a 16-bit chunk id back into `(i, j)`.
pub fn unpack_chunk_id(chunk_id: u16) -> (u8, u8) {
    ((chunk_id >> 8) as u8, (chunk_id & 0xFF) as u8)
}

/// One pixel cell within a chunk: linear offset plus palette index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelCell {
    pub offset: u16,
    pub color: u8,
}

impl PixelCell {
    /// Validating constructor; rejects values the wire cannot carry
    /// instead of truncating them.
    pub fn try_new(offset: u32, color: u32) -> Result<Self, ProtocolError> {
        if offset > u32::from(u16::MAX) {
            return Err(ProtocolError::OffsetOutOfRange(offset));
        }
        if color > u32::from(u8::MAX) {
            return Err(ProtocolError::ColorOutOfRange(color));
        }
        Ok(Self {
            offset: offset as u16,
            color: color as u8,
        })
    }
}

/// Viewer counts per canvas plus a deduplicated total.
///
/// Replaced wholesale on every update, never patched in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OnlineCounter {
    pub total: u16,
    pub per_canvas: BTreeMap<u8, u16>,
}

impl OnlineCounter {
    pub fn canvas(&self, canvas_id: u8) -> u16 {
        self.per_canvas.get(&canvas_id).copied().unwrap_or(0)
    }
}

/// Verdict for a pixel placement request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelReturn {
    /// 0 = accepted; nonzero codes are authority-specific rejections
    pub ret_code: u8,
    /// Remaining cooldown in milliseconds
    pub wait_ms: u32,
    /// Penalty seconds if all requested cells had been placed
    pub cool_down_s: i16,
    /// Number of cells actually placed
    pub pixel_count: u8,
}

/// A decoded binary frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    RegCanvas { canvas_id: u8 },
    RegChunk { chunk_id: u16 },
    DeRegChunk { chunk_id: u16 },
    RegMChunks { chunk_ids: Vec<u16> },
    DeRegMChunks { chunk_ids: Vec<u16> },
    ChangeMe,
    OnlineCounter(OnlineCounter),
    Ping,
    PixelUpdate { i: u8, j: u8, cells: Vec<PixelCell> },
    CoolDown { wait_ms: u32 },
    PixelReturn(PixelReturn),
    CaptchaReturn { ret_code: u8 },
    Refresh,
    FishAppears { fish_type: u8, size_kg: u16 },
    FishCatched { fish_type: u8, size_kg: u16 },
}

impl Packet {
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::RegCanvas { .. } => Opcode::RegCanvas,
            Self::RegChunk { .. } => Opcode::RegChunk,
            Self::DeRegChunk { .. } => Opcode::DeRegChunk,
            Self::RegMChunks { .. } => Opcode::RegMChunks,
            Self::DeRegMChunks { .. } => Opcode::DeRegMChunks,
            Self::ChangeMe => Opcode::ChangeMe,
            Self::OnlineCounter(_) => Opcode::OnlineCounter,
            Self::Ping => Opcode::Ping,
            Self::PixelUpdate { .. } => Opcode::PixelUpdate,
            Self::CoolDown { .. } => Opcode::CoolDown,
            Self::PixelReturn(_) => Opcode::PixelReturn,
            Self::CaptchaReturn { .. } => Opcode::CaptchaReturn,
            Self::Refresh => Opcode::Refresh,
            Self::FishAppears { .. } => Opcode::FishAppears,
            Self::FishCatched { .. } => Opcode::FishCatched,
        }
    }

    /// Serialize to the fixed wire layout. All multi-byte integers are
    /// big-endian. Range validation happens at construction time
    /// ([`PixelCell::try_new`]), so encoding itself cannot fail.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        buf.push(self.opcode() as u8);
        match self {
            Self::RegCanvas { canvas_id } => buf.push(*canvas_id),
            Self::RegChunk { chunk_id } | Self::DeRegChunk { chunk_id } => {
                buf.extend_from_slice(&chunk_id.to_be_bytes());
            }
            Self::RegMChunks { chunk_ids } | Self::DeRegMChunks { chunk_ids } => {
                // pad byte keeps the u16 cells 2-byte aligned
                buf.push(0);
                for id in chunk_ids {
                    buf.extend_from_slice(&id.to_be_bytes());
                }
            }
            Self::ChangeMe | Self::Ping | Self::Refresh => {}
            Self::OnlineCounter(counter) => {
                buf.extend_from_slice(&counter.total.to_be_bytes());
                for (canvas_id, count) in &counter.per_canvas {
                    buf.push(*canvas_id);
                    buf.extend_from_slice(&count.to_be_bytes());
                }
            }
            Self::PixelUpdate { i, j, cells } => {
                buf.push(*i);
                buf.push(*j);
                for cell in cells {
                    buf.extend_from_slice(&cell.offset.to_be_bytes());
                    buf.push(cell.color);
                }
            }
            Self::CoolDown { wait_ms } => buf.extend_from_slice(&wait_ms.to_be_bytes()),
            Self::PixelReturn(ret) => {
                buf.push(ret.ret_code);
                buf.extend_from_slice(&ret.wait_ms.to_be_bytes());
                buf.extend_from_slice(&ret.cool_down_s.to_be_bytes());
                buf.push(ret.pixel_count);
            }
            Self::CaptchaReturn { ret_code } => buf.push(*ret_code),
            Self::FishAppears { fish_type, size_kg }
            | Self::FishCatched { fish_type, size_kg } => {
                buf.push(*fish_type);
                buf.extend_from_slice(&size_kg.to_be_bytes());
            }
        }
        buf
    }

    /// Parse a binary frame. Rejects unknown opcodes, short payloads and
    /// trailing garbage.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(bytes);
        let opcode = Opcode::from_byte(r.u8()?)?;
        let packet = match opcode {
            Opcode::RegCanvas => Self::RegCanvas { canvas_id: r.u8()? },
            Opcode::RegChunk => Self::RegChunk { chunk_id: r.u16()? },
            Opcode::DeRegChunk => Self::DeRegChunk { chunk_id: r.u16()? },
            Opcode::RegMChunks => Self::RegMChunks {
                chunk_ids: r.chunk_list()?,
            },
            Opcode::DeRegMChunks => Self::DeRegMChunks {
                chunk_ids: r.chunk_list()?,
            },
            Opcode::ChangeMe => Self::ChangeMe,
            Opcode::OnlineCounter => {
                let total = r.u16()?;
                let mut per_canvas = BTreeMap::new();
                while !r.is_empty() {
                    let canvas_id = r.u8()?;
                    per_canvas.insert(canvas_id, r.u16()?);
                }
                Self::OnlineCounter(OnlineCounter { total, per_canvas })
            }
            Opcode::Ping => Self::Ping,
            Opcode::PixelUpdate => {
                let i = r.u8()?;
                let j = r.u8()?;
                let mut cells = Vec::new();
                while !r.is_empty() {
                    let offset = r.u16()?;
                    cells.push(PixelCell {
                        offset,
                        color: r.u8()?,
                    });
                }
                Self::PixelUpdate { i, j, cells }
            }
            Opcode::CoolDown => Self::CoolDown { wait_ms: r.u32()? },
            Opcode::PixelReturn => Self::PixelReturn(PixelReturn {
                ret_code: r.u8()?,
                wait_ms: r.u32()?,
                cool_down_s: r.i16()?,
                pixel_count: r.u8()?,
            }),
            Opcode::CaptchaReturn => Self::CaptchaReturn { ret_code: r.u8()? },
            Opcode::Refresh => Self::Refresh,
            Opcode::FishAppears => Self::FishAppears {
                fish_type: r.u8()?,
                size_kg: r.u16()?,
            },
            Opcode::FishCatched => Self::FishCatched {
                fish_type: r.u8()?,
                size_kg: r.u16()?,
            },
        };
        if !r.is_empty() {
            return Err(ProtocolError::TrailingBytes);
        }
        Ok(packet)
    }
}

/// Bounds-checked big-endian reader over a frame.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        let byte = *self.buf.get(self.pos).ok_or(ProtocolError::Truncated)?;
        self.pos += 1;
        Ok(byte)
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        Ok((u16::from(self.u8()?) << 8) | u16::from(self.u8()?))
    }

    fn i16(&mut self) -> Result<i16, ProtocolError> {
        Ok(self.u16()? as i16)
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        Ok((u32::from(self.u16()?) << 16) | u32::from(self.u16()?))
    }

    fn chunk_list(&mut self) -> Result<Vec<u16>, ProtocolError> {
        // skip the alignment pad
        self.u8()?;
        let mut ids = Vec::new();
        while !self.is_empty() {
            ids.push(self.u16()?);
        }
        Ok(ids)
    }
}

// ───────────────────────────────────────────────────────────────────
// Text protocol
// ───────────────────────────────────────────────────────────────────

/// A chat message as carried on the wire and on the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub name: String,
    pub user_id: u32,
    pub message: String,
    pub country: String,
    pub channel_id: u32,
}

/// Public chat channel, serialized as the `[id, name]` pair the channel
/// snapshot reply carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEntry(pub u32, pub String);

/// Split `"<tag>,<payload>"` without parsing the payload.
///
/// Only two ASCII-lowercase letters qualify as a tag, so JSON-array
/// messages (which also contain commas) never match.
pub fn split_tagged(message: &str) -> Option<(&str, &str)> {
    let comma = message.find(',')?;
    let tag = &message[..comma];
    if tag.len() == 2 && tag.bytes().all(|b| b.is_ascii_lowercase()) {
        Some((tag, &message[comma + 1..]))
    } else {
        None
    }
}

/// Encode the server-bound captcha solution: `cs,[solution, captchaId]`.
pub fn encode_captcha_solution(solution: &str, captcha_id: &str) -> String {
    format!("cs,{}", json!([solution, captcha_id]))
}

/// Parse the payload of a `cs` message into `(solution, captcha_id)`.
pub fn parse_captcha_solution(payload: &str) -> Result<(String, String), ProtocolError> {
    let value: Value =
        serde_json::from_str(payload).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let items = as_array(&value)?;
    if items.len() < 2 {
        return Err(ProtocolError::Malformed("captcha solution too short".into()));
    }
    Ok((as_string(&items[0])?, as_string(&items[1])?))
}

/// Client-bound text traffic: tagged messages plus the JSON-array replies.
#[derive(Debug, Clone, PartialEq)]
pub enum TextMessage {
    /// `cm` — chat message
    Chat(ChatMessage),
    /// `ct` — typing indicator
    Typing {
        name: String,
        channel_id: u32,
        user_id: u32,
        is_typing: bool,
    },
    /// `an` — announcement
    Announcement { text: String, sent_at: u64, by: String },
    /// `ac` — chat channel became available
    ChannelAdded(ChannelEntry),
    /// `rc` — chat channel was removed
    ChannelRemoved { channel_id: u32 },
    /// `["chans", …]` — snapshot of all public channels
    ChannelList(Vec<ChannelEntry>),
    /// `["reloadUser", …]` — a user must be re-fetched
    UserReload { user_id: u32 },
    /// `["retpxl", …]` — verdict for an API `setpxl` command
    PixelVerdict {
        success: bool,
        wait_ms: u32,
        cool_down_s: i16,
    },
}

impl TextMessage {
    pub fn encode(&self) -> String {
        match self {
            Self::Chat(m) => format!(
                "cm,{}",
                json!([m.name, m.user_id, m.message, m.country, m.channel_id])
            ),
            Self::Typing {
                name,
                channel_id,
                user_id,
                is_typing,
            } => format!("ct,{}", json!([name, channel_id, user_id, is_typing])),
            Self::Announcement { text, sent_at, by } => {
                format!("an,{}", json!([text, sent_at, by]))
            }
            Self::ChannelAdded(entry) => format!("ac,{}", json!([entry.0, entry.1])),
            Self::ChannelRemoved { channel_id } => format!("rc,{}", json!([channel_id])),
            Self::ChannelList(entries) => {
                let mut items = vec![Value::from("chans")];
                for entry in entries {
                    items.push(json!([entry.0, entry.1]));
                }
                Value::Array(items).to_string()
            }
            Self::UserReload { user_id } => json!(["reloadUser", user_id]).to_string(),
            Self::PixelVerdict {
                success,
                wait_ms,
                cool_down_s,
            } => json!(["retpxl", null, null, success, wait_ms, cool_down_s]).to_string(),
        }
    }

    pub fn parse(message: &str) -> Result<Self, ProtocolError> {
        if message.starts_with('[') {
            return Self::parse_array(message);
        }
        let (tag, payload) =
            split_tagged(message).ok_or_else(|| ProtocolError::Malformed("missing tag".into()))?;
        let value: Value =
            serde_json::from_str(payload).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let items = as_array(&value)?;
        match tag {
            "cm" => {
                expect_len(items, 5)?;
                Ok(Self::Chat(ChatMessage {
                    name: as_string(&items[0])?,
                    user_id: as_u32(&items[1])?,
                    message: as_string(&items[2])?,
                    country: as_string(&items[3])?,
                    channel_id: as_u32(&items[4])?,
                }))
            }
            "ct" => {
                expect_len(items, 4)?;
                Ok(Self::Typing {
                    name: as_string(&items[0])?,
                    channel_id: as_u32(&items[1])?,
                    user_id: as_u32(&items[2])?,
                    is_typing: as_bool(&items[3])?,
                })
            }
            "an" => {
                expect_len(items, 3)?;
                Ok(Self::Announcement {
                    text: as_string(&items[0])?,
                    sent_at: as_u64(&items[1])?,
                    by: as_string(&items[2])?,
                })
            }
            "ac" => {
                expect_len(items, 2)?;
                Ok(Self::ChannelAdded(ChannelEntry(
                    as_u32(&items[0])?,
                    as_string(&items[1])?,
                )))
            }
            "rc" => {
                expect_len(items, 1)?;
                Ok(Self::ChannelRemoved {
                    channel_id: as_u32(&items[0])?,
                })
            }
            other => Err(ProtocolError::UnknownTag(other.to_string())),
        }
    }

    fn parse_array(message: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(message).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let items = as_array(&value)?;
        let verb = items
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::Malformed("missing verb".into()))?;
        match verb {
            "chans" => {
                let mut entries = Vec::with_capacity(items.len() - 1);
                for item in &items[1..] {
                    let pair = as_array(item)?;
                    expect_len(pair, 2)?;
                    entries.push(ChannelEntry(as_u32(&pair[0])?, as_string(&pair[1])?));
                }
                Ok(Self::ChannelList(entries))
            }
            "reloadUser" => {
                expect_len(items, 2)?;
                Ok(Self::UserReload {
                    user_id: as_u32(&items[1])?,
                })
            }
            "retpxl" => {
                expect_len(items, 6)?;
                Ok(Self::PixelVerdict {
                    success: as_bool(&items[3])?,
                    wait_ms: as_u32(&items[4])?,
                    cool_down_s: as_i64(&items[5])? as i16,
                })
            }
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }
}

/// Server-bound JSON-array commands.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerCommand {
    /// `["sub", <channel>]` — the raw channel name is kept so unknown
    /// names can be logged and ignored
    Sub(String),
    /// `["setpxl", actor, ip, x, y, color]`
    SetPixel {
        actor: Option<String>,
        ip: Option<String>,
        x: i64,
        y: i64,
        color: u8,
    },
    /// `["chat", name, id, message, country, channelId]`
    Chat(ChatMessage),
    /// `["setcdfactor", country, factor|null, endTimeMs|null]`
    SetCooldownFactor {
        country: String,
        factor: Option<f64>,
        end_time_ms: Option<u64>,
    },
}

impl ServerCommand {
    pub fn encode(&self) -> String {
        match self {
            Self::Sub(channel) => json!(["sub", channel]).to_string(),
            Self::SetPixel {
                actor,
                ip,
                x,
                y,
                color,
            } => json!(["setpxl", actor, ip, x, y, color]).to_string(),
            Self::Chat(m) => {
                json!(["chat", m.name, m.user_id, m.message, m.country, m.channel_id]).to_string()
            }
            Self::SetCooldownFactor {
                country,
                factor,
                end_time_ms,
            } => json!(["setcdfactor", country, factor, end_time_ms]).to_string(),
        }
    }

    pub fn parse(message: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(message).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let items = as_array(&value)?;
        let verb = items
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::Malformed("missing verb".into()))?;
        match verb {
            "sub" => {
                expect_len(items, 2)?;
                Ok(Self::Sub(as_string(&items[1])?))
            }
            "setpxl" => {
                expect_len(items, 6)?;
                let color = as_u64(&items[5])?;
                // the pixel authority palette caps at 32 entries
                if color > 32 {
                    return Err(ProtocolError::ColorOutOfRange(color as u32));
                }
                Ok(Self::SetPixel {
                    actor: as_opt_string(&items[1])?,
                    ip: as_opt_string(&items[2])?,
                    x: as_i64(&items[3])?,
                    y: as_i64(&items[4])?,
                    color: color as u8,
                })
            }
            "chat" => {
                expect_len(items, 6)?;
                Ok(Self::Chat(ChatMessage {
                    name: as_string(&items[1])?,
                    user_id: as_u32(&items[2])?,
                    message: as_string(&items[3])?,
                    country: as_string(&items[4])?,
                    channel_id: as_u32(&items[5])?,
                }))
            }
            "setcdfactor" => {
                expect_len(items, 4)?;
                Ok(Self::SetCooldownFactor {
                    country: as_string(&items[1])?,
                    factor: if items[2].is_null() {
                        None
                    } else {
                        Some(as_f64(&items[2])?)
                    },
                    end_time_ms: if items[3].is_null() {
                        None
                    } else {
                        Some(as_u64(&items[3])?)
                    },
                })
            }
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }
}

fn as_array(value: &Value) -> Result<&Vec<Value>, ProtocolError> {
    value
        .as_array()
        .ok_or_else(|| ProtocolError::Malformed("expected array".into()))
}

fn expect_len(items: &[Value], len: usize) -> Result<(), ProtocolError> {
    if items.len() == len {
        Ok(())
    } else {
        Err(ProtocolError::Malformed(format!(
            "expected {len} elements, got {}",
            items.len()
        )))
    }
}

fn as_string(value: &Value) -> Result<String, ProtocolError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| ProtocolError::Malformed("expected string".into()))
}

fn as_opt_string(value: &Value) -> Result<Option<String>, ProtocolError> {
    if value.is_null() {
        Ok(None)
    } else {
        as_string(value).map(Some)
    }
}

fn as_u64(value: &Value) -> Result<u64, ProtocolError> {
    value
        .as_u64()
        .ok_or_else(|| ProtocolError::Malformed("expected unsigned integer".into()))
}

fn as_u32(value: &Value) -> Result<u32, ProtocolError> {
    u32::try_from(as_u64(value)?)
        .map_err(|_| ProtocolError::Malformed("integer out of range".into()))
}

fn as_i64(value: &Value) -> Result<i64, ProtocolError> {
    value
        .as_i64()
        .ok_or_else(|| ProtocolError::Malformed("expected integer".into()))
}

fn as_f64(value: &Value) -> Result<f64, ProtocolError> {
    value
        .as_f64()
        .ok_or_else(|| ProtocolError::Malformed("expected number".into()))
}

fn as_bool(value: &Value) -> Result<bool, ProtocolError> {
    value
        .as_bool()
        .ok_or_else(|| ProtocolError::Malformed("expected bool".into()))
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    UnknownOpcode(u8),
    UnknownTag(String),
    UnknownCommand(String),
    Truncated,
    TrailingBytes,
    OffsetOutOfRange(u32),
    ColorOutOfRange(u32),
    Malformed(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownOpcode(op) => write!(f, "unknown opcode 0x{op:02X}"),
            Self::UnknownTag(tag) => write!(f, "unknown text tag {tag}"),
            Self::UnknownCommand(verb) => write!(f, "unknown command {verb}"),
            Self::Truncated => write!(f, "frame too short"),
            Self::TrailingBytes => write!(f, "trailing bytes after frame"),
            Self::OffsetOutOfRange(offset) => write!(f, "pixel offset {offset} out of range"),
            Self::ColorOutOfRange(color) => write!(f, "color index {color} out of range"),
            Self::Malformed(reason) => write!(f, "malformed message: {reason}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_id_packing() {
        assert_eq!(pack_chunk_id(0x12, 0x34), 0x1234);
        assert_eq!(unpack_chunk_id(0x1234), (0x12, 0x34));
        for id in [0u16, 1, 0x00FF, 0xFF00, 0xFFFF] {
            let (i, j) = unpack_chunk_id(id);
            assert_eq!(pack_chunk_id(i, j), id);
        }
    }

    #[test]
    fn test_pixel_update_roundtrip() {
        let cells = vec![
            PixelCell { offset: 0, color: 0 },
            PixelCell {
                offset: 513,
                color: 12,
            },
            PixelCell {
                offset: u16::MAX,
                color: u8::MAX,
            },
        ];
        let packet = Packet::PixelUpdate { i: 3, j: 7, cells };
        let encoded = packet.encode();
        assert_eq!(encoded[0], Opcode::PixelUpdate as u8);
        assert_eq!(encoded.len(), 3 + 3 * 3);
        assert_eq!(Packet::decode(&encoded).unwrap(), packet);
    }

    #[test]
    fn test_pixel_update_empty_roundtrip() {
        let packet = Packet::PixelUpdate {
            i: 0,
            j: 0,
            cells: Vec::new(),
        };
        assert_eq!(Packet::decode(&packet.encode()).unwrap(), packet);
    }

    #[test]
    fn test_pixel_cell_rejects_out_of_range() {
        assert_eq!(
            PixelCell::try_new(70_000, 0),
            Err(ProtocolError::OffsetOutOfRange(70_000))
        );
        assert_eq!(
            PixelCell::try_new(0, 300),
            Err(ProtocolError::ColorOutOfRange(300))
        );
        assert!(PixelCell::try_new(65_535, 255).is_ok());
    }

    #[test]
    fn test_online_counter_roundtrip() {
        let mut per_canvas = BTreeMap::new();
        per_canvas.insert(0, 120);
        per_canvas.insert(7, 3);
        let packet = Packet::OnlineCounter(OnlineCounter {
            total: 123,
            per_canvas,
        });
        assert_eq!(Packet::decode(&packet.encode()).unwrap(), packet);
    }

    #[test]
    fn test_pixel_return_roundtrip() {
        let packet = Packet::PixelReturn(PixelReturn {
            ret_code: 2,
            wait_ms: 90_000,
            cool_down_s: -15,
            pixel_count: 4,
        });
        assert_eq!(Packet::decode(&packet.encode()).unwrap(), packet);
    }

    #[test]
    fn test_registration_roundtrips() {
        for packet in [
            Packet::RegCanvas { canvas_id: 5 },
            Packet::RegChunk { chunk_id: 0xABCD },
            Packet::DeRegChunk { chunk_id: 1 },
            Packet::RegMChunks {
                chunk_ids: vec![1, 2, 0xFFFF],
            },
            Packet::DeRegMChunks { chunk_ids: vec![] },
        ] {
            assert_eq!(Packet::decode(&packet.encode()).unwrap(), packet);
        }
    }

    #[test]
    fn test_bare_opcode_roundtrips() {
        for packet in [
            Packet::ChangeMe,
            Packet::Ping,
            Packet::Refresh,
            Packet::CoolDown { wait_ms: 12_500 },
            Packet::CaptchaReturn { ret_code: 1 },
            Packet::FishAppears {
                fish_type: 3,
                size_kg: 40,
            },
            Packet::FishCatched {
                fish_type: 3,
                size_kg: 40,
            },
        ] {
            assert_eq!(Packet::decode(&packet.encode()).unwrap(), packet);
        }
    }

    #[test]
    fn test_ping_is_one_byte() {
        assert_eq!(Packet::Ping.encode(), vec![0xB0]);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_eq!(Packet::decode(&[]), Err(ProtocolError::Truncated));
        assert_eq!(Packet::decode(&[0xFF]), Err(ProtocolError::UnknownOpcode(0xFF)));
        // truncated pixel cell
        assert_eq!(
            Packet::decode(&[Opcode::PixelUpdate as u8, 0, 0, 0x01]),
            Err(ProtocolError::Truncated)
        );
        // trailing byte after a fixed frame
        assert_eq!(
            Packet::decode(&[Opcode::ChangeMe as u8, 0]),
            Err(ProtocolError::TrailingBytes)
        );
    }

    #[test]
    fn test_opcode_values() {
        assert_eq!(Opcode::RegCanvas as u8, 0xA0);
        assert_eq!(Opcode::OnlineCounter as u8, 0xA7);
        assert_eq!(Opcode::Ping as u8, 0xB0);
        assert_eq!(Opcode::PixelUpdate as u8, 0xC1);
        assert_eq!(Opcode::CoolDown as u8, 0xC2);
        assert_eq!(Opcode::PixelReturn as u8, 0xC3);
        assert_eq!(Opcode::CaptchaReturn as u8, 0xC6);
        assert_eq!(Opcode::FishCatched as u8, 0xC9);
    }

    #[test]
    fn test_split_tagged() {
        assert_eq!(split_tagged("cm,[1,2]"), Some(("cm", "[1,2]")));
        assert_eq!(split_tagged("an,[\"a,b\"]"), Some(("an", "[\"a,b\"]")));
        // JSON arrays contain commas but never a two-letter prefix
        assert_eq!(split_tagged("[\"sub\",\"chat\"]"), None);
        assert_eq!(split_tagged("nocomma"), None);
    }

    #[test]
    fn test_chat_message_roundtrip() {
        let msg = TextMessage::Chat(ChatMessage {
            name: "ada".into(),
            user_id: 99,
            message: "hello, world".into(),
            country: "de".into(),
            channel_id: 1,
        });
        let encoded = msg.encode();
        assert!(encoded.starts_with("cm,"));
        assert_eq!(TextMessage::parse(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_tagged_roundtrips() {
        for msg in [
            TextMessage::Typing {
                name: "ada".into(),
                channel_id: 2,
                user_id: 7,
                is_typing: true,
            },
            TextMessage::Announcement {
                text: "maintenance at noon".into(),
                sent_at: 1_700_000_000_000,
                by: "mod".into(),
            },
            TextMessage::ChannelAdded(ChannelEntry(4, "int".into())),
            TextMessage::ChannelRemoved { channel_id: 4 },
        ] {
            assert_eq!(TextMessage::parse(&msg.encode()).unwrap(), msg);
        }
    }

    #[test]
    fn test_array_reply_roundtrips() {
        for msg in [
            TextMessage::ChannelList(vec![
                ChannelEntry(0, "en".into()),
                ChannelEntry(1, "de".into()),
            ]),
            TextMessage::ChannelList(Vec::new()),
            TextMessage::UserReload { user_id: 123 },
            TextMessage::PixelVerdict {
                success: true,
                wait_ms: 0,
                cool_down_s: 0,
            },
            TextMessage::PixelVerdict {
                success: false,
                wait_ms: 12_000,
                cool_down_s: -30,
            },
        ] {
            assert_eq!(TextMessage::parse(&msg.encode()).unwrap(), msg);
        }
    }

    #[test]
    fn test_server_command_roundtrips() {
        for cmd in [
            ServerCommand::Sub("pxl".into()),
            ServerCommand::SetPixel {
                actor: None,
                ip: None,
                x: -12,
                y: 4096,
                color: 32,
            },
            ServerCommand::Chat(ChatMessage {
                name: "bridge".into(),
                user_id: 0,
                message: "hi".into(),
                country: "xx".into(),
                channel_id: 0,
            }),
            ServerCommand::SetCooldownFactor {
                country: "de".into(),
                factor: Some(0.5),
                end_time_ms: Some(1_700_000_123_000),
            },
            ServerCommand::SetCooldownFactor {
                country: "de".into(),
                factor: None,
                end_time_ms: None,
            },
        ] {
            assert_eq!(ServerCommand::parse(&cmd.encode()).unwrap(), cmd);
        }
    }

    #[test]
    fn test_setpxl_rejects_out_of_range_color() {
        let raw = "[\"setpxl\",null,null,10,10,33]";
        assert_eq!(
            ServerCommand::parse(raw),
            Err(ProtocolError::ColorOutOfRange(33))
        );
    }

    #[test]
    fn test_unknown_command_and_tag() {
        assert!(matches!(
            ServerCommand::parse("[\"dance\"]"),
            Err(ProtocolError::UnknownCommand(_))
        ));
        assert!(matches!(
            TextMessage::parse("zz,[1]"),
            Err(ProtocolError::UnknownTag(_))
        ));
    }

    #[test]
    fn test_captcha_solution_roundtrip() {
        let encoded = encode_captcha_solution("A5K9", "cap-1");
        let (tag, payload) = split_tagged(&encoded).unwrap();
        assert_eq!(tag, "cs");
        assert_eq!(
            parse_captcha_solution(payload).unwrap(),
            ("A5K9".to_string(), "cap-1".to_string())
        );
    }
}
