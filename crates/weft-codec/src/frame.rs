use serde::{Deserialize, Serialize};

use weft_core::{Envelope, Result, WeftError};

/// Header size: 4-byte big-endian payload length + 1 flags byte.
pub const HEADER_LEN: usize = 5;

/// Hard cap on the serialized payload of a single frame.
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024 * 1024;

const FLAG_COMPRESSED: u8 = 0b0000_0001;
const FORMAT_SHIFT: u8 = 1;
const FORMAT_MASK: u8 = 0b0000_0110;
const RESERVED_MASK: u8 = 0b1111_1000;

/// Serialization format of one frame's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// MessagePack, the compact default.
    Binary,
    /// JSON, for interop and debugging.
    Json,
}

impl WireFormat {
    fn bits(self) -> u8 {
        match self {
            WireFormat::Binary => 0b00,
            WireFormat::Json => 0b01,
        }
    }

    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0b00 => Some(WireFormat::Binary),
            0b01 => Some(WireFormat::Json),
            _ => None,
        }
    }
}

/// Compression policy. Holding a `Compression` activates the decode path for
/// compressed frames; `threshold` additionally enables compression on encode
/// for payloads strictly larger than it (`None` = never compress, the
/// default).
#[derive(Debug, Clone)]
pub struct Compression {
    pub threshold: Option<usize>,
    pub level: i32,
}

impl Default for Compression {
    fn default() -> Self {
        Self {
            threshold: None,
            level: 0,
        }
    }
}

/// One decoded frame plus how many buffered bytes it consumed.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub envelope: Envelope,
    pub consumed: usize,
}

/// Stateless encode/decode of single frames.
#[derive(Debug, Clone)]
pub struct Codec {
    format: WireFormat,
    compression: Option<Compression>,
}

impl Codec {
    pub fn new(format: WireFormat) -> Self {
        Self {
            format,
            compression: None,
        }
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = Some(compression);
        self
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Serialize the whole envelope into one frame.
    pub fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        envelope.validate()?;

        let body = match self.format {
            WireFormat::Json => serde_json::to_vec(envelope)?,
            WireFormat::Binary => rmp_serde::to_vec_named(envelope)
                .map_err(|e| WeftError::FrameEncode(e.to_string()))?,
        };

        let (body, compressed) = match &self.compression {
            Some(c) if c.threshold.is_some_and(|t| body.len() > t) => {
                (zstd::stream::encode_all(&body[..], c.level)?, true)
            }
            _ => (body, false),
        };

        if body.len() > MAX_FRAME_PAYLOAD {
            return Err(WeftError::FrameTooLarge {
                len: body.len(),
                max: MAX_FRAME_PAYLOAD,
            });
        }

        let mut flags = self.format.bits() << FORMAT_SHIFT;
        if compressed {
            flags |= FLAG_COMPRESSED;
        }

        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.push(flags);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when the buffer holds less than a full frame (the
    /// caller should read more), otherwise the envelope and the exact number
    /// of bytes consumed. Never consumes more bytes than it reports.
    pub fn decode(&self, buf: &[u8]) -> Result<Option<Decoded>> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len > MAX_FRAME_PAYLOAD {
            return Err(WeftError::FrameTooLarge {
                len,
                max: MAX_FRAME_PAYLOAD,
            });
        }
        let flags = buf[4];
        if flags & RESERVED_MASK != 0 {
            return Err(WeftError::FrameDecode("reserved flag bits set".into()));
        }
        if buf.len() < HEADER_LEN + len {
            return Ok(None);
        }
        let payload = &buf[HEADER_LEN..HEADER_LEN + len];

        let body: Vec<u8>;
        let bytes = if flags & FLAG_COMPRESSED != 0 {
            if self.compression.is_none() {
                return Err(WeftError::CompressedFrameUnsupported);
            }
            body = zstd::stream::decode_all(payload)?;
            if body.len() > MAX_FRAME_PAYLOAD {
                return Err(WeftError::FrameTooLarge {
                    len: body.len(),
                    max: MAX_FRAME_PAYLOAD,
                });
            }
            &body[..]
        } else {
            payload
        };

        let format = WireFormat::from_bits((flags & FORMAT_MASK) >> FORMAT_SHIFT)
            .ok_or_else(|| WeftError::FrameDecode("reserved format bits".into()))?;
        let envelope: Envelope = match format {
            WireFormat::Json => serde_json::from_slice(bytes)?,
            WireFormat::Binary => {
                rmp_serde::from_slice(bytes).map_err(|e| WeftError::FrameDecode(e.to_string()))?
            }
        };
        envelope.validate()?;

        Ok(Some(Decoded {
            envelope,
            consumed: HEADER_LEN + len,
        }))
    }
}

/// Streaming decoder: owns a growing byte buffer fed by the transport and
/// yields complete envelopes in arrival order. A partial trailing frame
/// stays buffered until more bytes arrive.
#[derive(Debug)]
pub struct FrameDecoder {
    codec: Codec,
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new(codec: Codec) -> Self {
        Self {
            codec,
            buf: Vec::new(),
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Decode the next complete frame, draining exactly the bytes it
    /// occupied. `Ok(None)` means more input is needed.
    pub fn next_frame(&mut self) -> Result<Option<Envelope>> {
        match self.codec.decode(&self.buf)? {
            Some(decoded) => {
                self.buf.drain(..decoded.consumed);
                Ok(Some(decoded.envelope))
            }
            None => Ok(None),
        }
    }

    /// Bytes currently buffered (a partial frame, between reads).
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}
