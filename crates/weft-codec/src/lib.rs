//! # weft-codec
//!
//! Framing: 4-byte big-endian payload length + 1 flags byte + payload.
//!
//! Flag bits (LSB first): bit 0 = compressed, bits 1–2 = serialization
//! format (`00` = MessagePack, `01` = JSON, `10`/`11` reserved), bits 3–7
//! reserved and must be zero. Both formats are self-describing, so a single
//! stream may mix them frame by frame; each frame carries its own format
//! bits.

pub mod frame;

pub use frame::{
    Codec, Compression, Decoded, FrameDecoder, HEADER_LEN, MAX_FRAME_PAYLOAD, WireFormat,
};
