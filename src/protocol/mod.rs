//! Wire protocol for treesync.
//!
//! Every frame is a one-byte type ID followed by a type-specific body.
//!
//! # Layers
//!
//! ```text
//! codec    primitives (bool, u8 length, u32 BE, raw string) + deadline-bounded I/O
//! packet   Login / RequestFile / SendFile / Logout bodies
//! channel  type-ID header, dispatch to the matching decoder
//! ```

pub mod channel;
pub mod codec;
pub mod packet;

pub use channel::{FrameReader, FrameWriter, FramedChannel};
pub use codec::{WireReader, WireWriter};
pub use packet::{Login, Logout, Packet, PacketType, RequestFile, SendFile, CHUNK_SIZE};
