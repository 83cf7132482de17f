//! Trunkline wire protocol: frame codec, payload reader/writer, status bytes.
//!
//! Everything in this crate is synchronous and I/O-free; the runtime crate
//! layers socket handling on top of it.

pub mod error;
pub mod frame;
pub mod status;
pub mod wire;

pub use error::{ProtoError, Result};
pub use frame::{Frame, FrameDecoder, FrameHeader, FrameType, HEADER_LEN, MAX_PAYLOAD_LEN, REQUEST_ID_LEN};
pub use status::InitialStatus;
pub use wire::{PayloadReader, PayloadWriter};
