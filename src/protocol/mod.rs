//! Protocol module - the wire envelope and the frame codec.
//!
//! One envelope per frame: `<u32 little-endian length><UTF-8 JSON body>`.
//! See [`PipeMessage`] for the envelope fields and construction rules.

mod framing;
mod message;

pub use framing::{read_frame, write_frame, LENGTH_PREFIX_SIZE};
pub use message::{message_type, ErrorResponse, PipeMessage, RegisterWorkerRequest};
