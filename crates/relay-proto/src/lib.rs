//! Wire protocol for the relay server.
//!
//! Three pieces, leaves first: [`frame`] reads/writes length-prefixed JSON
//! frames on any async byte stream; [`message`] defines the typed envelope
//! for every message that can appear in a frame; [`error`] defines the error
//! taxonomy those envelopes carry. None of this crate knows about sockets,
//! registries, or scheduling — that's `relay`'s job.

pub mod error;
pub mod frame;
pub mod message;

pub use error::{ErrorCode, ErrorInfo};
pub use frame::{read_frame, write_frame, FrameError, MAX_PAYLOAD_BYTES};
pub use message::{
    generate_request_id, InstanceStatus, InstanceSummary, InstancesData, Message, PROTOCOL_VERSION,
};
