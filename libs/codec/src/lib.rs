//! # Trellis Wire Codec
//!
//! ## Purpose
//!
//! Encoding and decoding rules for the frames exchanged between cluster peers.
//! Every frame is a big-endian, fixed-layout header followed by an opaque
//! payload:
//!
//! ```text
//! ┌────────┬─────┬────────┬─────┬────────────┬──────────┬─────────┐
//! │ Length │ Tag │ Module │ Cmd │ SessionId  │ Code     │ Payload │
//! │ 4B     │ 1B  │ 4B     │ 4B  │ 36B        │ 4B (rsp) │ N       │
//! └────────┴─────┴────────┴─────┴────────────┴──────────┴─────────┘
//! ```
//!
//! `Length` counts every byte after itself. `Tag` is 0 for requests and 1 for
//! responses; only responses carry `Code`.
//!
//! ## What This Crate Contains
//! - [`RequestFrame`], [`ResponseFrame`] and the [`Frame`] union
//! - Buffer encoding ([`builder`]) and buffer/stream decoding ([`parser`])
//! - Heartbeat constants and helpers
//! - [`ProtocolError`] for malformed or truncated input
//!
//! ## What This Crate Does NOT Contain
//! - Socket management, pooling or reconnection (belongs in `trellis-cluster`)
//! - Request/response correlation; the session id is carried but never interpreted
//!
//! ## Architecture Role
//!
//! ```text
//! application payload → [trellis-codec] → trellis-cluster
//!                          ↓                    ↓
//!                      Frame layout         TCP connections
//!                      Heartbeat rules      Pools, routers
//! ```

pub mod builder;
pub mod constants;
pub mod error;
pub mod frame;
pub mod parser;

pub use builder::{encode_request, encode_response};
pub use constants::*;
pub use error::{ProtocolError, ProtocolResult};
pub use frame::{is_heartbeat, Frame, FrameType, RequestFrame, ResponseFrame};
pub use parser::{decode, decode_with_limit, read_frame, write_frame};
