//! # Wire Constants
//!
//! Field widths, header sizes and reserved values of the cluster frame
//! layout. These values are the bit-exact contract between peers and must
//! never change without a protocol revision on both sides.

/// Width of the leading length field
pub const LENGTH_FIELD_SIZE: usize = 4;
/// Width of the request/response type tag
pub const TYPE_TAG_SIZE: usize = 1;
/// Width of the module number
pub const MODULE_SIZE: usize = 4;
/// Width of the command number
pub const CMD_SIZE: usize = 4;
/// Fixed on-wire width of the session id (a UUID string)
pub const SESSION_ID_SIZE: usize = 36;
/// Width of the response code (responses only)
pub const CODE_SIZE: usize = 4;

/// Full request header including the length field: 4 + 1 + 4 + 4 + 36 = 49
pub const REQUEST_HEADER_SIZE: usize =
    LENGTH_FIELD_SIZE + TYPE_TAG_SIZE + MODULE_SIZE + CMD_SIZE + SESSION_ID_SIZE;

/// Full response header including the length field: 49 + 4 = 53
pub const RESPONSE_HEADER_SIZE: usize = REQUEST_HEADER_SIZE + CODE_SIZE;

/// Bytes following the tag that every request must carry
pub const REQUEST_FIXED_BODY: usize = MODULE_SIZE + CMD_SIZE + SESSION_ID_SIZE;

/// Bytes following the tag that every response must carry
pub const RESPONSE_FIXED_BODY: usize = REQUEST_FIXED_BODY + CODE_SIZE;

/// Type tag of a request frame
pub const TYPE_TAG_REQUEST: u8 = 0;
/// Type tag of a response frame
pub const TYPE_TAG_RESPONSE: u8 = 1;

/// Byte used to right-pad short session ids
pub const SESSION_ID_PAD: u8 = b' ';

/// Reserved heartbeat module number
pub const HEARTBEAT_MODULE: u32 = 0;
/// Reserved heartbeat command number
pub const HEARTBEAT_CMD: u32 = 0;
/// Session id carried by every heartbeat request
pub const HEARTBEAT_SESSION_ID: &str = "heartbeat";

/// Response code for success
pub const CODE_OK: u32 = 0;
/// Response code when the receiving side could not dispatch the request
pub const CODE_DISPATCH_FAILED: u32 = 1;

/// Largest accepted value of the length field unless a caller overrides it
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB
