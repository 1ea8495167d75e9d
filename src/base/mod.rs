//! Base types and error handling.
//!
//! Provides foundational types mirroring Chromium's `net/base/`:
//! - [`NetError`](neterror::NetError): Network error codes matching `net_error_list.h`
//! - [`LoadState`](loadstate::LoadState): Request loading states from `load_states_list.h`
//! - [`ByteBuffer`](buffer::ByteBuffer): the position/limit buffer used by reads and writes

pub mod buffer;
pub mod context;
pub mod loadstate;
pub mod neterror;

pub use buffer::ByteBuffer;
pub use loadstate::{LoadState, RequestStatus};
pub use neterror::{BoxError, ErrorCode, NetError};
