#![forbid(unsafe_code)]

//! Wire protocol between keywarden clients and the key service.
//!
//! Every call is one request frame followed by one response frame on the
//! same stream. Frames are a u32 big-endian length prefix and a bincode
//! payload; the same codec runs over TLS TCP sockets and the local operator
//! socket.

pub mod codec;
pub mod message;

pub use codec::{read_frame, read_frame_async, write_frame, write_frame_async, MAX_FRAME_LEN};
pub use message::{
    CreateKeyRequest, Request, Response, RetrieveResponse, RpcError, RpcErrorKind,
};
