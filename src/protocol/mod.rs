//! Wire protocol: length-prefixed JSON frames and stream reassembly.

pub mod buffer;
pub mod codec;

pub use buffer::{ReadState, ReassemblyBuffer};
pub use codec::{decode, decode_body, encode, encode_into, Frame, Request, Response, HEADER_LEN};
