pub mod frame;
pub mod parser;
pub mod primitive;
pub mod request;
pub mod response;
pub mod row;

pub use frame::{FrameDecoder, FrameHeader};
pub use parser::{ResponseItem, StreamingParser};
