pub(crate) mod content;
#[allow(clippy::module_inception)]
mod message;
pub(crate) mod parse;
mod stream;

pub use content::{MessageContent, Q2UnblockHandler};
pub use message::{
    FieldReader, Message, MessageField, RaStrip, ReceiveOutcome, RouterNode, SendOutcome,
};
pub use parse::{Depth, DepthStatus};
pub use stream::{StreamData, StreamDataResult};
