//! 组成客户端处理器链的具体处理器。

mod application;
mod codec;
mod idle;

pub use application::{ApplicationHandler, MessageHandler};
pub use codec::{FrameDecoderHandler, FrameEncoder};
pub use idle::{HeartbeatTrigger, IdleStateChecker};
