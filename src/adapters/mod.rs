/// 协议适配器实现模块
///
/// 此模块包含各种传输协议的具体适配器实现，每个适配器都实现
/// [`ByteStream`](crate::stream::ByteStream)

pub mod tcp;
pub mod quic;
pub mod websocket;

pub use tcp::StreamSocket;
pub use quic::{QuicError, SessionStream};
pub use websocket::{MessageStream, WebSocketError};
