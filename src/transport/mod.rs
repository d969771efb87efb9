/// 传输层：监听端和拨号端
///
/// 两者都按 [`TransportKind`](crate::protocol::TransportKind) 分派到具体适配器，
/// 对外只暴露 [`ByteStream`](crate::stream::ByteStream)。

pub mod dialer;
pub mod listener;

pub use dialer::DialerBack;
pub use listener::{Inbound, ListenerFront};
