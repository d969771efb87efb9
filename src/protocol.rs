/// Transport kinds and the supported relay routes

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::TransportError;

/// Transport spoken on one side of the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Raw stream socket
    Tcp,
    /// One bidirectional stream inside a QUIC connection
    Quic,
    /// Binary WebSocket messages
    #[serde(rename = "ws")]
    WebSocket,
}

impl TransportKind {
    pub const ALL: [TransportKind; 3] = [TransportKind::Tcp, TransportKind::Quic, TransportKind::WebSocket];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Quic => "quic",
            TransportKind::WebSocket => "ws",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" | "stream-socket" => Ok(TransportKind::Tcp),
            "quic" | "session-stream" => Ok(TransportKind::Quic),
            "ws" | "websocket" | "message-channel" => Ok(TransportKind::WebSocket),
            other => Err(TransportError::config_error(
                "transport",
                format!("unknown transport '{}', expected one of tcp, quic, ws", other),
            )),
        }
    }
}

/// A supported (listen, remote) pairing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    TcpToWebSocket,
    TcpToQuic,
    QuicToWebSocket,
    QuicToTcp,
    WebSocketToTcp,
}

impl Route {
    pub const ALL: [Route; 5] = [
        Route::TcpToWebSocket,
        Route::TcpToQuic,
        Route::QuicToWebSocket,
        Route::QuicToTcp,
        Route::WebSocketToTcp,
    ];

    /// Resolve a transport pair against the compatibility matrix
    pub fn resolve(listen: TransportKind, remote: TransportKind) -> Result<Route, TransportError> {
        use TransportKind::*;

        match (listen, remote) {
            (Tcp, WebSocket) => Ok(Route::TcpToWebSocket),
            (Tcp, Quic) => Ok(Route::TcpToQuic),
            (Quic, WebSocket) => Ok(Route::QuicToWebSocket),
            (Quic, Tcp) => Ok(Route::QuicToTcp),
            (WebSocket, Tcp) => Ok(Route::WebSocketToTcp),
            (Tcp, Tcp) | (WebSocket, WebSocket) | (WebSocket, Quic) | (Quic, Quic) => {
                Err(TransportError::config_error(
                    "route",
                    format!("unsupported transport pair: listen={} remote={}", listen, remote),
                ))
            }
        }
    }

    pub fn listen(&self) -> TransportKind {
        match self {
            Route::TcpToWebSocket | Route::TcpToQuic => TransportKind::Tcp,
            Route::QuicToWebSocket | Route::QuicToTcp => TransportKind::Quic,
            Route::WebSocketToTcp => TransportKind::WebSocket,
        }
    }

    pub fn remote(&self) -> TransportKind {
        match self {
            Route::TcpToWebSocket | Route::QuicToWebSocket => TransportKind::WebSocket,
            Route::TcpToQuic => TransportKind::Quic,
            Route::QuicToTcp | Route::WebSocketToTcp => TransportKind::Tcp,
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.listen(), self.remote())
    }
}
