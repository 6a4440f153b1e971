//! WebSocket transport: one session task per upgraded socket.

pub mod session;
