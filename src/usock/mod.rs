//! Unix domain socket listener and stream with per-operation deadlines

use std::io;

/// Errors that can occur during socket operations
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
   #[error("failed to connect: {0}")]
   Connect(#[source] io::Error),

   #[error("failed to bind: {0}")]
   Bind(#[source] io::Error),

   #[error("accept failed: {0}")]
   Accept(#[source] io::Error),

   #[error("listener closed")]
   ListenerClosed,

   #[error("failed to remove stale socket: {0}")]
   RemoveStale(#[source] io::Error),

   #[error("read failed: {0}")]
   Read(#[source] io::Error),

   #[error("write failed: {0}")]
   Write(#[source] io::Error),

   #[error("{op} deadline exceeded")]
   DeadlineExceeded { op: &'static str },

   #[error("connection closed by peer")]
   PeerClosed,

   #[error("failed to close: {0}")]
   Close(#[source] io::Error),
}

impl SocketError {
   /// Whether this error came from an elapsed read or write deadline
   pub const fn is_timeout(&self) -> bool {
      matches!(self, Self::DeadlineExceeded { .. })
   }
}

#[cfg(unix)]
mod unix;

#[cfg(unix)]
pub use unix::*;
