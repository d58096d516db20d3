use std::io;

use thiserror::Error;

use crate::usock::SocketError;

/// Main error type for the experiment harness.
///
/// Socket-level failures (deadlines, accept, close) live in [`SocketError`]
/// and are wrapped here; the remaining variants are failures that only make
/// sense at the protocol or orchestration level.
#[derive(Debug, Error)]
pub enum Error {
   /// I/O error outside of socket operations.
   #[error("io error: {0}")]
   Io(#[from] io::Error),

   /// Socket communication error occurred.
   #[error("socket error: {0}")]
   Socket(#[from] SocketError),

   /// Could not allocate a fresh socket address.
   #[error("failed to allocate socket address: {0}")]
   Allocation(#[source] io::Error),

   /// Every connect attempt failed.
   #[error("failed to connect after {attempts} attempts: {source}")]
   Connect {
      attempts: u32,
      #[source]
      source:   SocketError,
   },

   /// The socket accepted fewer bytes than the message holds.
   #[error("supposed to write {expected} bytes, but wrote {written}")]
   ShortWrite { expected: usize, written: usize },

   /// A task finished without signalling completion.
   #[error("{0} task ended without signalling completion")]
   Abandoned(&'static str),

   /// Configuration could not be extracted.
   #[error("config error: {0}")]
   Config(#[from] Box<figment::Error>),

   /// Configuration could not be rendered as TOML.
   #[error("failed to render config: {0}")]
   RenderConfig(#[from] toml::ser::Error),
}

impl Error {
   /// Whether this error is a timeout-class failure
   pub const fn is_timeout(&self) -> bool {
      match self {
         Self::Socket(e) => e.is_timeout(),
         _ => false,
      }
   }
}

impl From<figment::Error> for Error {
   fn from(e: figment::Error) -> Self {
      Self::Config(Box::new(e))
   }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
