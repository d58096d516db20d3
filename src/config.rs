use std::{
   io,
   path::{Path, PathBuf},
   time::Duration,
};

use bytes::Bytes;
use figment::{
   Figment,
   providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result, address::DEFAULT_PREFIX};

pub const ENV_PREFIX: &str = "UDS_TIMEOUTS_";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
   pub connect_retries:            u32,
   pub client_retry_wait_ms:       u64,
   pub client_connect_deadline_ms: u64,
   pub server_connect_deadline_ms: u64,
   pub read_attempts:              u32,
   pub read_buffer_size:           usize,
   pub backlog_grace_ms:           u64,

   pub greeting:      String,
   pub response:      String,
   pub socket_prefix: String,
}

impl Default for Config {
   fn default() -> Self {
      Self {
         connect_retries:            3,
         client_retry_wait_ms:       1000,
         client_connect_deadline_ms: 3000,
         server_connect_deadline_ms: 3000,
         read_attempts:              3,
         read_buffer_size:           50,
         backlog_grace_ms:           100,
         greeting:                   "Hello!".to_string(),
         response:                   "Hey there!".to_string(),
         socket_prefix:              DEFAULT_PREFIX.to_string(),
      }
   }
}

impl Config {
   /// Loads defaults, then the optional TOML file, then `UDS_TIMEOUTS_*`
   /// environment overrides.
   pub fn load(path: Option<&Path>) -> Result<Self> {
      let mut figment = Figment::from(Serialized::defaults(Self::default()));

      if let Some(path) = path {
         if !path.exists() {
            return Err(Error::Io(io::Error::new(
               io::ErrorKind::NotFound,
               format!("config file not found: {}", path.display()),
            )));
         }
         figment = figment.merge(Toml::file(path));
      }

      Ok(figment.merge(Env::prefixed(ENV_PREFIX)).extract()?)
   }

   pub fn timings(&self) -> Timings {
      Timings {
         connect_retries:         self.connect_retries.max(1),
         client_retry_wait:       Duration::from_millis(self.client_retry_wait_ms),
         client_connect_deadline: Duration::from_millis(self.client_connect_deadline_ms),
         server_connect_deadline: Duration::from_millis(self.server_connect_deadline_ms),
         read_attempts:           self.read_attempts.max(1),
         read_buffer_size:        self.read_buffer_size.max(1),
         backlog_grace:           Duration::from_millis(self.backlog_grace_ms),
      }
   }

   pub fn greeting(&self) -> Bytes {
      Bytes::from(self.greeting.clone())
   }

   pub fn response(&self) -> Bytes {
      Bytes::from(self.response.clone())
   }

   pub fn to_toml(&self) -> Result<String> {
      Ok(toml::to_string_pretty(self)?)
   }
}

pub fn default_config_path() -> PathBuf {
   PathBuf::from("uds-timeouts.toml")
}

/// Timing knobs handed to every client, server and experiment run.
///
/// Immutable once built; each component receives its own copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
   pub connect_retries:         u32,
   pub client_retry_wait:       Duration,
   pub client_connect_deadline: Duration,
   pub server_connect_deadline: Duration,
   pub read_attempts:           u32,
   pub read_buffer_size:        usize,
   /// How long an accept may stay pending before the backlog counts as empty
   pub backlog_grace:           Duration,
}

impl Default for Timings {
   fn default() -> Self {
      Config::default().timings()
   }
}

impl Timings {
   /// Upper bound on a single client run: every connect attempt with its
   /// retry wait and write deadline, plus every response read.
   pub fn client_run_bound(&self) -> Duration {
      let per_connect = self.client_retry_wait + self.client_connect_deadline;
      per_connect * self.connect_retries + self.client_connect_deadline * self.read_attempts
   }
}
