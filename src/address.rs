//! Socket address allocation

use std::{
   fmt,
   path::{Path, PathBuf},
};

use crate::{Error, Result};

/// Prefix used for temp names when none is configured
pub const DEFAULT_PREFIX: &str = "unix-domain-sock-timeouts-";

/// A filesystem path naming a Unix socket rendezvous point
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address(PathBuf);

impl Address {
   pub fn path(&self) -> &Path {
      &self.0
   }
}

impl AsRef<Path> for Address {
   fn as_ref(&self) -> &Path {
      &self.0
   }
}

impl From<PathBuf> for Address {
   fn from(path: PathBuf) -> Self {
      Self(path)
   }
}

impl fmt::Display for Address {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{}", self.0.display())
   }
}

/// Allocates a unique address in the system temp directory
pub fn allocate_unique_address() -> Result<Address> {
   allocate_with_prefix(DEFAULT_PREFIX)
}

/// Reserves a unique temp name, then deletes the file so nothing is left at
/// the returned path.
pub fn allocate_with_prefix(prefix: &str) -> Result<Address> {
   let file = tempfile::Builder::new()
      .prefix(prefix)
      .tempfile()
      .map_err(Error::Allocation)?;
   let path = file.path().to_path_buf();
   file.close().map_err(Error::Allocation)?;
   Ok(Address(path))
}
