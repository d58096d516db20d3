//! Unix domain socket implementation for Unix platforms

use std::{
   fs, io,
   net::Shutdown,
   path::{Path, PathBuf},
   time::Duration,
};

use parking_lot::Mutex;
use tokio::{
   net::{UnixListener as TokioUnixListener, UnixStream as TokioUnixStream},
   sync::watch,
   time::{self, Instant},
};

use super::SocketError;

/// Unix domain socket listener
///
/// `accept` has no deadline of its own. Use [`Listener::accept_or_shutdown`]
/// to give a pending accept a way out.
pub struct Listener {
   inner:    TokioUnixListener,
   path:     PathBuf,
   unlinked: bool,
}

impl Listener {
   /// Binds to a Unix domain socket path, unlinking any leftover object there
   pub fn bind(path: impl AsRef<Path>) -> Result<Self, SocketError> {
      let path = path.as_ref().to_path_buf();

      if fs::symlink_metadata(&path).is_ok() {
         fs::remove_file(&path).map_err(SocketError::RemoveStale)?;
      }

      let inner = TokioUnixListener::bind(&path).map_err(SocketError::Bind)?;
      Ok(Self { inner, path, unlinked: false })
   }

   /// Accepts an incoming connection
   pub async fn accept(&self) -> Result<Stream, SocketError> {
      let (stream, _) = self.inner.accept().await.map_err(SocketError::Accept)?;
      Ok(Stream::from_tokio(stream))
   }

   /// Accepts an incoming connection unless `shutdown` flips to `true` first.
   ///
   /// A dropped shutdown sender counts as shutdown.
   pub async fn accept_or_shutdown(
      &self,
      shutdown: &mut watch::Receiver<bool>,
   ) -> Result<Stream, SocketError> {
      if *shutdown.borrow_and_update() {
         return Err(SocketError::ListenerClosed);
      }

      loop {
         tokio::select! {
            result = self.accept() => return result,
            changed = shutdown.changed() => {
               if changed.is_err() || *shutdown.borrow_and_update() {
                  return Err(SocketError::ListenerClosed);
               }
            }
         }
      }
   }

   /// Accepts and closes every queued connection until an accept stays
   /// pending for `grace`. Returns how many were discarded.
   pub async fn discard_backlog(&self, grace: Duration) -> usize {
      let mut discarded = 0;

      while let Ok(result) = time::timeout(grace, self.accept()).await {
         match result {
            Ok(stream) => {
               if let Err(e) = stream.close() {
                  tracing::debug!("SERVER\tfailed to close stale connection: {}", e);
               }
               discarded += 1;
            },
            Err(e) => {
               tracing::warn!("SERVER\tfailed to accept stale connection: {}", e);
               break;
            },
         }
      }

      discarded
   }

   /// Returns the socket path as a string
   pub fn local_addr(&self) -> String {
      self.path.display().to_string()
   }

   pub fn path(&self) -> &Path {
      &self.path
   }

   /// Closes the listener and unlinks its socket path
   pub fn close(mut self) -> Result<(), SocketError> {
      self.unlinked = true;
      match fs::remove_file(&self.path) {
         Ok(()) => Ok(()),
         Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
         Err(e) => Err(SocketError::Close(e)),
      }
   }
}

impl Drop for Listener {
   fn drop(&mut self) {
      if !self.unlinked {
         let _ = fs::remove_file(&self.path);
      }
   }
}

#[derive(Debug, Default, Clone, Copy)]
struct Deadlines {
   read:  Option<Instant>,
   write: Option<Instant>,
}

/// Unix domain socket stream with independent read and write deadlines.
///
/// All I/O goes through `&self`, so a stream can be shared behind an `Arc`
/// between the task doing the exchange and the task that will close it.
pub struct Stream {
   inner:     TokioUnixStream,
   deadlines: Mutex<Deadlines>,
}

impl Stream {
   /// Connects to a Unix domain socket
   pub async fn connect(path: impl AsRef<Path>) -> Result<Self, SocketError> {
      let inner = TokioUnixStream::connect(path)
         .await
         .map_err(SocketError::Connect)?;
      Ok(Self::from_tokio(inner))
   }

   /// Creates a connected pair of unnamed streams
   pub fn pair() -> Result<(Self, Self), SocketError> {
      let (a, b) = TokioUnixStream::pair().map_err(SocketError::Connect)?;
      Ok((Self::from_tokio(a), Self::from_tokio(b)))
   }

   fn from_tokio(inner: TokioUnixStream) -> Self {
      Self { inner, deadlines: Mutex::new(Deadlines::default()) }
   }

   pub fn set_read_deadline(&self, deadline: Instant) {
      self.deadlines.lock().read = Some(deadline);
   }

   pub fn set_write_deadline(&self, deadline: Instant) {
      self.deadlines.lock().write = Some(deadline);
   }

   /// Reads whatever is available, up to `buf.len()` bytes.
   ///
   /// An orderly shutdown by the peer surfaces as [`SocketError::PeerClosed`].
   pub async fn read(&self, buf: &mut [u8]) -> Result<usize, SocketError> {
      let deadline = self.deadlines.lock().read;
      let wants = !buf.is_empty();

      match within("read", deadline, self.read_ready(buf), SocketError::Read).await? {
         0 if wants => Err(SocketError::PeerClosed),
         n => Ok(n),
      }
   }

   /// Issues a single write and returns how many bytes the socket took.
   ///
   /// The count may be short of `buf.len()`; callers decide what that means.
   pub async fn write(&self, buf: &[u8]) -> Result<usize, SocketError> {
      let deadline = self.deadlines.lock().write;
      within("write", deadline, self.write_ready(buf), SocketError::Write).await
   }

   async fn read_ready(&self, buf: &mut [u8]) -> io::Result<usize> {
      loop {
         self.inner.readable().await?;
         match self.inner.try_read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {},
            Err(e) => return Err(e),
         }
      }
   }

   async fn write_ready(&self, buf: &[u8]) -> io::Result<usize> {
      loop {
         self.inner.writable().await?;
         match self.inner.try_write(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {},
            Err(e) => return Err(e),
         }
      }
   }

   /// Shuts down both halves and releases the socket
   pub fn close(self) -> Result<(), SocketError> {
      let socket = self.inner.into_std().map_err(SocketError::Close)?;
      match socket.shutdown(Shutdown::Both) {
         Ok(()) => Ok(()),
         Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
         Err(e) => Err(SocketError::Close(e)),
      }
   }
}

/// Runs `op_future` under an optional absolute deadline. A deadline that has already
/// passed fails without touching the socket.
async fn within<T>(
   op: &'static str,
   deadline: Option<Instant>,
   op_future: impl Future<Output = io::Result<T>>,
   wrap: fn(io::Error) -> SocketError,
) -> Result<T, SocketError> {
   let Some(deadline) = deadline else {
      return op_future.await.map_err(wrap);
   };

   if deadline <= Instant::now() {
      return Err(SocketError::DeadlineExceeded { op });
   }

   match time::timeout_at(deadline, op_future).await {
      Ok(result) => result.map_err(wrap),
      Err(_) => Err(SocketError::DeadlineExceeded { op }),
   }
}

#[cfg(test)]
mod tests {
   use std::sync::Arc;

   use tempfile::TempDir;

   use super::*;

   fn in_ms(ms: u64) -> Instant {
      Instant::now() + Duration::from_millis(ms)
   }

   #[tokio::test]
   async fn past_read_deadline_fails_immediately() {
      let (a, b) = Stream::pair().unwrap();
      b.write(b"ready").await.unwrap();

      a.set_read_deadline(Instant::now() - Duration::from_millis(1));
      let started = Instant::now();
      let mut buf = [0u8; 16];
      let err = a.read(&mut buf).await.unwrap_err();

      assert!(err.is_timeout());
      assert!(started.elapsed() < Duration::from_millis(100));
   }

   #[tokio::test]
   async fn past_write_deadline_fails_immediately() {
      let (a, _b) = Stream::pair().unwrap();
      a.set_write_deadline(Instant::now());

      let err = a.write(b"Hello!").await.unwrap_err();
      assert!(matches!(err, SocketError::DeadlineExceeded { op: "write" }));
   }

   #[tokio::test]
   async fn read_times_out_when_peer_is_silent() {
      let (a, _b) = Stream::pair().unwrap();
      a.set_read_deadline(in_ms(50));

      let mut buf = [0u8; 50];
      let err = a.read(&mut buf).await.unwrap_err();
      assert!(err.is_timeout());
   }

   #[tokio::test]
   async fn deadlines_are_independent() {
      let (a, b) = Stream::pair().unwrap();
      a.set_read_deadline(Instant::now() - Duration::from_millis(1));
      a.set_write_deadline(in_ms(1000));

      assert_eq!(a.write(b"Hello!").await.unwrap(), 6);

      let mut buf = [0u8; 50];
      b.set_read_deadline(in_ms(1000));
      let n = b.read(&mut buf).await.unwrap();
      assert_eq!(&buf[..n], b"Hello!");

      assert!(a.read(&mut buf).await.unwrap_err().is_timeout());
   }

   #[tokio::test]
   async fn closed_peer_reads_as_peer_closed() {
      let (a, b) = Stream::pair().unwrap();
      b.close().unwrap();

      a.set_read_deadline(in_ms(1000));
      let mut buf = [0u8; 8];
      assert!(matches!(a.read(&mut buf).await, Err(SocketError::PeerClosed)));
   }

   #[tokio::test]
   async fn bind_replaces_leftover_file() {
      let dir = TempDir::new().unwrap();
      let path = dir.path().join("leftover.sock");
      fs::write(&path, b"not a socket").unwrap();

      let listener = Listener::bind(&path).unwrap();
      assert_eq!(listener.local_addr(), path.display().to_string());
      listener.close().unwrap();
      assert!(!path.exists());
   }

   #[tokio::test]
   async fn drop_unlinks_socket_path() {
      let dir = TempDir::new().unwrap();
      let path = dir.path().join("dropped.sock");

      drop(Listener::bind(&path).unwrap());
      assert!(!path.exists());
   }

   #[tokio::test]
   async fn connect_without_listener_fails() {
      let dir = TempDir::new().unwrap();
      let path = dir.path().join("nobody.sock");

      assert!(matches!(Stream::connect(&path).await, Err(SocketError::Connect(_))));
   }

   #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
   async fn accept_returns_listener_closed_on_shutdown() {
      let dir = TempDir::new().unwrap();
      let listener = Arc::new(Listener::bind(dir.path().join("idle.sock")).unwrap());
      let (tx, mut rx) = watch::channel(false);

      let accepting = Arc::clone(&listener);
      let handle = tokio::spawn(async move { accepting.accept_or_shutdown(&mut rx).await });

      time::sleep(Duration::from_millis(20)).await;
      tx.send(true).unwrap();

      let result = handle.await.unwrap();
      assert!(matches!(result, Err(SocketError::ListenerClosed)));
   }

   #[tokio::test]
   async fn accept_after_shutdown_fails_without_waiting() {
      let dir = TempDir::new().unwrap();
      let listener = Listener::bind(dir.path().join("closed.sock")).unwrap();
      let (tx, mut rx) = watch::channel(true);

      assert!(matches!(
         listener.accept_or_shutdown(&mut rx).await,
         Err(SocketError::ListenerClosed)
      ));
      drop(tx);
   }

   #[tokio::test]
   async fn discard_backlog_drains_queued_connections() {
      let dir = TempDir::new().unwrap();
      let path = dir.path().join("backlog.sock");
      let listener = Listener::bind(&path).unwrap();

      let first = Stream::connect(&path).await.unwrap();
      let second = Stream::connect(&path).await.unwrap();

      let discarded = listener.discard_backlog(Duration::from_millis(100)).await;
      assert_eq!(discarded, 2);
      assert_eq!(listener.discard_backlog(Duration::from_millis(20)).await, 0);

      drop((first, second));
      listener.close().unwrap();
   }
}
