//! Server responder: accept one connection, read the greeting, answer it.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::watch;

use crate::{
   Error, Result,
   config::Timings,
   protocol,
   signal::{Completion, Handoff},
   usock::{Listener, Stream},
};

#[derive(Debug, Default)]
pub struct ServerReport {
   pub accepted:  bool,
   /// Exactly the bytes the greeting read produced
   pub greeting:  Option<Bytes>,
   pub responded: bool,
   pub error:     Option<Error>,
}

/// Accepts one connection on `listener` and answers its greeting with
/// `response`.
///
/// The accepted stream is published on `handoff` and never closed here; the
/// receiver of the handoff owns the close. Raising `shutdown` while the accept
/// is still pending ends the run with [`SocketError::ListenerClosed`].
///
/// [`SocketError::ListenerClosed`]: crate::usock::SocketError::ListenerClosed
pub async fn run_server_once(
   listener: Arc<Listener>,
   timings: Timings,
   response: Bytes,
   handoff: Handoff<Arc<Stream>>,
   mut shutdown: watch::Receiver<bool>,
   completion: Completion<ServerReport>,
) {
   let report = serve_once(&listener, &timings, &response, handoff, &mut shutdown).await;
   // the orchestrator reclaims the listener once this completes
   drop(listener);
   completion.complete(report);
}

async fn serve_once(
   listener: &Listener,
   timings: &Timings,
   response: &[u8],
   handoff: Handoff<Arc<Stream>>,
   shutdown: &mut watch::Receiver<bool>,
) -> ServerReport {
   let mut report = ServerReport::default();

   let stream = match listener.accept_or_shutdown(shutdown).await {
      Ok(stream) => Arc::new(stream),
      Err(e) => {
         tracing::error!("SERVER\tAccept failed: {}", e);
         report.error = Some(e.into());
         return report;
      },
   };
   report.accepted = true;

   if handoff.publish(Arc::clone(&stream)).is_err() {
      tracing::warn!("SERVER\tNobody took the accepted connection");
   }
   tracing::info!("SERVER\tClient connected");

   if let Err(e) = exchange(&stream, timings, response, &mut report).await {
      tracing::error!("SERVER\tExchange with client failed: {}", e);
      report.error = Some(e);
   }

   report
}

async fn exchange(
   stream: &Stream,
   timings: &Timings,
   response: &[u8],
   report: &mut ServerReport,
) -> Result<()> {
   let greeting = read_greeting(stream, timings).await?;
   tracing::info!("SERVER\tGot greeting from client: {}", String::from_utf8_lossy(&greeting));
   report.greeting = Some(greeting);

   tracing::info!("SERVER\tResponding to client...");
   protocol::send_within(stream, response, timings.server_connect_deadline).await?;
   tracing::info!("SERVER\tWrote string: {}", String::from_utf8_lossy(response));
   report.responded = true;
   tracing::info!("SERVER\tSuccessfully responded to client.");

   Ok(())
}

/// Single read, no retries: the server gives the client one deadline's worth
/// of time to speak.
pub async fn read_greeting(stream: &Stream, timings: &Timings) -> Result<Bytes> {
   let mut buf = vec![0u8; timings.read_buffer_size.max(1)];
   let n = protocol::recv_within(stream, &mut buf, timings.server_connect_deadline).await?;
   buf.truncate(n);
   Ok(Bytes::from(buf))
}

#[cfg(test)]
mod tests {
   use std::time::Duration;

   use tempfile::TempDir;

   use super::*;
   use crate::{
      protocol::{GREETING, RESPONSE},
      signal,
      usock::SocketError,
   };

   fn quick() -> Timings {
      Timings {
         server_connect_deadline: Duration::from_millis(80),
         ..Timings::default()
      }
   }

   struct Running {
      listener: Arc<Listener>,
      accepted: signal::HandoffWait<Arc<Stream>>,
      done:     signal::CompletionWait<ServerReport>,
      shutdown: watch::Sender<bool>,
   }

   fn spawn_server(dir: &TempDir) -> Running {
      let listener = Arc::new(Listener::bind(dir.path().join("server.sock")).unwrap());
      let (slot, accepted) = signal::handoff();
      let (completion, done) = signal::completion("SERVER");
      let (shutdown, shutdown_rx) = watch::channel(false);

      tokio::spawn(run_server_once(
         Arc::clone(&listener),
         quick(),
         Bytes::from_static(RESPONSE),
         slot,
         shutdown_rx,
         completion,
      ));

      Running { listener, accepted, done, shutdown }
   }

   #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
   async fn answers_greeting_and_hands_off_connection() {
      let dir = TempDir::new().unwrap();
      let server = spawn_server(&dir);

      let client = Stream::connect(server.listener.path()).await.unwrap();
      protocol::send_within(&client, GREETING, Duration::from_secs(1))
         .await
         .unwrap();

      let mut buf = [0u8; 50];
      let n = protocol::recv_within(&client, &mut buf, Duration::from_secs(1))
         .await
         .unwrap();
      assert_eq!(&buf[..n], RESPONSE);

      let conn = server.accepted.take().await.unwrap();
      let report = server.done.wait().await.unwrap();
      assert!(report.accepted && report.responded);
      assert_eq!(report.greeting.as_deref(), Some(GREETING));
      assert!(report.error.is_none());

      // the server left the connection open for us
      let conn = Arc::into_inner(conn).unwrap();
      conn.close().unwrap();
      client.close().unwrap();
   }

   #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
   async fn silent_client_times_out_without_retry() {
      let dir = TempDir::new().unwrap();
      let server = spawn_server(&dir);

      let client = Stream::connect(server.listener.path()).await.unwrap();

      let report = server.done.wait().await.unwrap();
      assert!(report.accepted);
      assert!(report.greeting.is_none());
      assert!(report.error.as_ref().is_some_and(Error::is_timeout));
      assert!(server.accepted.take().await.is_some());
      client.close().unwrap();
   }

   #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
   async fn shutdown_releases_pending_accept() {
      let dir = TempDir::new().unwrap();
      let server = spawn_server(&dir);

      tokio::time::sleep(Duration::from_millis(20)).await;
      server.shutdown.send(true).unwrap();

      let report = server.done.wait().await.unwrap();
      assert!(!report.accepted);
      assert!(matches!(report.error, Some(Error::Socket(SocketError::ListenerClosed))));
      assert!(server.accepted.take().await.is_none());

      let listener = Arc::into_inner(server.listener).unwrap();
      listener.close().unwrap();
   }
}
