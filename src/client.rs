//! Client connector: connect with retries, say hello, wait for the reply.

use bytes::Bytes;
use tokio::time::{self, Duration, Instant};

use crate::{
   Error, Result,
   address::Address,
   config::Timings,
   protocol,
   signal::Completion,
   usock::Stream,
};

/// Where a client run has got to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
   NotConnected,
   Connecting,
   Connected,
   Greeted,
   AwaitingResponse,
   Done,
}

/// Everything a single client run observed
#[derive(Debug)]
pub struct ClientReport {
   /// States visited, in order, ending with [`ClientState::Done`]
   pub transitions:      Vec<ClientState>,
   pub connect_attempts: u32,
   pub greeting_sent:    bool,
   pub read_attempts:    u32,
   pub response:         Option<Bytes>,
   /// The unrecovered failure that ended the run, if any
   pub error:            Option<Error>,
   pub elapsed:          Duration,
}

impl Default for ClientReport {
   fn default() -> Self {
      Self {
         transitions:      vec![ClientState::NotConnected],
         connect_attempts: 0,
         greeting_sent:    false,
         read_attempts:    0,
         response:         None,
         error:            None,
         elapsed:          Duration::ZERO,
      }
   }
}

impl ClientReport {
   pub fn connected(&self) -> bool {
      self.reached(ClientState::Connected)
   }

   pub fn reached(&self, state: ClientState) -> bool {
      self.transitions.contains(&state)
   }

   pub fn state(&self) -> ClientState {
      self
         .transitions
         .last()
         .copied()
         .unwrap_or(ClientState::NotConnected)
   }

   fn advance(&mut self, next: ClientState) {
      tracing::debug!("CLIENT\t{:?} -> {:?}", self.state(), next);
      self.transitions.push(next);
   }
}

/// Runs one client and signals `completion` with its report.
///
/// The report is delivered whether or not the run succeeded; failures are in
/// [`ClientReport::error`].
pub async fn run_client(
   address: Address,
   timings: Timings,
   greeting: Bytes,
   completion: Completion<ClientReport>,
) {
   let report = connect_and_greet(&address, &timings, &greeting).await;
   completion.complete(report);
}

pub async fn connect_and_greet(
   address: &Address,
   timings: &Timings,
   greeting: &[u8],
) -> ClientReport {
   let started = Instant::now();
   let mut report = ClientReport::default();

   report.advance(ClientState::Connecting);
   match connect_with_retries(address, timings, &mut report).await {
      Ok(stream) => {
         report.advance(ClientState::Connected);
         let outcome = exchange(&stream, timings, greeting, &mut report).await;
         report.error = outcome.err();

         match stream.close() {
            Ok(()) => tracing::info!("CLIENT\tConnection closed."),
            Err(e) => tracing::warn!("CLIENT\tFailed to close connection: {}", e),
         }
      },
      Err(e) => {
         tracing::warn!("CLIENT\tGiving up on connecting: {}", e);
         report.error = Some(e);
      },
   }

   report.advance(ClientState::Done);
   report.elapsed = started.elapsed();
   report
}

/// Tries to connect up to `connect_retries` times, sleeping
/// `client_retry_wait` before each retry. Unix sockets fail or succeed
/// immediately, so without the sleep all attempts would land at once.
async fn connect_with_retries(
   address: &Address,
   timings: &Timings,
   report: &mut ClientReport,
) -> Result<Stream> {
   let attempts = timings.connect_retries.max(1);
   let mut attempt = 1;

   loop {
      if attempt > 1 {
         tracing::info!("CLIENT\tWaiting to retry...");
         time::sleep(timings.client_retry_wait).await;
      }

      tracing::info!("CLIENT\tConnect attempt {}...", attempt);
      report.connect_attempts = attempt;

      match Stream::connect(address).await {
         Ok(stream) => {
            tracing::info!("CLIENT\tConnect successful after {} attempts!", attempt);
            return Ok(stream);
         },
         Err(e) => {
            tracing::warn!("CLIENT\tClient connect failure with err={}", e);
            if attempt >= attempts {
               return Err(Error::Connect { attempts, source: e });
            }
            attempt += 1;
         },
      }
   }
}

async fn exchange(
   stream: &Stream,
   timings: &Timings,
   greeting: &[u8],
   report: &mut ClientReport,
) -> Result<()> {
   if let Err(e) = say_hello(stream, timings, greeting).await {
      tracing::warn!("CLIENT\tFailed to say hello to server in time: {}", e);
      return Err(e);
   }
   report.greeting_sent = true;
   report.advance(ClientState::Greeted);
   tracing::info!("CLIENT\tSuccessfully said hello to server");

   tracing::info!("CLIENT\tWaiting for response from server...");
   report.advance(ClientState::AwaitingResponse);
   match recv_response(stream, timings, report).await {
      Ok(response) => {
         tracing::info!(
            "CLIENT\tSuccessfully heard back from server: {}",
            String::from_utf8_lossy(&response)
         );
         report.response = Some(response);
         Ok(())
      },
      Err(e) => {
         tracing::warn!("CLIENT\tFailed to hear back from server: {}", e);
         Err(e)
      },
   }
}

pub async fn say_hello(stream: &Stream, timings: &Timings, greeting: &[u8]) -> Result<()> {
   protocol::send_within(stream, greeting, timings.client_connect_deadline).await
}

/// Reads the server's reply, retrying up to `read_attempts` times with a
/// fresh deadline each time. Stops at the first successful read and returns
/// exactly the bytes that read produced.
async fn recv_response(
   stream: &Stream,
   timings: &Timings,
   report: &mut ClientReport,
) -> Result<Bytes> {
   let attempts = timings.read_attempts.max(1);
   let mut buf = vec![0u8; timings.read_buffer_size.max(1)];
   let mut attempt = 1;

   loop {
      tracing::info!("CLIENT\tRead try {}...", attempt);
      report.read_attempts = attempt;

      match protocol::recv_within(stream, &mut buf, timings.client_connect_deadline).await {
         Ok(n) => return Ok(Bytes::copy_from_slice(&buf[..n])),
         Err(e) => {
            tracing::warn!("CLIENT\tFailed to read from server: {}", e);
            if attempt >= attempts {
               return Err(e);
            }
            attempt += 1;
         },
      }
   }
}
