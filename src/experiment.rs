//! The three-phase timeout experiment.
//!
//! 1. Connect while nothing is bound at the address.
//! 2. Connect to a bound listener that never accepts.
//! 3. Connect with a server accepting and answering.
//!
//! Phases run strictly one after another. Each gets fresh completion signals,
//! and a failing phase never stops the ones after it.

use std::{fmt, sync::Arc, time::Duration};

use bytes::Bytes;
use console::style;
use tokio::{sync::watch, time::Instant};

use crate::{
   Result,
   address::{self, Address},
   client::{self, ClientReport},
   config::{Config, Timings},
   server::{self, ServerReport},
   signal::{self, CompletionWait},
   usock::{Listener, Stream},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
   DeadServer,
   IdleListener,
   FullExchange,
}

impl Phase {
   pub const ALL: [Self; 3] = [Self::DeadServer, Self::IdleListener, Self::FullExchange];

   pub const fn number(self) -> u8 {
      match self {
         Self::DeadServer => 1,
         Self::IdleListener => 2,
         Self::FullExchange => 3,
      }
   }

   pub const fn title(self) -> &'static str {
      match self {
         Self::DeadServer => "Try to connect to dead server",
         Self::IdleListener => "Connect to listening server, but nobody's accepting",
         Self::FullExchange => "Connect to listening server, with server accepting",
      }
   }
}

impl fmt::Display for Phase {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "TEST {}: {}", self.number(), self.title())
   }
}

#[derive(Debug)]
pub struct PhaseReport {
   pub phase:             Phase,
   pub client:            Result<ClientReport>,
   /// Only phase 3 runs a server
   pub server:            Option<Result<ServerReport>>,
   /// Stale connections drained from the backlog before the phase started
   pub discarded_backlog: usize,
   pub elapsed:           Duration,
}

impl PhaseReport {
   fn new(phase: Phase, client: Result<ClientReport>, started: Instant) -> Self {
      Self { phase, client, server: None, discarded_backlog: 0, elapsed: started.elapsed() }
   }
}

#[derive(Debug)]
pub struct ExperimentReport {
   pub address: Address,
   pub phases:  Vec<PhaseReport>,
}

impl ExperimentReport {
   pub fn phase(&self, phase: Phase) -> Option<&PhaseReport> {
      self.phases.iter().find(|p| p.phase == phase)
   }
}

pub struct Experiment {
   address:  Address,
   timings:  Timings,
   greeting: Bytes,
   response: Bytes,
}

impl Experiment {
   /// Allocates a fresh address and takes timings and messages from `config`
   pub fn new(config: &Config) -> Result<Self> {
      let address = address::allocate_with_prefix(&config.socket_prefix)?;
      Ok(Self::with_address(address, config.timings(), config.greeting(), config.response()))
   }

   pub const fn with_address(
      address: Address,
      timings: Timings,
      greeting: Bytes,
      response: Bytes,
   ) -> Self {
      Self { address, timings, greeting, response }
   }

   pub const fn address(&self) -> &Address {
      &self.address
   }

   pub const fn timings(&self) -> &Timings {
      &self.timings
   }

   /// Runs the selected phases in their fixed order.
   ///
   /// The listener is bound before the first phase that needs it and closed
   /// after the last phase. Only a bind failure aborts the run.
   pub async fn run(&self, phases: &[Phase]) -> Result<ExperimentReport> {
      tracing::info!("SERVER\tUsing Unix domain socket: {}", self.address);

      let mut report = ExperimentReport { address: self.address.clone(), phases: Vec::new() };
      let mut listener = None;

      for phase in Phase::ALL.into_iter().filter(|p| phases.contains(p)) {
         println!("\n{}\n", style(format!("------\t{phase}")).bold());

         let phase_report = match phase {
            Phase::DeadServer => self.phase_dead_server().await,
            Phase::IdleListener => {
               let listener = self.ensure_listener(&mut listener)?;
               self.phase_idle_listener(listener).await
            },
            Phase::FullExchange => {
               let listener = self.ensure_listener(&mut listener)?;
               self.phase_full_exchange(listener).await
            },
         };

         if let Err(e) = &phase_report.client {
            tracing::error!("CLIENT\tPhase {} client did not report: {}", phase.number(), e);
         }
         report.phases.push(phase_report);
      }

      if let Some(listener) = listener {
         shut_down_listener(listener);
      }

      Ok(report)
   }

   fn ensure_listener<'a>(
      &self,
      slot: &'a mut Option<Arc<Listener>>,
   ) -> Result<&'a Arc<Listener>> {
      let listener = match slot.take() {
         Some(listener) => listener,
         None => {
            let listener = Listener::bind(&self.address)?;
            tracing::info!("SERVER\tListening on {}", listener.local_addr());
            Arc::new(listener)
         },
      };
      Ok(slot.insert(listener))
   }

   /// Phase 1: nothing is listening, so every connect attempt fails.
   pub async fn phase_dead_server(&self) -> PhaseReport {
      let started = Instant::now();
      let client = self.spawn_client().wait().await;
      PhaseReport::new(Phase::DeadServer, client, started)
   }

   /// Phase 2: the listener is bound but nobody calls accept. The connect
   /// lands in the backlog; the response never comes.
   ///
   /// `listener` must stay bound for the whole phase and must not be accepted on.
   pub async fn phase_idle_listener(&self, listener: &Listener) -> PhaseReport {
      let started = Instant::now();
      tracing::info!("SERVER\tListening on {} without accepting", listener.local_addr());
      let client = self.spawn_client().wait().await;
      PhaseReport::new(Phase::IdleListener, client, started)
   }

   /// Phase 3: a responder accepts alongside the client.
   ///
   /// Connections left queued by earlier phases are drained first so the
   /// responder pairs with this phase's client.
   pub async fn phase_full_exchange(&self, listener: &Arc<Listener>) -> PhaseReport {
      let started = Instant::now();

      let discarded_backlog = listener.discard_backlog(self.timings.backlog_grace).await;
      if discarded_backlog > 0 {
         tracing::info!(
            "SERVER\tDiscarded {} stale connection(s) from the backlog",
            discarded_backlog
         );
      }

      let (shutdown_tx, shutdown_rx) = watch::channel(false);
      let (slot, accepted) = signal::handoff();
      let (server_done, server_wait) = signal::completion("SERVER");

      tokio::spawn(server::run_server_once(
         Arc::clone(listener),
         self.timings,
         self.response.clone(),
         slot,
         shutdown_rx,
         server_done,
      ));
      let client = self.spawn_client().wait().await;

      // the client is finished, so an accept still pending now never pairs up
      let _ = shutdown_tx.send(true);

      let server_conn = accepted.take().await;
      let server = server_wait.wait().await;
      if let Err(e) = &server {
         tracing::error!("SERVER\tServer did not report: {}", e);
      }

      if let Some(conn) = server_conn {
         close_server_conn(conn);
      }

      PhaseReport {
         server: Some(server),
         discarded_backlog,
         ..PhaseReport::new(Phase::FullExchange, client, started)
      }
   }

   fn spawn_client(&self) -> CompletionWait<ClientReport> {
      let (done, wait) = signal::completion("CLIENT");
      tokio::spawn(client::run_client(
         self.address.clone(),
         self.timings,
         self.greeting.clone(),
         done,
      ));
      wait
   }

   /// Whether a phase ended the way the experiment predicts it should
   pub fn as_expected(&self, report: &PhaseReport) -> bool {
      let Ok(client) = &report.client else {
         return false;
      };

      match report.phase {
         Phase::DeadServer => {
            !client.connected()
               && !client.greeting_sent
               && client.connect_attempts == self.timings.connect_retries.max(1)
         },
         Phase::IdleListener => {
            client.connected()
               && client.connect_attempts == 1
               && client.response.is_none()
               && client.error.as_ref().is_some_and(crate::Error::is_timeout)
         },
         Phase::FullExchange => {
            let server_heard = matches!(
               &report.server,
               Some(Ok(ServerReport { greeting: Some(g), responded: true, .. }))
                  if *g == self.greeting
            );
            server_heard && client.response.as_ref() == Some(&self.response)
         },
      }
   }
}

fn close_server_conn(conn: Arc<Stream>) {
   tracing::info!("SERVER\tClosing client connection...");
   match Arc::into_inner(conn) {
      Some(stream) => match stream.close() {
         Ok(()) => tracing::info!("SERVER\tClient connection closed."),
         Err(e) => tracing::warn!("SERVER\tFailed to close client connection: {}", e),
      },
      None => tracing::warn!("SERVER\tClient connection still shared; leaving it to drop"),
   }
}

fn shut_down_listener(listener: Arc<Listener>) {
   tracing::info!("SERVER\tShutting down server...");
   match Arc::into_inner(listener) {
      Some(listener) => {
         if let Err(e) = listener.close() {
            tracing::warn!("SERVER\tFailed to close listener: {}", e);
         }
      },
      None => tracing::warn!("SERVER\tListener still shared; leaving it to drop"),
   }
   tracing::info!("SERVER\tServer shut down.");
}
