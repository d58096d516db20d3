//! The one-shot greeting exchange.
//!
//! There is no framing: each side issues a single write of the raw message
//! bytes and the peer issues a single read into a fixed-size buffer.

use std::time::Duration;

use tokio::time::Instant;

use crate::{Error, Result, usock::Stream};

/// Sent by the client once connected
pub const GREETING: &[u8] = b"Hello!";

/// Sent by the server after it reads the greeting
pub const RESPONSE: &[u8] = b"Hey there!";

/// Writes `msg` in a single call with the write deadline set `timeout` from
/// now. A partial write is an error.
pub async fn send_within(stream: &Stream, msg: &[u8], timeout: Duration) -> Result<()> {
   stream.set_write_deadline(Instant::now() + timeout);
   let written = stream.write(msg).await?;
   if written != msg.len() {
      return Err(Error::ShortWrite { expected: msg.len(), written });
   }
   Ok(())
}

/// Reads once into `buf` with the read deadline set `timeout` from now
pub async fn recv_within(stream: &Stream, buf: &mut [u8], timeout: Duration) -> Result<usize> {
   stream.set_read_deadline(Instant::now() + timeout);
   Ok(stream.read(buf).await?)
}

#[cfg(test)]
mod tests {
   use super::*;

   const SECOND: Duration = Duration::from_secs(1);

   #[tokio::test]
   async fn greeting_arrives_intact() {
      let (client, server) = Stream::pair().unwrap();
      send_within(&client, GREETING, SECOND).await.unwrap();

      let mut buf = [0u8; 50];
      let n = recv_within(&server, &mut buf, SECOND).await.unwrap();
      assert_eq!(&buf[..n], GREETING);
   }

   #[tokio::test]
   async fn any_short_greeting_passes_through_byte_exact() {
      let (client, server) = Stream::pair().unwrap();
      let mut buf = [0u8; 50];

      let cases: [&[u8]; 3] = [b"x", b"Hello, is anybody listening on this socket?", &[0xAB; 50]];
      for msg in cases {
         send_within(&client, msg, SECOND).await.unwrap();
         let n = recv_within(&server, &mut buf, SECOND).await.unwrap();
         assert_eq!(&buf[..n], msg);
      }
   }

   #[tokio::test]
   async fn oversized_message_reports_short_write() {
      let (client, _server) = Stream::pair().unwrap();
      let msg = vec![7u8; 16 * 1024 * 1024];

      match send_within(&client, &msg, SECOND).await {
         Err(Error::ShortWrite { expected, written }) => {
            assert_eq!(expected, msg.len());
            assert!(written > 0 && written < expected);
         },
         other => panic!("expected short write, got {other:?}"),
      }
   }

   #[tokio::test]
   async fn silent_peer_times_out() {
      let (client, _server) = Stream::pair().unwrap();
      let mut buf = [0u8; 50];

      let err = recv_within(&client, &mut buf, Duration::from_millis(30))
         .await
         .unwrap_err();
      assert!(err.is_timeout());
   }
}
