//! Length-prefixed, AES-GCM-encrypted record stream over a connected TCP
//! socket established after the session header handshake.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use serde_json::Value;

use crate::crypto::{self, Key};
use crate::error::ChannelError;
use crate::rpc::{self, Request};

/// Maximum plaintext payload accepted on a read; the wire length prefix
/// additionally carries the 32 bytes of nonce+tag overhead.
pub const MAX_PLAINTEXT: u32 = 1 << 20;

const SOFT_WATCHDOG: Duration = Duration::from_secs(60);
const HEADER_DEADLINE: Duration = Duration::from_secs(10);

pub struct Channel {
    stream: TcpStream,
    key_send: Key,
    key_recv: Key,
}

impl Channel {
    pub fn new(stream: TcpStream, key_send: Key, key_recv: Key) -> Self {
        Self {
            stream,
            key_send,
            key_recv,
        }
    }

    /// Apply the standard 60-second soft watchdog to the underlying
    /// socket's read timeout. Call once after the header phase completes.
    pub fn arm_watchdog(&self) -> std::io::Result<()> {
        self.stream.set_read_timeout(Some(SOFT_WATCHDOG))
    }

    pub fn arm_header_deadline(&self) -> std::io::Result<()> {
        self.stream.set_read_timeout(Some(HEADER_DEADLINE))
    }

    fn read_exact_or_eof(&mut self, buf: &mut [u8]) -> Result<bool, ChannelError> {
        match self.stream.read_exact(buf) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Err(ChannelError::Timeout)
            }
            Err(e) => Err(ChannelError::Io(e)),
        }
    }

    /// Read one framed record and decrypt it with `key_recv`. Returns
    /// `Ok(None)` on a clean end-of-stream.
    pub fn read_frame(&mut self) -> Result<Option<Vec<u8>>, ChannelError> {
        let mut len_buf = [0u8; 4];
        if !self.read_exact_or_eof(&mut len_buf)? {
            return Ok(None);
        }
        let len = u32::from_be_bytes(len_buf);
        if len > MAX_PLAINTEXT + 32 {
            return Err(ChannelError::TooLarge(len));
        }
        let mut body = vec![0u8; len as usize];
        if !self.read_exact_or_eof(&mut body)? {
            return Ok(None);
        }
        let plaintext = crypto::open(&body, &self.key_recv)?;
        Ok(Some(plaintext))
    }

    /// Seal `plaintext` with `key_send`, prefix with its length, write in
    /// one call.
    pub fn write_frame(&mut self, plaintext: &[u8]) -> Result<(), ChannelError> {
        let sealed = crypto::seal(plaintext, &self.key_send);
        let len = sealed.len() as u32;
        let mut out = Vec::with_capacity(4 + sealed.len());
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&sealed);
        self.stream.write_all(&out)?;
        Ok(())
    }

    /// Read one frame and decode it as a JSON-RPC request.
    pub fn rpc_read(&mut self) -> Result<Option<Request>, ChannelError> {
        let Some(plaintext) = self.read_frame()? else {
            return Ok(None);
        };
        match rpc::decode_request(&plaintext) {
            Ok(req) => Ok(Some(req)),
            Err(e) => Err(ChannelError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                e,
            ))),
        }
    }

    pub fn rpc_send(&mut self, response: &Value) -> Result<(), ChannelError> {
        let bytes = serde_json::to_vec(response).expect("response must serialize");
        self.write_frame(&bytes)
    }

    pub fn peer_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.stream.peer_addr()
    }

    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn round_trip_frame() {
        let (client, server) = pair();
        let key_a = crypto::derive_key("a");
        let key_b = crypto::derive_key("b");
        let mut chan_client = Channel::new(client, key_a, key_b);
        let mut chan_server = Channel::new(server, key_b, key_a);

        chan_client.write_frame(b"hello").unwrap();
        let received = chan_server.read_frame().unwrap().unwrap();
        assert_eq!(received, b"hello");
    }

    #[test]
    fn zero_length_record_round_trips() {
        let (client, server) = pair();
        let key_a = crypto::derive_key("a");
        let key_b = crypto::derive_key("b");
        let mut chan_client = Channel::new(client, key_a, key_b);
        let mut chan_server = Channel::new(server, key_b, key_a);

        chan_client.write_frame(b"").unwrap();
        let received = chan_server.read_frame().unwrap().unwrap();
        assert!(received.is_empty());
    }

    #[test]
    fn closed_stream_yields_none() {
        let (client, server) = pair();
        let key_a = crypto::derive_key("a");
        let key_b = crypto::derive_key("b");
        drop(client);
        let mut chan_server = Channel::new(server, key_b, key_a);
        assert!(chan_server.read_frame().unwrap().is_none());
    }
}
