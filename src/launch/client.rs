//! Debugger handshake with a ready simulator.
//!
//! The simulator speaks the Firefox remote debugging protocol: every packet
//! is a decimal byte length, a colon, and a JSON body. On connect the server
//! sends a greeting from the `root` actor; receiving it completes the
//! handshake.

use crate::error::LaunchError;
use crate::launch::types::RunningSimulator;
use crate::launch::DEBUGGER_HOST;
use async_trait::async_trait;
use serde_json::Value;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

/// Timeout for connecting and receiving the root greeting.
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 10;
/// Largest packet body accepted.
const MAX_PACKET_LEN: usize = 16 * 1024 * 1024;
/// Longest length prefix accepted, in digits.
const MAX_LENGTH_DIGITS: usize = 10;

/// Opens debugging sessions against a port.
#[async_trait]
pub trait DebugProtocol: Send + Sync {
    async fn open(&self, port: u16) -> Result<DebugSession, LaunchError>;
}

/// An established debugging session.
#[derive(Debug)]
pub struct DebugSession {
    port: u16,
    greeting: Value,
    stream: Option<TcpStream>,
}

impl DebugSession {
    /// Wrap a greeting and, for live sessions, the connected stream.
    pub fn new(port: u16, greeting: Value, stream: Option<TcpStream>) -> Self {
        Self {
            port,
            greeting,
            stream,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The root actor's greeting packet.
    pub fn greeting(&self) -> &Value {
        &self.greeting
    }

    pub fn application_type(&self) -> Option<&str> {
        self.greeting.get("applicationType").and_then(Value::as_str)
    }

    pub fn traits(&self) -> Option<&Value> {
        self.greeting.get("traits")
    }

    /// Send one packet and wait for the next packet from the server.
    pub async fn request(&mut self, packet: &Value) -> io::Result<Value> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "session has no stream"))?;
        write_packet(stream, packet).await?;
        read_packet(stream).await
    }
}

/// Read one length-prefixed JSON packet.
pub async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Value> {
    let mut prefix = String::new();
    loop {
        let byte = reader.read_u8().await?;
        match byte {
            b':' if !prefix.is_empty() => break,
            b'0'..=b'9' if prefix.len() < MAX_LENGTH_DIGITS => prefix.push(byte as char),
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("malformed packet length prefix after {prefix:?}"),
                ))
            }
        }
    }

    let len: usize = prefix
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if len > MAX_PACKET_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("packet of {len} bytes exceeds limit"),
        ));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    serde_json::from_slice(&body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Write one length-prefixed JSON packet.
pub async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, packet: &Value) -> io::Result<()> {
    let body = serde_json::to_vec(packet)?;
    writer
        .write_all(format!("{}:", body.len()).as_bytes())
        .await?;
    writer.write_all(&body).await?;
    writer.flush().await
}

/// Remote debugging protocol client for local simulators.
#[derive(Debug, Clone)]
pub struct RemoteDebugClient {
    host: String,
    timeout: Duration,
}

impl Default for RemoteDebugClient {
    fn default() -> Self {
        Self {
            host: DEBUGGER_HOST.to_string(),
            timeout: Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
        }
    }
}

impl RemoteDebugClient {
    pub fn new() -> Self {
        Self::default()
    }

    async fn handshake(&self, port: u16) -> io::Result<(Value, TcpStream)> {
        let mut stream = TcpStream::connect((self.host.as_str(), port)).await?;
        let greeting = read_packet(&mut stream).await?;
        if greeting.get("from").and_then(Value::as_str) != Some("root") {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected greeting from root actor, got {greeting}"),
            ));
        }
        Ok((greeting, stream))
    }
}

#[async_trait]
impl DebugProtocol for RemoteDebugClient {
    async fn open(&self, port: u16) -> Result<DebugSession, LaunchError> {
        let (greeting, stream) = timeout(self.timeout, self.handshake(port))
            .await
            .map_err(|_| {
                LaunchError::handshake(
                    port,
                    format!("no greeting within {} seconds", self.timeout.as_secs()),
                )
            })?
            .map_err(|e| LaunchError::handshake(port, e))?;
        debug!(port, greeting = %greeting, "Received root greeting");
        Ok(DebugSession::new(port, greeting, Some(stream)))
    }
}

/// Attaches a debugging session to a running simulator.
#[derive(Clone)]
pub struct ClientConnector {
    protocol: Arc<dyn DebugProtocol>,
}

impl ClientConnector {
    pub fn new(protocol: Arc<dyn DebugProtocol>) -> Self {
        Self { protocol }
    }

    /// Open a session on the simulator's port; `client` is only set on success.
    pub async fn attach(&self, simulator: &mut RunningSimulator) -> Result<(), LaunchError> {
        let session = self.protocol.open(simulator.port()).await?;
        info!(
            port = simulator.port(),
            application_type = session.application_type().unwrap_or("unknown"),
            "Debugger client connected"
        );
        simulator.client = Some(session);
        Ok(())
    }

    /// Return the simulator with a client attached.
    pub async fn connect(
        &self,
        mut simulator: RunningSimulator,
    ) -> Result<RunningSimulator, LaunchError> {
        self.attach(&mut simulator).await?;
        Ok(simulator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    async fn serve_once(first: Vec<u8>) -> (u16, tokio::task::JoinHandle<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(&first).await.unwrap();
            stream
        });
        (port, handle)
    }

    fn framed(value: &Value) -> Vec<u8> {
        let body = serde_json::to_vec(value).unwrap();
        let mut out = format!("{}:", body.len()).into_bytes();
        out.extend(body);
        out
    }

    #[test]
    fn test_connects_to_debugger_host() {
        assert_eq!(RemoteDebugClient::default().host, DEBUGGER_HOST);
    }

    #[tokio::test]
    async fn test_handshake_reads_root_greeting() {
        let greeting = json!({"from": "root", "applicationType": "b2g", "traits": {"bulk": true}});
        let (port, _server) = serve_once(framed(&greeting)).await;

        let session = RemoteDebugClient::new().open(port).await.unwrap();
        assert_eq!(session.port(), port);
        assert_eq!(session.application_type(), Some("b2g"));
        assert_eq!(session.traits(), Some(&json!({"bulk": true})));
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let (port, server) = serve_once(framed(&json!({"from": "root"}))).await;
        let mut session = RemoteDebugClient::new().open(port).await.unwrap();

        let responder = tokio::spawn(async move {
            let mut stream = server.await.unwrap();
            let request = read_packet(&mut stream).await.unwrap();
            assert_eq!(request, json!({"to": "root", "type": "listTabs"}));
            write_packet(&mut stream, &json!({"from": "root", "tabs": []}))
                .await
                .unwrap();
        });

        let reply = session
            .request(&json!({"to": "root", "type": "listTabs"}))
            .await
            .unwrap();
        assert_eq!(reply["tabs"], json!([]));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_non_root_greeting_fails() {
        let (port, _server) = serve_once(framed(&json!({"from": "tab1"}))).await;
        let err = RemoteDebugClient::new().open(port).await.unwrap_err();
        assert!(matches!(err, LaunchError::Handshake { port: p, .. } if p == port));
    }

    #[tokio::test]
    async fn test_garbage_greeting_fails() {
        let (port, _server) = serve_once(b"hello there".to_vec()).await;
        let err = RemoteDebugClient::new().open(port).await.unwrap_err();
        assert!(matches!(err, LaunchError::Handshake { .. }));
    }

    #[tokio::test]
    async fn test_detached_session_cannot_request() {
        let mut session = DebugSession::new(6000, json!({"from": "root"}), None);
        let err = session.request(&json!({"to": "root"})).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_oversized_packet_rejected() {
        let mut input: &[u8] = b"99999999999:{}";
        let err = read_packet(&mut input).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
