//! SAM v3 client for reaching I2P peers.
//!
//! The crawl holds exactly one SAM session: a control connection that is
//! created once and kept open, because destroying it tears down every
//! stream that was opened under its id. Individual peer streams are
//! separate sockets to the bridge that issue `STREAM CONNECT` against the
//! shared session id and then become the raw data pipe.

use super::DialError;
use log::debug;
use std::net::SocketAddr;
use std::process;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Longest control-protocol line the client will buffer.
const MAX_REPLY_LINE: usize = 4096;

/// The crawl-wide SAM session.
///
/// Holding the control stream keeps the session alive on the bridge; the
/// socket is closed (and the session destroyed) when the value drops at
/// the end of the crawl.
#[derive(Debug)]
pub(super) struct SamSession {
    /// Held, not read: the bridge destroys the session when this closes.
    _control: TcpStream,
    id: String,
}

impl SamSession {
    /// Establish the session on the bridge at `router`.
    pub(super) async fn create(router: SocketAddr) -> Result<Self, DialError> {
        let mut control = TcpStream::connect(router).await?;
        hello(&mut control).await?;

        let id = session_id();
        let command = format!(
            "SESSION CREATE STYLE=STREAM ID={id} DESTINATION=TRANSIENT \
             SIGNATURE_TYPE=EdDSA_SHA512_Ed25519\n"
        );
        control.write_all(command.as_bytes()).await?;
        let reply = read_line(&mut control).await?;
        check_result(&reply)?;

        debug!("SAM session {id} established on {router}");
        Ok(SamSession {
            _control: control,
            id,
        })
    }

    pub(super) fn id(&self) -> &str {
        &self.id
    }
}

/// Open one peer stream over the shared session.
///
/// A fresh socket to the bridge performs its own HELLO, then asks for a
/// `STREAM CONNECT` to `destination` (a `.b32.i2p` hostname the bridge
/// resolves itself). After a successful status line the socket carries the
/// peer's bytes directly.
pub(super) async fn stream_connect(
    router: SocketAddr,
    session_id: &str,
    destination: &str,
) -> Result<TcpStream, DialError> {
    let mut stream = TcpStream::connect(router).await?;
    hello(&mut stream).await?;

    let command = format!("STREAM CONNECT ID={session_id} DESTINATION={destination} SILENT=false\n");
    stream.write_all(command.as_bytes()).await?;
    let reply = read_line(&mut stream).await?;
    check_result(&reply)?;

    debug!("SAM stream to {destination} established");
    Ok(stream)
}

/// SAM handshake issued on every socket to the bridge.
async fn hello(stream: &mut TcpStream) -> Result<(), DialError> {
    stream
        .write_all(b"HELLO VERSION MIN=3.0 MAX=3.1\n")
        .await?;
    let reply = read_line(stream).await?;
    check_result(&reply)
}

/// Read one `\n`-terminated control line.
///
/// Reads byte-at-a-time on purpose: anything buffered past the newline
/// would be stolen from the payload once the socket turns into a data
/// pipe.
async fn read_line(stream: &mut TcpStream) -> Result<String, DialError> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(DialError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "SAM bridge closed the connection mid-reply",
            )));
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > MAX_REPLY_LINE {
            return Err(DialError::SamRejected("oversized reply line".to_string()));
        }
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

/// Accept a reply only when it carries `RESULT=OK`.
fn check_result(reply: &str) -> Result<(), DialError> {
    if reply.split_whitespace().any(|token| token == "RESULT=OK") {
        Ok(())
    } else {
        Err(DialError::SamRejected(reply.to_string()))
    }
}

/// Session ids must be unique per bridge; derive one from time and pid the
/// same way the handshake nonce is built.
fn session_id() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("System time is before the Unix epoch")
        .as_nanos() as u64;
    let pid = process::id() as u64;
    format!("census-{:016x}", now ^ pid.rotate_left(32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// A scripted SAM bridge good for one session plus one stream.
    async fn mock_bridge() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // Control connection.
            let (mut control, _) = listener.accept().await.unwrap();
            respond_line(&mut control, "HELLO REPLY RESULT=OK VERSION=3.1\n").await;
            respond_line(&mut control, "SESSION STATUS RESULT=OK DESTINATION=mock\n").await;

            // One stream connection.
            let (mut stream, _) = listener.accept().await.unwrap();
            respond_line(&mut stream, "HELLO REPLY RESULT=OK VERSION=3.1\n").await;
            respond_line(&mut stream, "STREAM STATUS RESULT=OK\n").await;

            // Keep both sockets open until the test ends.
            let mut hold = [0u8; 1];
            let _ = control.read(&mut hold).await;
        });
        addr
    }

    /// Consume one request line and write a canned reply.
    async fn respond_line(stream: &mut TcpStream, reply: &str) {
        let mut byte = [0u8; 1];
        loop {
            stream.read_exact(&mut byte).await.unwrap();
            if byte[0] == b'\n' {
                break;
            }
        }
        stream.write_all(reply.as_bytes()).await.unwrap();
    }

    #[tokio::test]
    async fn session_then_stream() {
        let router = mock_bridge().await;
        let session = SamSession::create(router).await.unwrap();
        assert!(session.id().starts_with("census-"));

        let stream = stream_connect(router, session.id(), "peer.b32.i2p").await;
        assert!(stream.is_ok());
    }

    #[tokio::test]
    async fn rejected_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let router = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut control, _) = listener.accept().await.unwrap();
            respond_line(&mut control, "HELLO REPLY RESULT=OK VERSION=3.1\n").await;
            respond_line(
                &mut control,
                "SESSION STATUS RESULT=DUPLICATED_ID MESSAGE=\"in use\"\n",
            )
            .await;
        });

        let result = SamSession::create(router).await;
        assert!(matches!(result, Err(DialError::SamRejected(_))));
    }

    #[test]
    fn result_token_matching() {
        assert!(check_result("STREAM STATUS RESULT=OK").is_ok());
        // RESULT=OK must be its own token, not a substring.
        assert!(check_result("STREAM STATUS RESULT=OKAYNOT").is_err());
        assert!(check_result("STREAM STATUS RESULT=CANT_REACH_PEER").is_err());
    }
}
