//! Bitcoin v1 message framing.
//!
//! Each message on the wire is a 24-byte header (network magic, NUL-padded
//! ASCII command, little-endian payload length, double-SHA256 checksum)
//! followed by the payload. Decoding is strict: a wrong magic, a wrong
//! checksum, a non-ASCII command or a payload length above the cap is a
//! fatal framing error that ends the session. Unknown commands decode to
//! [`NetworkMessage::Unknown`] and are discarded by callers.

use bitcoin::consensus::encode;
use bitcoin::p2p::message::{NetworkMessage, RawNetworkMessage};
use bitcoin::p2p::Magic;
use std::fmt;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Bytes in a v1 frame header: magic, command, payload length, checksum.
const HEADER_SIZE: usize = 24;
/// Byte offset of the little-endian payload length within the header.
const PAYLOAD_LENGTH_OFFSET: usize = 16;
/// Largest payload the decoder will buffer. Well above anything the
/// address-gossip subset of the protocol produces.
const MAX_PAYLOAD_LENGTH: usize = 32 * 1024 * 1024;
/// Protocol limit on entries in one `addr`/`addrv2` message.
pub const MAX_ADDR_PER_MESSAGE: usize = 1_000;

/// Error types specific to the framing layer.
#[derive(Debug)]
pub enum CodecError {
    /// The underlying stream failed.
    Io(io::Error),
    /// The frame did not decode as a bitcoin message (checksum, command
    /// or payload).
    Deserialize(encode::Error),
    /// The frame carries the magic of a different network.
    MagicMismatch,
    /// Declared payload length exceeds [`MAX_PAYLOAD_LENGTH`].
    OversizedPayload(usize),
    /// `addr`/`addrv2` message with more than [`MAX_ADDR_PER_MESSAGE`] entries.
    OversizedAddressMessage(usize),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Io(e) => write!(f, "stream error: {e}"),
            CodecError::Deserialize(e) => write!(f, "undecodable message: {e}"),
            CodecError::MagicMismatch => write!(f, "wrong network magic"),
            CodecError::OversizedPayload(len) => {
                write!(f, "declared payload length {len} exceeds cap")
            }
            CodecError::OversizedAddressMessage(count) => {
                write!(f, "address message with {count} entries exceeds protocol limit")
            }
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CodecError::Io(e) => Some(e),
            CodecError::Deserialize(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CodecError {
    fn from(e: io::Error) -> Self {
        CodecError::Io(e)
    }
}

impl From<encode::Error> for CodecError {
    fn from(e: encode::Error) -> Self {
        CodecError::Deserialize(e)
    }
}

/// Buffered progress of one in-flight message read.
///
/// The session layer wraps reads in deadlines and may drop a read future
/// mid-message, so every byte consumed so far has to live here rather
/// than on the stack; the next read call continues from `filled`. The
/// buffer starts header-sized and is only grown once the declared
/// payload length has passed validation, so a hostile header cannot make
/// us allocate first and check later.
#[derive(Debug)]
struct PartialRead {
    /// Header bytes, extended to cover the payload once its length is known.
    buffer: Vec<u8>,
    /// How much of `buffer` holds received bytes.
    filled: usize,
    /// Declared payload length, parsed and validated from the header.
    payload_len: Option<usize>,
}

impl PartialRead {
    fn new() -> Self {
        PartialRead {
            buffer: vec![0u8; HEADER_SIZE],
            filled: 0,
            payload_len: None,
        }
    }
}

/// Writer half of the framing layer.
#[derive(Debug)]
pub struct MessageWriter<W> {
    /// The bitcoin network magic bytes.
    network_magic: Magic,
    /// The IO writer.
    writer: W,
}

impl<W> MessageWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    /// Wrap `writer`, framing outgoing messages for `network_magic`.
    pub fn new(network_magic: Magic, writer: W) -> Self {
        Self {
            network_magic,
            writer,
        }
    }

    /// Frame and write one bitcoin network message, flushing it out.
    pub async fn write(&mut self, message: NetworkMessage) -> Result<(), CodecError> {
        let frame = encode::serialize(&RawNetworkMessage::new(self.network_magic, message));
        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Consume the writer half, returning the underlying IO writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Reader half of the framing layer.
#[derive(Debug)]
pub struct MessageReader<R> {
    /// The bitcoin network magic bytes.
    network_magic: Magic,
    /// Bytes of the message currently being assembled.
    partial: PartialRead,
    /// The IO reader.
    reader: R,
}

impl<R> MessageReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    /// Wrap `reader`, expecting incoming frames under `network_magic`.
    pub fn new(network_magic: Magic, reader: R) -> Self {
        Self {
            network_magic,
            partial: PartialRead::new(),
            reader,
        }
    }

    /// Read one bitcoin network message.
    ///
    /// This function is cancellation safe: if the enclosing future is
    /// dropped mid-read (a lapsed `tokio::time::timeout`, for example),
    /// calling `read` again resumes from the partially read bytes instead
    /// of desynchronizing the stream.
    pub async fn read(&mut self) -> Result<NetworkMessage, CodecError> {
        loop {
            // Header complete but not yet examined: validate it before
            // growing the buffer for the payload.
            if self.partial.payload_len.is_none() && self.partial.filled == HEADER_SIZE {
                if self.partial.buffer[..4] != self.network_magic.to_bytes() {
                    return Err(CodecError::MagicMismatch);
                }

                let mut declared = [0u8; 4];
                declared.copy_from_slice(
                    &self.partial.buffer[PAYLOAD_LENGTH_OFFSET..PAYLOAD_LENGTH_OFFSET + 4],
                );
                let payload_len = u32::from_le_bytes(declared) as usize;
                if payload_len > MAX_PAYLOAD_LENGTH {
                    return Err(CodecError::OversizedPayload(payload_len));
                }

                self.partial.payload_len = Some(payload_len);
                self.partial.buffer.resize(HEADER_SIZE + payload_len, 0);
            }

            // Frame complete: decode it and reset for the next message.
            let complete = self
                .partial
                .payload_len
                .is_some_and(|len| self.partial.filled == HEADER_SIZE + len);
            if complete {
                // Consensus decoding verifies the checksum and the
                // ASCII command string.
                let raw_msg: RawNetworkMessage = encode::deserialize(&self.partial.buffer)?;
                self.partial = PartialRead::new();

                let message = raw_msg.payload().clone();
                match &message {
                    NetworkMessage::Addr(entries) if entries.len() > MAX_ADDR_PER_MESSAGE => {
                        return Err(CodecError::OversizedAddressMessage(entries.len()));
                    }
                    NetworkMessage::AddrV2(entries) if entries.len() > MAX_ADDR_PER_MESSAGE => {
                        return Err(CodecError::OversizedAddressMessage(entries.len()));
                    }
                    _ => {}
                }
                return Ok(message);
            }

            // Otherwise pull more bytes; the buffer length is the target
            // for the current phase (header, or header plus payload).
            let n = self
                .reader
                .read(&mut self.partial.buffer[self.partial.filled..])
                .await?;
            if n == 0 {
                return Err(CodecError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed the stream mid-message",
                )));
            }
            self.partial.filled += n;
        }
    }

    /// Consume the reader half, returning the underlying IO reader. Any
    /// partially read message is discarded.
    pub fn into_inner(self) -> R {
        self.reader
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::{sha256d, Hash};
    use bitcoin::p2p::address::{AddrV2, AddrV2Message};
    use bitcoin::p2p::ServiceFlags;
    use std::net::Ipv4Addr;
    use tokio_test::io::Builder as MockIoBuilder;

    fn create_test_message(network_magic: Magic, payload: NetworkMessage) -> Vec<u8> {
        let raw_msg = RawNetworkMessage::new(network_magic, payload);
        encode::serialize(&raw_msg)
    }

    #[tokio::test]
    async fn test_basic_message_receive() {
        let message_bytes = create_test_message(Magic::BITCOIN, NetworkMessage::Ping(42));
        let mock_reader = MockIoBuilder::new().read(&message_bytes).build();
        let mut reader = MessageReader::new(Magic::BITCOIN, mock_reader);

        let received = reader.read().await.unwrap();
        match received {
            NetworkMessage::Ping(nonce) => assert_eq!(nonce, 42),
            _ => panic!("Expected Ping message, got {received:?}"),
        }
    }

    #[tokio::test]
    async fn test_write_message() {
        let mut writer = MessageWriter::new(Magic::BITCOIN, Vec::new());
        writer.write(NetworkMessage::Ping(42)).await.unwrap();

        let expected = create_test_message(Magic::BITCOIN, NetworkMessage::Ping(42));
        assert_eq!(writer.into_inner(), expected);
    }

    #[tokio::test]
    async fn test_magic_mismatch() {
        let message_bytes = create_test_message(Magic::SIGNET, NetworkMessage::Ping(42));
        let mock_reader = MockIoBuilder::new().read(&message_bytes).build();
        let mut reader = MessageReader::new(Magic::BITCOIN, mock_reader);

        let result = reader.read().await;
        assert!(matches!(result, Err(CodecError::MagicMismatch)));
    }

    #[tokio::test]
    async fn test_checksum_mismatch() {
        let mut message_bytes = create_test_message(Magic::BITCOIN, NetworkMessage::Ping(42));
        // Corrupt the first checksum byte (header offset 20).
        message_bytes[20] ^= 0xff;
        let mock_reader = MockIoBuilder::new().read(&message_bytes).build();
        let mut reader = MessageReader::new(Magic::BITCOIN, mock_reader);

        let result = reader.read().await;
        assert!(matches!(result, Err(CodecError::Deserialize(_))));
    }

    #[tokio::test]
    async fn test_oversized_payload_rejected() {
        let mut header = [0u8; HEADER_SIZE];
        header[0..4].copy_from_slice(&Magic::BITCOIN.to_bytes());
        header[4..8].copy_from_slice(b"ping");
        let payload_len: u32 = (MAX_PAYLOAD_LENGTH as u32) + 1;
        header[PAYLOAD_LENGTH_OFFSET..PAYLOAD_LENGTH_OFFSET + 4]
            .copy_from_slice(&payload_len.to_le_bytes());

        let mock_reader = MockIoBuilder::new().read(&header).build();
        let mut reader = MessageReader::new(Magic::BITCOIN, mock_reader);

        let result = reader.read().await;
        assert!(matches!(result, Err(CodecError::OversizedPayload(_))));
    }

    #[tokio::test]
    async fn test_invalid_payload_rejected() {
        // A valid header framing an undecodable ping payload.
        let mut header = [0u8; HEADER_SIZE];
        header[0..4].copy_from_slice(&Magic::BITCOIN.to_bytes());
        header[4..8].copy_from_slice(b"ping");
        let payload = vec![0xFFu8; 6];
        let payload_len: u32 = payload.len() as u32;
        header[PAYLOAD_LENGTH_OFFSET..PAYLOAD_LENGTH_OFFSET + 4]
            .copy_from_slice(&payload_len.to_le_bytes());
        let checksum = sha256d::Hash::hash(&payload);
        header[20..24].copy_from_slice(&checksum.as_byte_array()[..4]);

        let mut test_data = Vec::new();
        test_data.extend_from_slice(&header);
        test_data.extend_from_slice(&payload);
        let mock_reader = MockIoBuilder::new().read(&test_data).build();
        let mut reader = MessageReader::new(Magic::BITCOIN, mock_reader);

        let result = reader.read().await;
        assert!(matches!(result, Err(CodecError::Deserialize(_))));
    }

    fn addr_v2_entries(count: usize) -> Vec<AddrV2Message> {
        (0..count)
            .map(|i| AddrV2Message {
                time: 1_700_000_000,
                services: ServiceFlags::NETWORK,
                addr: AddrV2::Ipv4(Ipv4Addr::new(10, 0, (i / 256) as u8, (i % 256) as u8)),
                port: 8333,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_addr_count_at_limit_accepted() {
        let message_bytes = create_test_message(
            Magic::BITCOIN,
            NetworkMessage::AddrV2(addr_v2_entries(MAX_ADDR_PER_MESSAGE)),
        );
        let mock_reader = MockIoBuilder::new().read(&message_bytes).build();
        let mut reader = MessageReader::new(Magic::BITCOIN, mock_reader);

        match reader.read().await.unwrap() {
            NetworkMessage::AddrV2(entries) => assert_eq!(entries.len(), MAX_ADDR_PER_MESSAGE),
            other => panic!("Expected AddrV2 message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_addr_count_above_limit_rejected() {
        let message_bytes = create_test_message(
            Magic::BITCOIN,
            NetworkMessage::AddrV2(addr_v2_entries(MAX_ADDR_PER_MESSAGE + 1)),
        );
        let mock_reader = MockIoBuilder::new().read(&message_bytes).build();
        let mut reader = MessageReader::new(Magic::BITCOIN, mock_reader);

        let result = reader.read().await;
        assert!(matches!(
            result,
            Err(CodecError::OversizedAddressMessage(n)) if n == MAX_ADDR_PER_MESSAGE + 1
        ));
    }

    #[tokio::test]
    async fn test_addrv2_families_round_trip() {
        use crate::address::PeerAddress;

        // One entry per address family the crawler supports; each must
        // survive the encoder/decoder pair with its identity intact.
        let originals = vec![
            PeerAddress::new(AddrV2::Ipv4(Ipv4Addr::new(1, 2, 3, 4)), 8333).unwrap(),
            PeerAddress::new(AddrV2::Ipv6("2001:db8::1".parse().unwrap()), 8333).unwrap(),
            PeerAddress::new(AddrV2::TorV3([7u8; 32]), 8333).unwrap(),
            PeerAddress::new(AddrV2::I2p([42u8; 32]), 0).unwrap(),
            PeerAddress::new(AddrV2::Cjdns("fc00::1".parse().unwrap()), 8333).unwrap(),
        ];
        let entries: Vec<AddrV2Message> = originals
            .iter()
            .map(|address| AddrV2Message {
                time: 1_700_000_000,
                services: ServiceFlags::NETWORK,
                addr: address.addr_v2().clone(),
                port: address.port(),
            })
            .collect();

        let message_bytes =
            create_test_message(Magic::BITCOIN, NetworkMessage::AddrV2(entries));
        let mock_reader = MockIoBuilder::new().read(&message_bytes).build();
        let mut reader = MessageReader::new(Magic::BITCOIN, mock_reader);

        let NetworkMessage::AddrV2(decoded) = reader.read().await.unwrap() else {
            panic!("Expected AddrV2 message");
        };
        let round_tripped: Vec<PeerAddress> = decoded
            .into_iter()
            .map(|entry| PeerAddress::new(entry.addr, entry.port).unwrap())
            .collect();
        assert_eq!(round_tripped, originals);
    }

    #[tokio::test]
    async fn test_unexpected_eof_during_header() {
        let partial_data = vec![0; 10];
        let mock_reader = MockIoBuilder::new().read(&partial_data).build();
        let mut reader = MessageReader::new(Magic::BITCOIN, mock_reader);

        let result = reader.read().await;
        assert!(matches!(result, Err(CodecError::Io(_))));
    }

    #[tokio::test]
    async fn test_unexpected_eof_during_payload() {
        let mut message_bytes = create_test_message(Magic::BITCOIN, NetworkMessage::Ping(42));
        // Truncate the message to include the header but not the full payload.
        message_bytes.truncate(HEADER_SIZE + 2);

        let mock_reader = MockIoBuilder::new().read(&message_bytes).build();
        let mut reader = MessageReader::new(Magic::BITCOIN, mock_reader);

        let result = reader.read().await;
        assert!(matches!(result, Err(CodecError::Io(_))));
    }

    #[tokio::test]
    async fn test_cancellation_safety() {
        let message_bytes = create_test_message(Magic::BITCOIN, NetworkMessage::Ping(42));

        // Deliver the message one byte at a time to force the state machine
        // through every partial-read suspension.
        let mut mock_reader = MockIoBuilder::new();
        for i in 0..message_bytes.len() {
            mock_reader.read(&message_bytes[i..i + 1]);
        }

        let mut reader = MessageReader::new(Magic::BITCOIN, mock_reader.build());
        let received = reader.read().await.unwrap();

        match received {
            NetworkMessage::Ping(nonce) => assert_eq!(nonce, 42),
            _ => panic!("Expected Ping message, got {received:?}"),
        }
    }

    #[tokio::test]
    async fn test_multiple_messages() {
        let message1 = create_test_message(Magic::BITCOIN, NetworkMessage::Ping(42));
        let message2 = create_test_message(Magic::BITCOIN, NetworkMessage::Pong(43));

        let mut combined = Vec::new();
        combined.extend_from_slice(&message1);
        combined.extend_from_slice(&message2);

        let mock_reader = MockIoBuilder::new().read(&combined).build();
        let mut reader = MessageReader::new(Magic::BITCOIN, mock_reader);

        assert!(matches!(
            reader.read().await.unwrap(),
            NetworkMessage::Ping(42)
        ));
        assert!(matches!(
            reader.read().await.unwrap(),
            NetworkMessage::Pong(43)
        ));
    }

    #[tokio::test]
    async fn test_unknown_command_skipped_by_length() {
        // An unknown command decodes as NetworkMessage::Unknown; the framing
        // layer consumes exactly the declared payload so the next message
        // stays aligned.
        let mut header = [0u8; HEADER_SIZE];
        header[0..4].copy_from_slice(&Magic::BITCOIN.to_bytes());
        header[4..11].copy_from_slice(b"bogucmd");
        let payload = vec![0xABu8; 9];
        header[PAYLOAD_LENGTH_OFFSET..PAYLOAD_LENGTH_OFFSET + 4]
            .copy_from_slice(&(payload.len() as u32).to_le_bytes());
        let checksum = sha256d::Hash::hash(&payload);
        header[20..24].copy_from_slice(&checksum.as_byte_array()[..4]);

        let mut test_data = Vec::new();
        test_data.extend_from_slice(&header);
        test_data.extend_from_slice(&payload);
        test_data.extend_from_slice(&create_test_message(
            Magic::BITCOIN,
            NetworkMessage::Ping(7),
        ));

        let mock_reader = MockIoBuilder::new().read(&test_data).build();
        let mut reader = MessageReader::new(Magic::BITCOIN, mock_reader);

        assert!(matches!(
            reader.read().await.unwrap(),
            NetworkMessage::Unknown { .. }
        ));
        assert!(matches!(
            reader.read().await.unwrap(),
            NetworkMessage::Ping(7)
        ));
    }
}
