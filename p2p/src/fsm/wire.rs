//! Message framing over the raw peer byte stream.
//!
//! Locates the network magic, validates the header checksum and splits the
//! stream into complete messages, which are then decoded through the
//! consensus codec. Bytes that cannot be framed are discarded without ever
//! affecting other peers.
use log::*;
use thiserror::Error;

use finney_common::bitcoin::consensus::encode;
use finney_common::bitcoin::network::message::RawNetworkMessage;
use finney_common::bitcoin_hashes::{sha256d, Hash};

/// Size of a message header on the wire: magic, command, length, checksum.
pub const HEADER_SIZE: usize = 24;
/// Capacity of the per-peer stream buffer.
pub const STREAM_BUFFER_SIZE: usize = 64 * 1024;
/// Maximum payload length that fits the stream buffer alongside its header.
pub const MAX_PAYLOAD_SIZE: usize = STREAM_BUFFER_SIZE - HEADER_SIZE;

/// A framing or decoding error.
///
/// Fatal errors mean the peer is malicious or desynced beyond recovery and
/// must be closed; the others are local to a single frame.
#[derive(Debug, Error)]
pub enum Error {
    /// The stream buffer would exceed its fixed capacity.
    #[error("stream buffer overflow: {0} bytes over capacity")]
    BufferOverflow(usize),
    /// The header announces a payload that can never fit the buffer.
    #[error("payload length {0} exceeds the stream buffer capacity")]
    OversizedPayload(usize),
    /// The framed bytes don't decode into a known message shape.
    #[error("message decode error: {0}")]
    Decode(#[from] encode::Error),
}

impl Error {
    /// Whether the peer connection can survive this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::BufferOverflow(_) | Self::OversizedPayload(_))
    }
}

/// Splits a peer's byte stream into checksum-valid messages.
#[derive(Debug)]
pub struct StreamDecoder {
    buf: Vec<u8>,
    magic: u32,
}

impl StreamDecoder {
    /// Create a decoder for the given network magic.
    pub fn new(magic: u32) -> Self {
        Self {
            buf: Vec::with_capacity(STREAM_BUFFER_SIZE),
            magic,
        }
    }

    /// Number of bytes currently buffered.
    pub fn unconsumed(&self) -> usize {
        self.buf.len()
    }

    /// Append a newly received segment to the stream buffer.
    pub fn input(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let len = self.buf.len() + bytes.len();

        if len > STREAM_BUFFER_SIZE {
            return Err(Error::BufferOverflow(len - STREAM_BUFFER_SIZE));
        }
        self.buf.extend_from_slice(bytes);

        Ok(())
    }

    /// Extract the next complete message from the buffer, if any.
    ///
    /// Call in a loop after every [`StreamDecoder::input`] until it returns
    /// `Ok(None)`. A non-fatal `Err` consumes the offending frame; decoding
    /// can continue with the next call.
    pub fn decode_next(&mut self) -> Result<Option<RawNetworkMessage>, Error> {
        let magic = self.magic.to_le_bytes();

        loop {
            // Align the first occurrence of the magic to offset zero,
            // discarding any preceding noise.
            match find(&self.buf, &magic) {
                None => return Ok(None),
                Some(0) => {}
                Some(start) => {
                    debug!(target: "p2p", "Discarding {} bytes of unframed input", start);
                    self.buf.drain(..start);
                }
            }
            if self.buf.len() < HEADER_SIZE {
                return Ok(None);
            }
            let length =
                u32::from_le_bytes([self.buf[16], self.buf[17], self.buf[18], self.buf[19]])
                    as usize;
            if length > MAX_PAYLOAD_SIZE {
                return Err(Error::OversizedPayload(length));
            }
            let total = HEADER_SIZE + length;
            if self.buf.len() < total {
                return Ok(None);
            }

            let checksum = sha256d::Hash::hash(&self.buf[HEADER_SIZE..total]);
            if checksum[..4] != self.buf[20..24] {
                // The magic was spurious. Skip one byte past it and rescan.
                debug!(target: "p2p", "Checksum mismatch, resuming scan past stray magic");
                self.buf.drain(..1);

                continue;
            }

            let frame: Vec<u8> = self.buf.drain(..total).collect();

            return match encode::deserialize::<RawNetworkMessage>(&frame) {
                Ok(message) => Ok(Some(message)),
                // The frame has already been consumed; the caller drops it
                // and carries on with the stream.
                Err(err) => Err(Error::Decode(err)),
            };
        }
    }
}

/// Encode an outbound message into its wire framing.
pub fn serialize(message: &RawNetworkMessage) -> Vec<u8> {
    encode::serialize(message)
}

fn find(haystack: &[u8], needle: &[u8; 4]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    use quickcheck_macros::quickcheck;

    use finney_common::bitcoin::blockdata::constants::genesis_block;
    use finney_common::bitcoin::consensus::encode::serialize as consensus_serialize;
    use finney_common::bitcoin::network::address::Address;
    use finney_common::bitcoin::network::constants::ServiceFlags;
    use finney_common::bitcoin::network::message::NetworkMessage;
    use finney_common::bitcoin::network::message_blockdata::{
        GetBlocksMessage, GetHeadersMessage, Inventory,
    };
    use finney_common::bitcoin::network::message_network::{Reject, RejectReason, VersionMessage};
    use finney_common::block::BlockHash;
    use finney_common::network::Network;

    fn raw(payload: NetworkMessage) -> RawNetworkMessage {
        RawNetworkMessage {
            magic: Network::Mainnet.magic(),
            payload,
        }
    }

    fn decoder() -> StreamDecoder {
        StreamDecoder::new(Network::Mainnet.magic())
    }

    fn version() -> NetworkMessage {
        let addr = ([203, 0, 113, 5], 8333).into();

        NetworkMessage::Version(VersionMessage {
            version: 70015,
            services: ServiceFlags::NETWORK,
            timestamp: 1_700_000_000,
            receiver: Address::new(&addr, ServiceFlags::NONE),
            sender: Address::new(&addr, ServiceFlags::NETWORK),
            nonce: 31,
            user_agent: "/finney:0.1.0/".to_owned(),
            start_height: 212,
            relay: false,
        })
    }

    /// Every supported command round-trips through the codec.
    #[test]
    fn test_roundtrip() {
        let genesis = genesis_block(Network::Mainnet.into());
        let hash = genesis.block_hash();
        let messages = [
            version(),
            NetworkMessage::Verack,
            NetworkMessage::Ping(42),
            NetworkMessage::Pong(42),
            NetworkMessage::Addr(vec![(
                1_700_000_000,
                Address::new(&([203, 0, 113, 7], 8333).into(), ServiceFlags::NETWORK),
            )]),
            NetworkMessage::GetAddr,
            NetworkMessage::Inv(vec![Inventory::Block(hash)]),
            NetworkMessage::GetData(vec![Inventory::Block(hash)]),
            NetworkMessage::GetHeaders(GetHeadersMessage::new(vec![hash], BlockHash::all_zeros())),
            NetworkMessage::GetBlocks(GetBlocksMessage::new(vec![hash], BlockHash::all_zeros())),
            NetworkMessage::SendHeaders,
            NetworkMessage::Headers(vec![genesis.header]),
            NetworkMessage::Block(genesis.clone()),
            NetworkMessage::Reject(Reject {
                message: "block".into(),
                ccode: RejectReason::Invalid,
                reason: "invalid".into(),
                hash: sha256d::Hash::all_zeros(),
            }),
        ];

        for message in messages {
            let frame = serialize(&raw(message.clone()));
            let mut decoder = decoder();

            decoder.input(&frame).unwrap();

            let decoded = decoder.decode_next().unwrap().expect("a complete frame");
            assert_eq!(decoded.payload, message);
            assert_eq!(serialize(&decoded), frame);
            assert_eq!(decoder.unconsumed(), 0);
        }
    }

    /// Frames interleaved with magic-free noise are all re-emitted, in
    /// order, for any chunking of the input.
    #[quickcheck]
    fn prop_frames_reemitted(chunk: u8, noise: u8) -> bool {
        let chunk = chunk as usize % 64 + 1;
        let messages = vec![
            NetworkMessage::Ping(1),
            NetworkMessage::Pong(1),
            version(),
            NetworkMessage::GetAddr,
        ];
        let mut stream = Vec::new();

        for message in &messages {
            // 0x00 can never contain the network magic.
            stream.extend(std::iter::repeat(0u8).take(noise as usize));
            stream.extend(serialize(&raw(message.clone())));
        }

        let mut decoder = decoder();
        let mut decoded = Vec::new();

        for segment in stream.chunks(chunk) {
            decoder.input(segment).unwrap();

            while let Some(message) = decoder.decode_next().unwrap() {
                decoded.push(message.payload);
            }
        }
        decoded == messages
    }

    /// A corrupt checksum drops only the offending frame; the next valid
    /// frame is still decoded and answered.
    #[test]
    fn test_checksum_mismatch_resync() {
        let mut bad = serialize(&raw(NetworkMessage::Ping(7)));
        let good = serialize(&raw(NetworkMessage::Ping(8)));

        // Corrupt one payload byte so the checksum no longer matches.
        *bad.last_mut().unwrap() ^= 0xff;

        let mut decoder = decoder();
        decoder.input(&bad).unwrap();
        decoder.input(&good).unwrap();

        let decoded = decoder.decode_next().unwrap().expect("the valid frame");
        assert_eq!(decoded.payload, NetworkMessage::Ping(8));
        assert!(decoder.decode_next().unwrap().is_none());
    }

    /// A payload of exactly the buffer capacity minus the header size is
    /// accepted; one byte more is a fatal error.
    #[test]
    fn test_payload_size_boundary() {
        fn frame(length: usize) -> Vec<u8> {
            let payload = vec![0u8; length];
            let checksum = sha256d::Hash::hash(&payload);
            let mut frame = Vec::new();

            frame.extend(Network::Mainnet.magic().to_le_bytes());
            frame.extend(*b"bulk\0\0\0\0\0\0\0\0");
            frame.extend((length as u32).to_le_bytes());
            frame.extend(&checksum[..4]);
            frame.extend(&payload);
            frame
        }

        let mut decoder = decoder();
        decoder.input(&frame(MAX_PAYLOAD_SIZE)).unwrap();

        match decoder.decode_next().unwrap() {
            Some(RawNetworkMessage {
                payload: NetworkMessage::Unknown { payload, .. },
                ..
            }) => assert_eq!(payload.len(), MAX_PAYLOAD_SIZE),
            other => panic!("expected an unknown bulk message, got {:?}", other),
        }

        // One byte larger: the header alone is enough to reject the peer.
        let oversized = frame(MAX_PAYLOAD_SIZE + 1);
        let mut decoder = StreamDecoder::new(Network::Mainnet.magic());
        decoder.input(&oversized[..HEADER_SIZE]).unwrap();

        match decoder.decode_next() {
            Err(err @ Error::OversizedPayload(_)) => assert!(err.is_fatal()),
            other => panic!("expected an oversized-payload error, got {:?}", other),
        }
    }

    /// Overflowing the fixed stream buffer is fatal.
    #[test]
    fn test_buffer_overflow() {
        let mut decoder = decoder();

        decoder.input(&vec![0u8; STREAM_BUFFER_SIZE]).unwrap();
        match decoder.input(&[0u8]) {
            Err(err @ Error::BufferOverflow(_)) => assert!(err.is_fatal()),
            other => panic!("expected a buffer overflow, got {:?}", other),
        }
    }

    /// Partial frames are held until the remaining bytes arrive.
    #[test]
    fn test_partial_frame() {
        let frame = serialize(&raw(version()));
        let mut decoder = decoder();

        decoder.input(&frame[..HEADER_SIZE - 1]).unwrap();
        assert!(decoder.decode_next().unwrap().is_none());

        decoder.input(&frame[HEADER_SIZE - 1..frame.len() - 1]).unwrap();
        assert!(decoder.decode_next().unwrap().is_none());

        decoder.input(&frame[frame.len() - 1..]).unwrap();
        assert_eq!(
            decoder.decode_next().unwrap().expect("a complete frame").payload,
            version()
        );
    }

    /// The `headers` payload carries its per-header transaction count on the
    /// wire; make sure it survives the consensus codec both ways.
    #[test]
    fn test_headers_roundtrip_consensus() {
        let header = genesis_block(Network::Mainnet.into()).header;
        let message = raw(NetworkMessage::Headers(vec![header, header]));
        let frame = consensus_serialize(&message);
        let mut decoder = decoder();

        decoder.input(&frame).unwrap();
        assert_eq!(decoder.decode_next().unwrap().unwrap().payload, message.payload);
    }
}
