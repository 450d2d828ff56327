// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::{convert::TryFrom, net::IpAddr};

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    content::{BlockRange, FileDescriptor},
    ids::{ContentHash, JobId},
    peer::PeerAddr,
};

fn to_cbor<T: Serialize>(value: &T) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)?;
    Ok(buf)
}

fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> anyhow::Result<T> {
    Ok(ciborium::from_reader(bytes)?)
}

/// One message on the wire: who sent it, what it is, and the CBOR payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: PeerAddr,
    pub command: u16,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

/// Default upper bound for serialized envelope size accepted from the wire.
pub const MAX_ENVELOPE_BYTES: usize = 2 * 1024 * 1024;
/// Default upper bound for decoded payload bytes accepted from the wire.
pub const MAX_ENVELOPE_PAYLOAD_BYTES: usize = 1024 * 1024;

impl Envelope {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        to_cbor(self)
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        Self::decode_with_limits(bytes, MAX_ENVELOPE_BYTES, MAX_ENVELOPE_PAYLOAD_BYTES)
    }

    pub fn decode_with_limits(
        bytes: &[u8],
        max_envelope_bytes: usize,
        max_payload_bytes: usize,
    ) -> anyhow::Result<Self> {
        if bytes.len() > max_envelope_bytes {
            anyhow::bail!(
                "envelope exceeds max size: {} > {}",
                bytes.len(),
                max_envelope_bytes
            );
        }

        let envelope: Self = from_cbor(bytes)?;
        if envelope.payload.len() > max_payload_bytes {
            anyhow::bail!(
                "envelope payload exceeds max size: {} > {}",
                envelope.payload.len(),
                max_payload_bytes
            );
        }
        Ok(envelope)
    }

    pub fn command(&self) -> anyhow::Result<Command> {
        Command::try_from(self.command)
    }

    /// Decode the envelope payload into a typed protocol message.
    pub fn decode_typed(&self) -> anyhow::Result<WirePayload> {
        WirePayload::decode(self.command, &self.payload)
    }

    /// Build an envelope from a typed protocol payload.
    pub fn from_typed(sender: PeerAddr, payload: &WirePayload) -> anyhow::Result<Self> {
        Ok(Self {
            sender,
            command: u16::from(payload.command()),
            payload: payload.encode()?,
        })
    }
}

/// Command tags. The ordinals are part of the wire format and must never be
/// renumbered; new commands go at the end.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Opens a link; first message from the dialing side.
    ConnectionRequest = 0,
    /// Accepts a link; first message from the listening side.
    ConnectionAck = 1,
    /// Diagnostic message written back unchanged.
    Echo = 2,
    /// Closes the link.
    Terminate = 3,
    /// Answer to a word search.
    FileSearchResult = 4,
    /// Case-insensitive file-name query.
    WordSearchMessage = 5,
    /// Single-block fetch request.
    DownloadMessage = 6,
    /// Single-block payload.
    DownloadResult = 7,
}

impl Command {
    pub const ALL: [Self; 8] = [
        Self::ConnectionRequest,
        Self::ConnectionAck,
        Self::Echo,
        Self::Terminate,
        Self::FileSearchResult,
        Self::WordSearchMessage,
        Self::DownloadMessage,
        Self::DownloadResult,
    ];
}

impl From<Command> for u16 {
    fn from(value: Command) -> Self {
        value as u16
    }
}

impl TryFrom<u16> for Command {
    type Error = anyhow::Error;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::ALL
            .get(usize::from(value))
            .copied()
            .ok_or_else(|| anyhow::anyhow!("unknown command {value}"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub ip: IpAddr,
    pub port: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionAck {}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Echo {
    pub text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Terminate {}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WordSearchMessage {
    pub term: String,
}

/// One file reported by one peer for one query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchHit {
    pub descriptor: FileDescriptor,
    pub reporter: PeerAddr,
    pub query: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileSearchResult {
    pub hits: Vec<SearchHit>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownloadMessage {
    pub block: BlockRange,
    pub file_hash: ContentHash,
    pub job_id: JobId,
    pub block_index: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownloadResult {
    pub file_hash: ContentHash,
    #[serde(with = "serde_bytes")]
    pub bytes: Vec<u8>,
    pub block_index: u32,
    pub job_id: JobId,
    pub sender: PeerAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WirePayload {
    ConnectionRequest(ConnectionRequest),
    ConnectionAck(ConnectionAck),
    Echo(Echo),
    Terminate(Terminate),
    FileSearchResult(FileSearchResult),
    WordSearchMessage(WordSearchMessage),
    DownloadMessage(DownloadMessage),
    DownloadResult(DownloadResult),
}

impl WirePayload {
    pub fn command(&self) -> Command {
        match self {
            Self::ConnectionRequest(_) => Command::ConnectionRequest,
            Self::ConnectionAck(_) => Command::ConnectionAck,
            Self::Echo(_) => Command::Echo,
            Self::Terminate(_) => Command::Terminate,
            Self::FileSearchResult(_) => Command::FileSearchResult,
            Self::WordSearchMessage(_) => Command::WordSearchMessage,
            Self::DownloadMessage(_) => Command::DownloadMessage,
            Self::DownloadResult(_) => Command::DownloadResult,
        }
    }

    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        match self {
            Self::ConnectionRequest(msg) => to_cbor(msg),
            Self::ConnectionAck(msg) => to_cbor(msg),
            Self::Echo(msg) => to_cbor(msg),
            Self::Terminate(msg) => to_cbor(msg),
            Self::FileSearchResult(msg) => to_cbor(msg),
            Self::WordSearchMessage(msg) => to_cbor(msg),
            Self::DownloadMessage(msg) => to_cbor(msg),
            Self::DownloadResult(msg) => to_cbor(msg),
        }
    }

    pub fn decode(command: u16, payload: &[u8]) -> anyhow::Result<Self> {
        Ok(match Command::try_from(command)? {
            Command::ConnectionRequest => Self::ConnectionRequest(from_cbor(payload)?),
            Command::ConnectionAck => Self::ConnectionAck(from_cbor(payload)?),
            Command::Echo => Self::Echo(from_cbor(payload)?),
            Command::Terminate => Self::Terminate(from_cbor(payload)?),
            Command::FileSearchResult => Self::FileSearchResult(from_cbor(payload)?),
            Command::WordSearchMessage => Self::WordSearchMessage(from_cbor(payload)?),
            Command::DownloadMessage => Self::DownloadMessage(from_cbor(payload)?),
            Command::DownloadResult => Self::DownloadResult(from_cbor(payload)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::describe_bytes;

    fn sender() -> PeerAddr {
        "10.0.0.9:7001".parse().expect("valid peer")
    }

    #[test]
    fn command_ordinals_are_wire_stable() {
        let ordinals = Command::ALL.iter().map(|c| u16::from(*c)).collect::<Vec<_>>();
        assert_eq!(ordinals, (0..8).collect::<Vec<u16>>());
        assert_eq!(Command::try_from(2).expect("echo"), Command::Echo);
        assert_eq!(
            Command::try_from(6).expect("download"),
            Command::DownloadMessage
        );
        assert!(Command::try_from(8).is_err());
    }

    #[test]
    fn envelope_roundtrip_with_search_hits() {
        let descriptor = describe_bytes("holiday.mp4", &[3u8; 25_600]);
        let payload = WirePayload::FileSearchResult(FileSearchResult {
            hits: vec![SearchHit {
                descriptor: descriptor.clone(),
                reporter: sender(),
                query: "holiday".into(),
            }],
        });
        let envelope = Envelope::from_typed(sender(), &payload).expect("envelope");
        assert_eq!(envelope.command, Command::FileSearchResult as u16);

        let decoded = Envelope::decode(&envelope.encode().expect("encode")).expect("decode");
        assert_eq!(decoded.sender, sender());
        let WirePayload::FileSearchResult(result) = decoded.decode_typed().expect("typed") else {
            panic!("unexpected payload");
        };
        assert_eq!(result.hits[0].descriptor, descriptor);
        assert_eq!(result.hits[0].descriptor.block_count(), 3);
    }

    #[test]
    fn hit_for_a_huge_file_stays_small_on_the_wire() {
        let size = 400 * 1024 * 1024 * 1024;
        let descriptor = FileDescriptor::new("archive.tar", size, ContentHash([7u8; 32]));
        let payload = WirePayload::FileSearchResult(FileSearchResult {
            hits: vec![SearchHit {
                descriptor: descriptor.clone(),
                reporter: sender(),
                query: "archive".into(),
            }],
        });
        let envelope = Envelope::from_typed(sender(), &payload).expect("envelope");
        assert!(envelope.payload.len() < 512, "payload {} bytes", envelope.payload.len());

        let decoded = Envelope::decode(&envelope.encode().expect("encode")).expect("decode");
        let WirePayload::FileSearchResult(result) = decoded.decode_typed().expect("typed") else {
            panic!("unexpected payload");
        };
        let received = &result.hits[0].descriptor;
        assert_eq!(received, &descriptor);
        assert!(received.is_consistent());
        assert_eq!(received.block_count(), 41_943_040);
        let last = received
            .block(received.block_count() - 1)
            .expect("last block");
        assert_eq!(last.end, size);
    }

    #[test]
    fn block_bytes_are_encoded_as_cbor_byte_string() {
        let result = DownloadResult {
            file_hash: ContentHash([9u8; 32]),
            bytes: vec![0xAB; 64],
            block_index: 4,
            job_id: JobId([1u8; 16]),
            sender: sender(),
        };
        let encoded = to_cbor(&result).expect("encode");
        let value: ciborium::Value = from_cbor(&encoded).expect("value");
        let map = value.as_map().expect("map");
        let bytes = map
            .iter()
            .find(|(k, _)| k.as_text() == Some("bytes"))
            .map(|(_, v)| v)
            .expect("bytes field");
        assert_eq!(bytes.as_bytes().map(Vec::len), Some(64));
    }

    #[test]
    fn unknown_command_decodes_as_envelope_but_not_typed() {
        let envelope = Envelope {
            sender: sender(),
            command: 42,
            payload: vec![],
        };
        let decoded = Envelope::decode(&envelope.encode().expect("encode")).expect("decode");
        assert!(decoded.command().is_err());
        let err = decoded.decode_typed().expect_err("unknown command");
        assert!(err.to_string().contains("unknown command 42"));
    }

    #[test]
    fn decode_rejects_oversized_payload() {
        let envelope = Envelope {
            sender: sender(),
            command: Command::Echo as u16,
            payload: vec![0u8; 128],
        };
        let encoded = envelope.encode().expect("encode");
        let err = Envelope::decode_with_limits(&encoded, 4096, 64).expect_err("too large");
        assert!(err.to_string().contains("payload exceeds max size"));

        let err = Envelope::decode_with_limits(&encoded, 16, 4096).expect_err("too large");
        assert!(err.to_string().contains("envelope exceeds max size"));
    }
}
