// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    peer::PeerAddr,
    wire::{
        Command, ConnectionAck, ConnectionRequest, Envelope, MAX_ENVELOPE_BYTES,
        MAX_ENVELOPE_PAYLOAD_BYTES, WirePayload,
    },
};

/// Upper bound on how long either side waits for the other's handshake
/// message before giving up on the connection.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Dialing side: announce ourselves and require a `ConnectionAck` back.
///
/// Any other reply is a protocol violation and the connection must be
/// dropped by the caller.
pub async fn handshake_initiator<S>(io: &mut S, local: PeerAddr) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = Envelope::from_typed(
        local,
        &WirePayload::ConnectionRequest(ConnectionRequest {
            ip: local.ip,
            port: local.port,
        }),
    )?;
    write_envelope(io, &request).await?;

    let reply = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_envelope(io))
        .await
        .context("handshake timed out")??;
    if reply.command != Command::ConnectionAck as u16 {
        anyhow::bail!(
            "connection refused: expected ConnectionAck, got command {}",
            reply.command
        );
    }
    Ok(())
}

/// Listening side: require a `ConnectionRequest` first and acknowledge it.
/// Returns the address the remote announced for itself.
pub async fn handshake_responder<S>(io: &mut S, local: PeerAddr) -> anyhow::Result<PeerAddr>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_envelope(io))
        .await
        .context("handshake timed out")??;
    let WirePayload::ConnectionRequest(request) = first.decode_typed().with_context(|| {
        format!(
            "protocol violation: undecodable handshake command {}",
            first.command
        )
    })?
    else {
        anyhow::bail!(
            "protocol violation: expected ConnectionRequest, got command {}",
            first.command
        );
    };

    let ack = Envelope::from_typed(local, &WirePayload::ConnectionAck(ConnectionAck {}))?;
    write_envelope(io, &ack).await?;
    Ok(PeerAddr::new(request.ip, request.port))
}

pub async fn write_envelope<S>(io: &mut S, envelope: &Envelope) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    let encoded = envelope.encode()?;
    if encoded.len() > MAX_ENVELOPE_BYTES {
        anyhow::bail!("envelope exceeds max size");
    }
    write_frame(io, &encoded).await
}

pub async fn read_envelope<S>(io: &mut S) -> anyhow::Result<Envelope>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let encoded = read_frame(io, MAX_ENVELOPE_BYTES).await?;
    Envelope::decode_with_limits(&encoded, MAX_ENVELOPE_BYTES, MAX_ENVELOPE_PAYLOAD_BYTES)
}

async fn write_frame<S>(io: &mut S, data: &[u8]) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    let len = u32::try_from(data.len()).context("frame too large for u32 length prefix")?;
    io.write_u32(len).await?; // big-endian by tokio default
    io.write_all(data).await?;
    io.flush().await?;
    Ok(())
}

async fn read_frame<S>(io: &mut S, max_len: usize) -> anyhow::Result<Vec<u8>>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let len = io.read_u32().await? as usize; // big-endian by tokio default
    if len > max_len {
        anyhow::bail!("frame exceeds max size");
    }
    let mut data = vec![0u8; len];
    io.read_exact(&mut data).await?;
    Ok(data)
}
