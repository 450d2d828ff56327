// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf},
    net::TcpStream,
    sync::{Mutex, mpsc, watch},
};
use tracing::{debug, trace};

use crate::{
    ids::LinkId,
    peer::PeerAddr,
    transport::{handshake_initiator, read_envelope, write_envelope},
    wire::{Command, Envelope, Terminate, WirePayload},
};

pub trait AsyncIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T> AsyncIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn AsyncIo>;

#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, peer: &PeerAddr) -> anyhow::Result<BoxedStream>;
}

/// Plain TCP dialer used by running nodes.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl PeerConnector for TcpConnector {
    async fn connect(&self, peer: &PeerAddr) -> anyhow::Result<BoxedStream> {
        let stream = TcpStream::connect(peer.socket_addr()).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Anything that can carry an envelope to one remote peer. The search
/// registry holds links through this trait.
#[async_trait]
pub trait EnvelopeSink: Send + Sync {
    async fn send(&self, envelope: &Envelope) -> anyhow::Result<()>;

    fn remote(&self) -> PeerAddr;

    async fn close(&self) {}
}

/// An envelope read off a link, tagged with where it came from.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub link: LinkId,
    pub remote: PeerAddr,
    pub envelope: Envelope,
}

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_link_id() -> LinkId {
    LinkId(NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed))
}

const TERMINATE_WRITE_TIMEOUT: Duration = Duration::from_millis(500);

/// One outbound connection to a remote node.
///
/// Writes go through a mutex so concurrent senders never interleave frames.
/// A background task reads envelopes and forwards them to the `inbound`
/// channel until the remote closes, sends `Terminate`, or [`PeerLink::stop`]
/// is called.
pub struct PeerLink {
    id: LinkId,
    local: PeerAddr,
    remote: PeerAddr,
    writer: Mutex<WriteHalf<BoxedStream>>,
    stop_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
}

impl PeerLink {
    /// Dial `remote`, complete the handshake and start the receive task.
    pub async fn connect(
        connector: &dyn PeerConnector,
        local: PeerAddr,
        remote: PeerAddr,
        inbound: mpsc::UnboundedSender<Inbound>,
    ) -> anyhow::Result<Self> {
        let mut stream = connector.connect(&remote).await?;
        handshake_initiator(&mut stream, local).await?;
        Ok(Self::spawn(stream, next_link_id(), local, remote, inbound))
    }

    /// Wrap an already handshaken stream.
    pub fn spawn(
        stream: BoxedStream,
        id: LinkId,
        local: PeerAddr,
        remote: PeerAddr,
        inbound: mpsc::UnboundedSender<Inbound>,
    ) -> Self {
        let (mut reader, writer) = tokio::io::split(stream);
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let (closed_tx, closed_rx) = watch::channel(false);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    incoming = read_envelope(&mut reader) => match incoming {
                        Ok(envelope) if envelope.command == Command::Terminate as u16 => {
                            debug!(link = %id, peer = %remote, "remote terminated link");
                            break;
                        }
                        Ok(envelope) => {
                            trace!(link = %id, command = envelope.command, "link received envelope");
                            if inbound.send(Inbound { link: id, remote, envelope }).is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            debug!(link = %id, peer = %remote, error = %err, "link receive ended");
                            break;
                        }
                    },
                }
            }
            let _ = closed_tx.send(true);
        });

        Self {
            id,
            local,
            remote,
            writer: Mutex::new(writer),
            stop_tx,
            closed_rx,
        }
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn remote(&self) -> PeerAddr {
        self.remote
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    pub async fn send(&self, envelope: &Envelope) -> anyhow::Result<()> {
        if self.is_closed() {
            anyhow::bail!("link {} to {} is closed", self.id, self.remote);
        }
        let mut writer = self.writer.lock().await;
        write_envelope(&mut *writer, envelope).await
    }

    /// Resolves once the receive task has exited.
    pub async fn closed(&self) {
        let mut closed = self.closed_rx.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Best-effort `Terminate`, then shut the transport down and unblock the
    /// receive task.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let mut writer = self.writer.lock().await;
        if let Ok(terminate) =
            Envelope::from_typed(self.local, &WirePayload::Terminate(Terminate {}))
        {
            let _ = tokio::time::timeout(
                TERMINATE_WRITE_TIMEOUT,
                write_envelope(&mut *writer, &terminate),
            )
            .await;
        }
        let _ = writer.shutdown().await;
    }
}

#[async_trait]
impl EnvelopeSink for PeerLink {
    async fn send(&self, envelope: &Envelope) -> anyhow::Result<()> {
        PeerLink::send(self, envelope).await
    }

    fn remote(&self) -> PeerAddr {
        self.remote
    }

    async fn close(&self) {
        self.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        transport::handshake_responder,
        wire::{Echo, WordSearchMessage},
    };

    fn addr(port: u16) -> PeerAddr {
        PeerAddr::new("127.0.0.1".parse().expect("ip"), port)
    }

    fn echo(text: &str) -> Envelope {
        Envelope::from_typed(addr(1), &WirePayload::Echo(Echo { text: text.into() }))
            .expect("echo")
    }

    #[tokio::test]
    async fn forwards_received_envelopes_and_stops_on_terminate() {
        let (client, mut server) = tokio::io::duplex(8192);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let link = PeerLink::spawn(Box::new(client), LinkId(9), addr(1), addr(2), tx);

        write_envelope(&mut server, &echo("one")).await.expect("write");
        let got = rx.recv().await.expect("inbound");
        assert_eq!(got.link, LinkId(9));
        assert_eq!(got.remote, addr(2));
        assert_eq!(got.envelope, echo("one"));

        let terminate = Envelope::from_typed(addr(2), &WirePayload::Terminate(Terminate {}))
            .expect("terminate");
        write_envelope(&mut server, &terminate).await.expect("write");
        link.closed().await;
        assert!(link.is_closed());
        assert!(link.send(&echo("late")).await.is_err());
    }

    #[tokio::test]
    async fn concurrent_sends_never_interleave_frames() {
        let (client, mut server) = tokio::io::duplex(1024);
        let (tx, _rx) = mpsc::unbounded_channel();
        let link = Arc::new(PeerLink::spawn(
            Box::new(client),
            LinkId(1),
            addr(1),
            addr(2),
            tx,
        ));

        let mut tasks = Vec::new();
        for n in 0..16 {
            let link = link.clone();
            tasks.push(tokio::spawn(async move {
                let long = Envelope::from_typed(
                    addr(1),
                    &WirePayload::WordSearchMessage(WordSearchMessage {
                        term: format!("{n}-{}", "x".repeat(3000)),
                    }),
                )
                .expect("envelope");
                link.send(&long).await.expect("send");
            }));
        }

        let reader = tokio::spawn(async move {
            let mut seen = Vec::new();
            for _ in 0..16 {
                let envelope = read_envelope(&mut server).await.expect("intact frame");
                let WirePayload::WordSearchMessage(msg) =
                    envelope.decode_typed().expect("typed")
                else {
                    panic!("unexpected payload");
                };
                seen.push(msg.term.len());
            }
            seen
        });
        for task in tasks {
            task.await.expect("join");
        }
        assert_eq!(reader.await.expect("join").len(), 16);
    }

    #[tokio::test]
    async fn stop_sends_terminate_and_unblocks_receive() {
        let (client, mut server) = tokio::io::duplex(4096);
        let (tx, _rx) = mpsc::unbounded_channel();
        let link = PeerLink::spawn(Box::new(client), LinkId(3), addr(1), addr(2), tx);

        link.stop().await;
        link.closed().await;
        let last = read_envelope(&mut server).await.expect("terminate frame");
        assert_eq!(last.command, Command::Terminate as u16);
    }

    struct DuplexConnector;

    #[async_trait]
    impl PeerConnector for DuplexConnector {
        async fn connect(&self, _peer: &PeerAddr) -> anyhow::Result<BoxedStream> {
            let (client, mut server) = tokio::io::duplex(4096);
            tokio::spawn(async move {
                let _ = handshake_responder(&mut server, addr(2)).await;
                let _ = write_envelope(&mut server, &echo("welcome")).await;
                let _ = read_envelope(&mut server).await;
            });
            Ok(Box::new(client))
        }
    }

    #[tokio::test]
    async fn connect_handshakes_before_forwarding() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let link = PeerLink::connect(&DuplexConnector, addr(1), addr(2), tx)
            .await
            .expect("connect");
        let got = rx.recv().await.expect("inbound");
        assert_eq!(got.link, link.id());
        assert_eq!(got.envelope, echo("welcome"));
        link.stop().await;
    }
}
