// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::{io::ErrorKind, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    net::TcpListener,
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    library::ShareSource,
    link::AsyncIo,
    peer::PeerAddr,
    transport::{handshake_responder, read_envelope, write_envelope},
    wire::{
        DownloadMessage, DownloadResult, Envelope, FileSearchResult, MAX_ENVELOPE_PAYLOAD_BYTES,
        SearchHit, WirePayload,
    },
};

type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Unpin + Send>>>;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Bind `addr`, moving to the next port while the current one is taken.
/// Port 0 asks the OS for any free port and is tried once.
pub async fn bind_with_retry(addr: SocketAddr, attempts: u16) -> anyhow::Result<TcpListener> {
    let mut last_err = None;
    for offset in 0..attempts.max(1) {
        let Some(port) = addr.port().checked_add(offset) else {
            break;
        };
        let candidate = SocketAddr::new(addr.ip(), port);
        match TcpListener::bind(candidate).await {
            Ok(listener) => {
                if offset > 0 {
                    info!(requested = %addr, bound = %candidate, "requested port busy, bound next free port");
                }
                return Ok(listener);
            }
            Err(err) if err.kind() == ErrorKind::AddrInUse && addr.port() != 0 => {
                debug!(port, "port in use");
                last_err = Some(err);
            }
            Err(err) => return Err(err.into()),
        }
    }
    Err(last_err
        .map(anyhow::Error::from)
        .unwrap_or_else(|| anyhow::anyhow!("no port available from {addr}")))
}

/// A queued block read and the connection its answer goes to.
struct BlockJob {
    request: DownloadMessage,
    writer: SharedWriter,
    peer: PeerAddr,
}

enum Flow {
    Continue,
    Close,
}

/// Server side of the protocol.
///
/// Every connection gets its own task. Searches are answered inline; block
/// reads are queued to one background worker shared by all connections so
/// disk I/O never stalls a connection's read loop.
pub struct RequestDispatcher {
    local: PeerAddr,
    files: Arc<dyn ShareSource>,
    blocks: mpsc::UnboundedSender<BlockJob>,
}

impl RequestDispatcher {
    /// Must be called inside a tokio runtime; starts the block worker.
    pub fn new(local: PeerAddr, files: Arc<dyn ShareSource>) -> Arc<Self> {
        let (blocks, queue) = mpsc::unbounded_channel();
        tokio::spawn(run_block_worker(local, files.clone(), queue));
        Arc::new(Self {
            local,
            files,
            blocks,
        })
    }

    pub fn local(&self) -> PeerAddr {
        self.local
    }

    /// Accept connections until the returned task is aborted.
    pub fn serve(self: &Arc<Self>, listener: TcpListener) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let (stream, remote) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                };
                let _ = stream.set_nodelay(true);
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move {
                    if let Err(err) = dispatcher.serve_connection(stream, remote).await {
                        debug!(peer = %remote, error = %err, "connection ended with error");
                    }
                });
            }
        })
    }

    /// Handshake, then dispatch one envelope at a time until the peer
    /// terminates or the stream ends.
    pub async fn serve_connection<S>(&self, mut stream: S, remote: SocketAddr) -> anyhow::Result<()>
    where
        S: AsyncIo + 'static,
    {
        let announced = handshake_responder(&mut stream, self.local).await?;
        debug!(peer = %remote, announced = %announced, "accepted connection");

        let (mut reader, writer) = tokio::io::split(stream);
        let writer: SharedWriter = Arc::new(Mutex::new(Box::new(writer)));
        let peer = PeerAddr::from(remote);

        loop {
            let envelope = match read_envelope(&mut reader).await {
                Ok(envelope) => envelope,
                Err(err) => {
                    debug!(peer = %remote, error = %err, "connection closed");
                    break;
                }
            };
            match self.dispatch(envelope, &writer, peer).await? {
                Flow::Continue => {}
                Flow::Close => break,
            }
        }
        let _ = writer.lock().await.shutdown().await;
        Ok(())
    }

    async fn dispatch(
        &self,
        envelope: Envelope,
        writer: &SharedWriter,
        peer: PeerAddr,
    ) -> anyhow::Result<Flow> {
        let payload = match envelope.decode_typed() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(peer = %peer, command = envelope.command, error = %err, "unknown command");
                return Ok(Flow::Continue);
            }
        };

        match payload {
            WirePayload::WordSearchMessage(msg) => {
                let reply = self.answer_search(&msg.term).await?;
                write_envelope(&mut *writer.lock().await, &reply).await?;
            }
            WirePayload::DownloadMessage(request) => {
                let job = BlockJob {
                    request,
                    writer: writer.clone(),
                    peer,
                };
                if self.blocks.send(job).is_err() {
                    anyhow::bail!("block worker stopped");
                }
            }
            WirePayload::Terminate(_) => {
                debug!(peer = %peer, "peer terminated connection");
                return Ok(Flow::Close);
            }
            WirePayload::Echo(_) => {
                write_envelope(&mut *writer.lock().await, &envelope).await?;
            }
            other => {
                warn!(peer = %peer, command = ?other.command(), "unexpected command on request connection");
            }
        }
        Ok(Flow::Continue)
    }

    /// One result list for `term`. A failed scan is logged and answered
    /// with an empty list so the asking round still settles. The list is cut
    /// short when it would not fit in a single envelope.
    async fn answer_search(&self, term: &str) -> anyhow::Result<Envelope> {
        let descriptors = match self.files.search(term).await {
            Ok(found) => found,
            Err(err) => {
                warn!(term, error = %err, "local search failed");
                Vec::new()
            }
        };
        debug!(term, hits = descriptors.len(), "answering search");
        let hits = descriptors
            .into_iter()
            .map(|descriptor| SearchHit {
                descriptor,
                reporter: self.local,
                query: term.to_owned(),
            })
            .collect::<Vec<_>>();

        let mut keep = hits.len();
        loop {
            let reply = Envelope::from_typed(
                self.local,
                &WirePayload::FileSearchResult(FileSearchResult {
                    hits: hits[..keep].to_vec(),
                }),
            )?;
            let size = reply.payload.len();
            if size <= MAX_ENVELOPE_PAYLOAD_BYTES || keep == 0 {
                if keep < hits.len() {
                    warn!(
                        term,
                        sent = keep,
                        matched = hits.len(),
                        "search answer trimmed to fit one envelope"
                    );
                }
                return Ok(reply);
            }
            // Shrink in proportion to the overshoot, with some slack for
            // uneven hit sizes.
            keep = (keep * MAX_ENVELOPE_PAYLOAD_BYTES / size * 9 / 10).min(keep - 1);
        }
    }
}

async fn run_block_worker(
    local: PeerAddr,
    files: Arc<dyn ShareSource>,
    mut queue: mpsc::UnboundedReceiver<BlockJob>,
) {
    while let Some(BlockJob {
        request,
        writer,
        peer,
    }) = queue.recv().await
    {
        let bytes = match files.read_block(request.file_hash, request.block).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(
                    peer = %peer,
                    hash = %request.file_hash,
                    block = request.block_index,
                    error = %err,
                    "failed to read requested block"
                );
                continue;
            }
        };
        let answer = Envelope::from_typed(
            local,
            &WirePayload::DownloadResult(DownloadResult {
                file_hash: request.file_hash,
                bytes,
                block_index: request.block_index,
                job_id: request.job_id,
                sender: local,
            }),
        );
        let written = match answer {
            Ok(answer) => write_envelope(&mut *writer.lock().await, &answer).await,
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            debug!(peer = %peer, block = request.block_index, error = %err, "could not deliver block");
        }
    }
}
