// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    config::NodeConfig,
    download::{DownloadEngine, DownloadJob, ProgressListener},
    ids::LinkId,
    library::ShareLibrary,
    link::{Inbound, PeerConnector, PeerLink, TcpConnector},
    peer::PeerAddr,
    search::{SearchCoordinator, SearchListener, SearchResults, SearchRound},
    server::{RequestDispatcher, bind_with_retry},
    wire::WirePayload,
};

pub struct Node;

impl Node {
    pub async fn start(config: NodeConfig) -> anyhow::Result<NodeHandle> {
        Self::start_with_connector(config, Arc::new(TcpConnector)).await
    }

    /// Bind the listener, start serving the share directory, and connect to
    /// the configured bootstrap peers. Unreachable bootstrap peers are
    /// logged and skipped.
    pub async fn start_with_connector(
        config: NodeConfig,
        connector: Arc<dyn PeerConnector>,
    ) -> anyhow::Result<NodeHandle> {
        config.validate()?;
        let listener = bind_with_retry(config.bind_tcp, config.port_retry_limit).await?;
        let local = config.advertised_addr(listener.local_addr()?);

        let library = Arc::new(ShareLibrary::new(config.share_dir.clone()));
        let dispatcher = RequestDispatcher::new(local, library);
        let server = dispatcher.serve(listener);

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let coordinator = Arc::new(SearchCoordinator::new(local));
        let engine = Arc::new(DownloadEngine::new(
            connector.clone(),
            local,
            inbound_tx.clone(),
            config.download_dir(),
            config.download.fetch_policy(),
        ));
        let router = tokio::spawn(route_inbound(
            inbound_rx,
            coordinator.clone(),
            engine.clone(),
        ));

        info!(addr = %local, share_dir = %config.share_dir.display(), "node started");
        let handle = NodeHandle {
            inner: Arc::new(NodeInner {
                local,
                connector,
                inbound: inbound_tx,
                coordinator,
                engine,
                links: Mutex::new(HashMap::new()),
                tasks: Mutex::new(vec![server, router]),
            }),
        };

        for peer in config.bootstrap_peers()? {
            if let Err(err) = handle.connect_peer(peer).await {
                warn!(peer = %peer, error = %err, "bootstrap peer unreachable");
            }
        }
        Ok(handle)
    }
}

struct NodeInner {
    local: PeerAddr,
    connector: Arc<dyn PeerConnector>,
    inbound: mpsc::UnboundedSender<Inbound>,
    coordinator: Arc<SearchCoordinator>,
    engine: Arc<DownloadEngine>,
    links: Mutex<HashMap<LinkId, Arc<PeerLink>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct NodeHandle {
    inner: Arc<NodeInner>,
}

impl NodeHandle {
    pub fn local_addr(&self) -> PeerAddr {
        self.inner.local
    }

    pub fn coordinator(&self) -> &Arc<SearchCoordinator> {
        &self.inner.coordinator
    }

    pub fn engine(&self) -> &Arc<DownloadEngine> {
        &self.inner.engine
    }

    /// Open a persistent link to `peer` and register it for searches. The
    /// link is unregistered when it closes.
    pub async fn connect_peer(&self, peer: PeerAddr) -> anyhow::Result<LinkId> {
        let link = Arc::new(
            PeerLink::connect(
                self.inner.connector.as_ref(),
                self.inner.local,
                peer,
                self.inner.inbound.clone(),
            )
            .await?,
        );
        let id = link.id();
        self.inner.links.lock().await.insert(id, link.clone());
        self.inner
            .coordinator
            .register_link_with_id(id, link.clone())
            .await;

        let node = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            link.closed().await;
            if let Some(node) = node.upgrade() {
                node.links.lock().await.remove(&id);
                node.coordinator.remove_link(id).await;
                debug!(link = %id, "peer link closed");
            }
        });
        Ok(id)
    }

    pub async fn connected_peers(&self) -> Vec<PeerAddr> {
        self.inner
            .links
            .lock()
            .await
            .values()
            .map(|link| link.remote())
            .collect()
    }

    pub async fn add_search_listener(&self, listener: SearchListener) {
        self.inner.coordinator.add_listener(listener).await;
    }

    pub async fn add_progress_listener(&self, listener: ProgressListener) {
        self.inner.engine.add_progress_listener(listener).await;
    }

    /// Clear previous results and broadcast `term` to every idle peer.
    pub async fn search(&self, term: &str) -> anyhow::Result<SearchRound> {
        self.inner.coordinator.reset_results().await;
        self.inner.coordinator.broadcast_search(term).await
    }

    /// Search and wait up to `timeout` for the round to settle.
    pub async fn search_and_wait(
        &self,
        term: &str,
        timeout: Duration,
    ) -> anyhow::Result<SearchResults> {
        let round = self.search(term).await?;
        if !round.latch.wait_timeout(timeout).await {
            warn!(
                term,
                outstanding = round.latch.remaining(),
                "search round did not settle in time"
            );
        }
        Ok(self.results().await)
    }

    pub async fn results(&self) -> SearchResults {
        self.inner.coordinator.results().await
    }

    /// Download the file called `name` from every peer that reported it in
    /// the current results.
    pub async fn start_download(&self, name: &str) -> anyhow::Result<Arc<DownloadJob>> {
        let Some((descriptor, group)) = self.inner.coordinator.find_by_name(name).await else {
            anyhow::bail!("no search result named {name:?}");
        };
        self.inner.engine.start(descriptor, group.peers()).await
    }

    /// Stop accepting connections and close every peer link.
    pub async fn shutdown(&self) {
        for task in self.inner.tasks.lock().await.drain(..) {
            task.abort();
        }
        let links = self
            .inner
            .links
            .lock()
            .await
            .drain()
            .map(|(_, link)| link)
            .collect::<Vec<_>>();
        for link in links {
            self.inner.coordinator.remove_link(link.id()).await;
        }
        info!(addr = %self.inner.local, "node stopped");
    }
}

/// Hand what persistent and fetch links receive to the owning component.
async fn route_inbound(
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
    coordinator: Arc<SearchCoordinator>,
    engine: Arc<DownloadEngine>,
) {
    while let Some(Inbound {
        link,
        remote,
        envelope,
    }) = inbound.recv().await
    {
        match envelope.decode_typed() {
            Ok(WirePayload::FileSearchResult(result)) => {
                coordinator.receive_search_result(result.hits, link).await;
            }
            Ok(WirePayload::DownloadResult(mut result)) => {
                if result.sender.ip.is_unspecified() {
                    result.sender.ip = remote.ip;
                }
                engine.deliver_block(result).await;
            }
            Ok(other) => {
                debug!(link = %link, peer = %remote, command = ?other.command(), "ignoring message on client link");
            }
            Err(err) => {
                warn!(link = %link, peer = %remote, error = %err, "undecodable message on client link");
            }
        }
    }
}
