// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::{
    content::FileDescriptor,
    ids::{ContentHash, LinkId},
    latch::RoundLatch,
    link::{EnvelopeSink, next_link_id},
    peer::PeerAddr,
    wire::{Envelope, SearchHit, WirePayload, WordSearchMessage},
};

/// All hits for one content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HitGroup {
    pub descriptor: FileDescriptor,
    pub hits: Vec<SearchHit>,
}

impl HitGroup {
    /// Distinct peers holding this content, in address order.
    pub fn peers(&self) -> Vec<PeerAddr> {
        self.hits
            .iter()
            .map(|hit| hit.reporter)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

pub type SearchResults = BTreeMap<ContentHash, HitGroup>;

/// Called once per received answer batch with a snapshot of all results.
pub type SearchListener = Arc<dyn Fn(&SearchResults) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Idle,
    Busy { round: u64 },
}

struct LinkEntry {
    sink: Arc<dyn EnvelopeSink>,
    state: LinkState,
}

#[derive(Default)]
struct Registry {
    links: BTreeMap<LinkId, LinkEntry>,
    round: u64,
    latch: Option<RoundLatch>,
}

impl Registry {
    /// Return `link` to idle. Counts the current latch down only when the
    /// link was busy for the current round, so every queried peer is
    /// counted at most once.
    fn settle(&mut self, link: LinkId) -> bool {
        let Some(entry) = self.links.get_mut(&link) else {
            return false;
        };
        let LinkState::Busy { round } = entry.state else {
            return false;
        };
        entry.state = LinkState::Idle;
        if round != self.round {
            return false;
        }
        if let Some(latch) = &self.latch {
            latch.count_down();
        }
        true
    }
}

/// Handle for one broadcast.
#[derive(Debug, Clone)]
pub struct SearchRound {
    pub id: u64,
    pub term: String,
    pub latch: RoundLatch,
    pub queried: usize,
    pub skipped: usize,
}

pub struct SearchCoordinator {
    local: PeerAddr,
    registry: Mutex<Registry>,
    results: RwLock<SearchResults>,
    listeners: RwLock<Vec<SearchListener>>,
}

impl SearchCoordinator {
    pub fn new(local: PeerAddr) -> Self {
        Self {
            local,
            registry: Mutex::new(Registry::default()),
            results: RwLock::new(BTreeMap::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Store a connected link, idle.
    pub async fn register_link(&self, sink: Arc<dyn EnvelopeSink>) -> LinkId {
        self.register_link_with_id(next_link_id(), sink).await
    }

    pub async fn register_link_with_id(&self, id: LinkId, sink: Arc<dyn EnvelopeSink>) -> LinkId {
        let remote = sink.remote();
        self.registry.lock().await.links.insert(
            id,
            LinkEntry {
                sink,
                state: LinkState::Idle,
            },
        );
        info!(link = %id, peer = %remote, "registered peer link");
        id
    }

    /// Forget a link. A link removed while queried in the current round
    /// counts as a failed peer.
    pub async fn remove_link(&self, id: LinkId) -> bool {
        let removed = {
            let mut registry = self.registry.lock().await;
            registry.settle(id);
            registry.links.remove(&id)
        };
        match removed {
            Some(entry) => {
                debug!(link = %id, peer = %entry.sink.remote(), "removed peer link");
                entry.sink.close().await;
                true
            }
            None => false,
        }
    }

    pub async fn link_count(&self) -> usize {
        self.registry.lock().await.links.len()
    }

    pub async fn idle_count(&self) -> usize {
        self.registry
            .lock()
            .await
            .links
            .values()
            .filter(|entry| entry.state == LinkState::Idle)
            .count()
    }

    pub async fn add_listener(&self, listener: SearchListener) {
        self.listeners.write().await.push(listener);
    }

    /// Query every idle peer for `term`.
    ///
    /// Selection, the busy marking and the new latch are one critical
    /// section. Busy peers are skipped and tallied right away; each queried
    /// peer settles the latch exactly once, either from its answer in
    /// [`SearchCoordinator::receive_search_result`] or from a failed send.
    pub async fn broadcast_search(self: &Arc<Self>, term: &str) -> anyhow::Result<SearchRound> {
        let envelope = Envelope::from_typed(
            self.local,
            &WirePayload::WordSearchMessage(WordSearchMessage {
                term: term.to_owned(),
            }),
        )?;

        let (round, latch, targets, skipped) = {
            let mut registry = self.registry.lock().await;
            registry.round += 1;
            let round = registry.round;
            let idle = registry
                .links
                .values()
                .filter(|entry| entry.state == LinkState::Idle)
                .count();
            let latch = RoundLatch::new(idle);
            registry.latch = Some(latch.clone());

            let mut targets = Vec::with_capacity(idle);
            let mut skipped = 0;
            for (id, entry) in registry.links.iter_mut() {
                match entry.state {
                    LinkState::Idle => {
                        entry.state = LinkState::Busy { round };
                        targets.push((*id, entry.sink.clone()));
                    }
                    LinkState::Busy { .. } => {
                        latch.skip();
                        skipped += 1;
                    }
                }
            }
            (round, latch, targets, skipped)
        };

        info!(
            round,
            term,
            queried = targets.len(),
            skipped,
            "broadcasting search"
        );
        let queried = targets.len();
        for (id, sink) in targets {
            let coordinator = Arc::clone(self);
            let envelope = envelope.clone();
            tokio::spawn(async move {
                if let Err(err) = sink.send(&envelope).await {
                    warn!(link = %id, peer = %sink.remote(), error = %err, "search send failed");
                    coordinator.registry.lock().await.settle(id);
                }
            });
        }

        Ok(SearchRound {
            id: round,
            term: term.to_owned(),
            latch,
            queried,
            skipped,
        })
    }

    /// Take one peer's answer. Answers from a link that is not busy for the
    /// current round (late or unsolicited) are dropped.
    pub async fn receive_search_result(&self, hits: Vec<SearchHit>, from: LinkId) {
        let remote = {
            let mut registry = self.registry.lock().await;
            let remote = registry.links.get(&from).map(|entry| entry.sink.remote());
            if !registry.settle(from) {
                debug!(link = %from, hits = hits.len(), "dropping stale or unsolicited search answer");
                return;
            }
            remote
        };

        let snapshot = {
            let mut results = self.results.write().await;
            for mut hit in hits {
                if !hit.descriptor.is_consistent() {
                    debug!(link = %from, name = %hit.descriptor.name, "dropping hit whose size cannot be split into blocks");
                    continue;
                }
                if hit.reporter.ip.is_unspecified()
                    && let Some(remote) = remote
                {
                    hit.reporter.ip = remote.ip;
                }
                results
                    .entry(hit.descriptor.content_hash)
                    .or_insert_with(|| HitGroup {
                        descriptor: hit.descriptor.clone(),
                        hits: Vec::new(),
                    })
                    .hits
                    .push(hit);
            }
            results.clone()
        };

        for listener in self.listeners.read().await.iter() {
            listener(&snapshot);
        }
    }

    pub async fn reset_results(&self) {
        self.results.write().await.clear();
    }

    pub async fn results(&self) -> SearchResults {
        self.results.read().await.clone()
    }

    /// The group holding a file called exactly `name`, with that file's
    /// descriptor.
    pub async fn find_by_name(&self, name: &str) -> Option<(FileDescriptor, HitGroup)> {
        let results = self.results.read().await;
        results.values().find_map(|group| {
            group
                .hits
                .iter()
                .find(|hit| hit.descriptor.name == name)
                .map(|hit| (hit.descriptor.clone(), group.clone()))
        })
    }
}
