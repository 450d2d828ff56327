// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context;
use rand::seq::SliceRandom;
use sha2::{Digest, Sha256};
use tokio::{
    io::{AsyncWriteExt, BufWriter},
    sync::{Mutex, RwLock, mpsc, oneshot, watch},
};
use tracing::{debug, info, warn};

use crate::{
    content::FileDescriptor,
    ids::{ContentHash, JobId},
    library::PARTIAL_SUFFIX,
    link::{Inbound, PeerConnector, PeerLink},
    peer::PeerAddr,
    wire::{DownloadMessage, DownloadResult, Envelope, WirePayload},
};

#[derive(Debug, Clone)]
pub struct FetchPolicy {
    /// Concurrent block fetchers per job.
    pub workers: usize,
    /// How long a fetch waits for its block after sending the request.
    pub response_timeout: Duration,
    pub connect_timeout: Duration,
    /// `None` retries a block until some peer delivers it.
    pub max_block_attempts: Option<u32>,
    /// Pause before a failed block goes back into the queue.
    pub retry_backoff: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            workers: 5,
            response_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            max_block_attempts: None,
            retry_backoff: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Created,
    Running,
    Writing,
    Done,
    Failed(String),
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed(_))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerStats {
    pub blocks: u32,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadProgress {
    pub job_id: JobId,
    pub name: String,
    pub completed: u32,
    pub total: u32,
    pub percent: u8,
}

pub type ProgressListener = Arc<dyn Fn(&DownloadProgress) + Send + Sync>;

type Listeners = Arc<RwLock<Vec<ProgressListener>>>;

fn percent(completed: u32, total: u32) -> u8 {
    if total == 0 {
        return 100;
    }
    (f64::from(completed) / f64::from(total) * 100.0).round() as u8
}

/// Per-job block bookkeeping. Every index is in exactly one of `pending`,
/// `in_flight` and `completed`.
#[derive(Default)]
struct BlockLedger {
    pending: VecDeque<u32>,
    in_flight: HashSet<u32>,
    completed: BTreeMap<u32, Vec<u8>>,
    attempts: HashMap<u32, u32>,
    waiters: HashMap<u32, oneshot::Sender<()>>,
    peers: BTreeMap<PeerAddr, PeerStats>,
    failure: Option<String>,
}

/// Shared pieces every job borrows from its engine.
#[derive(Clone)]
struct FetchContext {
    connector: Arc<dyn PeerConnector>,
    local: PeerAddr,
    inbound: mpsc::UnboundedSender<Inbound>,
    policy: FetchPolicy,
    download_dir: PathBuf,
    listeners: Listeners,
}

/// One file's parallel, multi-peer download.
pub struct DownloadJob {
    id: JobId,
    descriptor: FileDescriptor,
    peers: Vec<PeerAddr>,
    ctx: FetchContext,
    ledger: Mutex<BlockLedger>,
    state: watch::Sender<JobState>,
    complete: watch::Sender<bool>,
    started: Mutex<Option<Instant>>,
    elapsed: Mutex<Option<Duration>>,
}

impl DownloadJob {
    fn new(descriptor: FileDescriptor, peers: Vec<PeerAddr>, ctx: FetchContext) -> Self {
        let ledger = BlockLedger {
            pending: (0..descriptor.block_count()).collect(),
            ..BlockLedger::default()
        };
        let (state, _) = watch::channel(JobState::Created);
        let (complete, _) = watch::channel(descriptor.block_count() == 0);
        Self {
            id: JobId::random(),
            descriptor,
            peers,
            ctx,
            ledger: Mutex::new(ledger),
            state,
            complete,
            started: Mutex::new(None),
            elapsed: Mutex::new(None),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn descriptor(&self) -> &FileDescriptor {
        &self.descriptor
    }

    pub fn peers(&self) -> &[PeerAddr] {
        &self.peers
    }

    pub fn state(&self) -> JobState {
        self.state.borrow().clone()
    }

    pub fn output_path(&self) -> PathBuf {
        self.ctx.download_dir.join(&self.descriptor.name)
    }

    pub async fn completed_blocks(&self) -> u32 {
        self.ledger.lock().await.completed.len() as u32
    }

    pub async fn progress(&self) -> DownloadProgress {
        let completed = self.completed_blocks().await;
        self.progress_for(completed)
    }

    pub async fn peer_stats(&self) -> BTreeMap<PeerAddr, PeerStats> {
        self.ledger.lock().await.peers.clone()
    }

    /// Wall time from start to the file being written.
    pub async fn elapsed(&self) -> Option<Duration> {
        *self.elapsed.lock().await
    }

    /// Wait for `Done` or `Failed`.
    pub async fn wait(&self) -> JobState {
        let mut rx = self.state.subscribe();
        match rx.wait_for(JobState::is_terminal).await {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        }
    }

    fn progress_for(&self, completed: u32) -> DownloadProgress {
        let total = self.descriptor.block_count();
        DownloadProgress {
            job_id: self.id,
            name: self.descriptor.name.clone(),
            completed,
            total,
            percent: percent(completed, total),
        }
    }

    fn set_state(&self, next: JobState) {
        debug!(job = %self.id, state = ?next, "download state change");
        self.state.send_replace(next);
    }

    async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        *self.started.lock().await = Some(Instant::now());
        self.set_state(JobState::Running);
        info!(
            job = %self.id,
            file = %self.descriptor.name,
            blocks = self.descriptor.block_count(),
            peers = self.peers.len(),
            "download started"
        );

        let workers = (0..self.ctx.policy.workers.max(1))
            .map(|worker| tokio::spawn(Arc::clone(&self).run_worker(worker)))
            .collect::<Vec<_>>();
        for joined in futures_util::future::join_all(workers).await {
            if let Err(err) = joined {
                warn!(job = %self.id, error = %err, "download worker panicked");
            }
        }

        if let Some(reason) = self.ledger.lock().await.failure.clone() {
            anyhow::bail!(reason);
        }

        self.set_state(JobState::Writing);
        let mut complete = self.complete.subscribe();
        let _ = complete.wait_for(|done| *done).await;
        self.write_file().await?;

        let elapsed = self
            .started
            .lock()
            .await
            .map(|started| started.elapsed())
            .unwrap_or_default();
        *self.elapsed.lock().await = Some(elapsed);
        self.set_state(JobState::Done);
        info!(
            job = %self.id,
            file = %self.descriptor.name,
            bytes = self.descriptor.size,
            elapsed_ms = elapsed.as_millis() as u64,
            "download finished"
        );
        Ok(())
    }

    async fn run_worker(self: Arc<Self>, worker: usize) {
        while let Some((index, delivered)) = self.next_pending().await {
            let Err(err) = self.fetch_block(index, delivered).await else {
                continue;
            };
            debug!(job = %self.id, worker, block = index, error = %err, "block fetch failed");
            if !self.requeue(index).await {
                break;
            }
            tokio::time::sleep(self.ctx.policy.retry_backoff).await;
        }
        debug!(job = %self.id, worker, "download worker finished");
    }

    /// Move the next pending index to in-flight. `None` once nothing is
    /// pending or the job has failed.
    async fn next_pending(&self) -> Option<(u32, oneshot::Receiver<()>)> {
        let mut ledger = self.ledger.lock().await;
        if ledger.failure.is_some() {
            return None;
        }
        let index = ledger.pending.pop_front()?;
        ledger.in_flight.insert(index);
        *ledger.attempts.entry(index).or_default() += 1;
        let (tx, rx) = oneshot::channel();
        ledger.waiters.insert(index, tx);
        Some((index, rx))
    }

    /// Put a failed block back. Returns `false` when the retry cap was hit
    /// and the whole job has been marked failed.
    async fn requeue(&self, index: u32) -> bool {
        let mut ledger = self.ledger.lock().await;
        ledger.in_flight.remove(&index);
        ledger.waiters.remove(&index);
        if ledger.completed.contains_key(&index) {
            return true;
        }
        let attempts = ledger.attempts.get(&index).copied().unwrap_or(0);
        if let Some(max) = self.ctx.policy.max_block_attempts
            && attempts >= max
        {
            let reason = format!("block {index} failed after {attempts} attempts");
            ledger.failure.get_or_insert(reason);
            return false;
        }
        ledger.pending.push_back(index);
        true
    }

    /// One attempt: fresh connection to a random candidate, one request,
    /// wait for the receiving side to deliver the block.
    async fn fetch_block(&self, index: u32, delivered: oneshot::Receiver<()>) -> anyhow::Result<()> {
        let peer = *self
            .peers
            .choose(&mut rand::thread_rng())
            .context("download has no candidate peers")?;
        let block = self
            .descriptor
            .block(index)
            .with_context(|| format!("block {index} out of range"))?;

        let link = tokio::time::timeout(
            self.ctx.policy.connect_timeout,
            PeerLink::connect(
                self.ctx.connector.as_ref(),
                self.ctx.local,
                peer,
                self.ctx.inbound.clone(),
            ),
        )
        .await
        .with_context(|| format!("connect to {peer} timed out"))??;

        let request = Envelope::from_typed(
            self.ctx.local,
            &WirePayload::DownloadMessage(DownloadMessage {
                block,
                file_hash: self.descriptor.content_hash,
                job_id: self.id,
                block_index: index,
            }),
        )?;

        let outcome = match link.send(&request).await {
            Ok(()) => tokio::select! {
                answer = delivered => answer.map_err(|_| anyhow::anyhow!("block {index} rejected")),
                _ = link.closed() => Err(anyhow::anyhow!("{peer} closed before block {index} arrived")),
                _ = tokio::time::sleep(self.ctx.policy.response_timeout) => {
                    Err(anyhow::anyhow!("timed out waiting for block {index} from {peer}"))
                }
            },
            Err(err) => Err(err),
        };
        link.stop().await;
        outcome
    }

    /// Store one block delivered by the receiving side. Returns `true` if
    /// the block was new.
    async fn deliver(&self, result: DownloadResult) -> bool {
        let index = result.block_index;
        let expected = self.descriptor.block(index).map(|range| range.len());
        let completed = {
            let mut ledger = self.ledger.lock().await;
            if ledger.completed.contains_key(&index) {
                return false;
            }
            if expected != Some(result.bytes.len() as u64) {
                warn!(
                    job = %self.id,
                    block = index,
                    got = result.bytes.len(),
                    "rejecting block with wrong length"
                );
                // Dropping the waiter fails the worker's fetch so the block
                // goes back into the queue.
                ledger.waiters.remove(&index);
                return false;
            }

            ledger.pending.retain(|pending| *pending != index);
            ledger.in_flight.remove(&index);
            let stats = ledger.peers.entry(result.sender).or_default();
            stats.blocks += 1;
            stats.bytes += result.bytes.len() as u64;
            ledger.completed.insert(index, result.bytes);
            if let Some(waiter) = ledger.waiters.remove(&index) {
                let _ = waiter.send(());
            }

            let completed = ledger.completed.len() as u32;
            // Checked and published under the ledger lock so the writer
            // cannot miss the last block.
            if completed == self.descriptor.block_count() {
                self.complete.send_replace(true);
            }
            completed
        };

        let progress = self.progress_for(completed);
        for listener in self.ctx.listeners.read().await.iter() {
            listener(&progress);
        }
        true
    }

    /// Write blocks in index order to a partial file, check the content
    /// hash, then move it to its final name.
    async fn write_file(&self) -> anyhow::Result<()> {
        let final_path = self.output_path();
        let part_path = self.ctx.download_dir.join(format!(
            ".{}.{}{}",
            self.descriptor.name, self.id, PARTIAL_SUFFIX
        ));
        tokio::fs::create_dir_all(&self.ctx.download_dir)
            .await
            .with_context(|| format!("create {}", self.ctx.download_dir.display()))?;

        let written = self.write_blocks(&part_path).await;
        if let Err(err) = written {
            let _ = tokio::fs::remove_file(&part_path).await;
            return Err(err);
        }
        tokio::fs::rename(&part_path, &final_path)
            .await
            .with_context(|| format!("move download into {}", final_path.display()))?;
        Ok(())
    }

    async fn write_blocks(&self, part_path: &Path) -> anyhow::Result<()> {
        let file = tokio::fs::File::create(part_path)
            .await
            .with_context(|| format!("create {}", part_path.display()))?;
        let mut out = BufWriter::new(file);
        let mut hasher = Sha256::new();
        // Every block is in; late duplicates only wait on the lock.
        let ledger = self.ledger.lock().await;
        for bytes in ledger.completed.values() {
            hasher.update(bytes);
            out.write_all(bytes).await?;
        }
        out.flush().await?;
        out.get_ref().sync_all().await?;

        let actual = ContentHash::from_digest(hasher.finalize().as_slice());
        if actual != self.descriptor.content_hash {
            anyhow::bail!(
                "assembled file hash {actual} does not match {}",
                self.descriptor.content_hash
            );
        }
        Ok(())
    }
}

/// Runs download jobs and routes delivered blocks to them.
pub struct DownloadEngine {
    ctx: FetchContext,
    jobs: RwLock<HashMap<JobId, Arc<DownloadJob>>>,
}

impl DownloadEngine {
    /// `inbound` is where fetch links forward what they receive; whoever
    /// drains it must hand `DownloadResult`s to
    /// [`DownloadEngine::deliver_block`].
    pub fn new(
        connector: Arc<dyn PeerConnector>,
        local: PeerAddr,
        inbound: mpsc::UnboundedSender<Inbound>,
        download_dir: impl Into<PathBuf>,
        policy: FetchPolicy,
    ) -> Self {
        Self {
            ctx: FetchContext {
                connector,
                local,
                inbound,
                policy,
                download_dir: download_dir.into(),
                listeners: Arc::new(RwLock::new(Vec::new())),
            },
            jobs: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add_progress_listener(&self, listener: ProgressListener) {
        self.ctx.listeners.write().await.push(listener);
    }

    pub async fn job(&self, id: &JobId) -> Option<Arc<DownloadJob>> {
        self.jobs.read().await.get(id).cloned()
    }

    pub async fn active_jobs(&self) -> usize {
        self.jobs.read().await.len()
    }

    /// Start fetching `descriptor` from `peers` in the background.
    pub async fn start(
        self: &Arc<Self>,
        descriptor: FileDescriptor,
        peers: Vec<PeerAddr>,
    ) -> anyhow::Result<Arc<DownloadJob>> {
        validate_file_name(&descriptor.name)?;
        if !descriptor.is_consistent() {
            anyhow::bail!(
                "{} has size {} which cannot be split into blocks",
                descriptor.name,
                descriptor.size
            );
        }
        if peers.is_empty() && descriptor.block_count() > 0 {
            anyhow::bail!("no peers available for {}", descriptor.name);
        }

        let job = Arc::new(DownloadJob::new(descriptor, peers, self.ctx.clone()));
        self.jobs.write().await.insert(job.id, job.clone());

        let engine = Arc::clone(self);
        let running = job.clone();
        tokio::spawn(async move {
            let id = running.id;
            if let Err(err) = Arc::clone(&running).run().await {
                warn!(job = %id, file = %running.descriptor.name, error = %err, "download failed");
                running.set_state(JobState::Failed(err.to_string()));
            }
            engine.jobs.write().await.remove(&id);
        });
        Ok(job)
    }

    /// Hand a received block to its job. Blocks for unknown jobs or with a
    /// mismatched file hash are ignored.
    pub async fn deliver_block(&self, result: DownloadResult) {
        let Some(job) = self.job(&result.job_id).await else {
            debug!(job = %result.job_id, block = result.block_index, "block for unknown job");
            return;
        };
        if job.descriptor.content_hash != result.file_hash {
            warn!(job = %job.id, "block carries a different file hash");
            return;
        }
        job.deliver(result).await;
    }
}

/// Refuse names that would land outside the download directory.
fn validate_file_name(name: &str) -> anyhow::Result<()> {
    let path = Path::new(name);
    let plain = path.file_name().and_then(|n| n.to_str()) == Some(name);
    if !plain || name.starts_with('.') {
        anyhow::bail!("refusing to write download with unsafe name {name:?}");
    }
    Ok(())
}
