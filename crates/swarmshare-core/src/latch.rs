// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::sync::watch;

/// Counting latch for one search round.
///
/// Starts at the number of peers the round actually queried and releases
/// waiters when that many of them have settled. Peers that were skipped
/// because they were busy are tallied through [`RoundLatch::skip`] without
/// consuming a slot, so the latch can never open before every queried peer
/// has answered or failed.
#[derive(Debug, Clone)]
pub struct RoundLatch {
    inner: Arc<LatchInner>,
}

#[derive(Debug)]
struct LatchInner {
    initial: usize,
    remaining: watch::Sender<usize>,
    signals: AtomicUsize,
}

impl RoundLatch {
    pub fn new(count: usize) -> Self {
        let (remaining, _) = watch::channel(count);
        Self {
            inner: Arc::new(LatchInner {
                initial: count,
                remaining,
                signals: AtomicUsize::new(0),
            }),
        }
    }

    /// One queried peer settled. Saturates at zero.
    pub fn count_down(&self) {
        self.inner.signals.fetch_add(1, Ordering::SeqCst);
        self.inner.remaining.send_modify(|n| *n = n.saturating_sub(1));
    }

    /// A peer was left out of the round.
    pub fn skip(&self) {
        self.inner.signals.fetch_add(1, Ordering::SeqCst);
    }

    pub fn initial(&self) -> usize {
        self.inner.initial
    }

    pub fn remaining(&self) -> usize {
        *self.inner.remaining.borrow()
    }

    /// Total signals received, skips included.
    pub fn signals(&self) -> usize {
        self.inner.signals.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        self.remaining() == 0
    }

    pub async fn wait(&self) {
        let mut rx = self.inner.remaining.subscribe();
        // The sender lives as long as `self`, so this only returns once open.
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Returns `false` if the latch was still closed when `timeout` elapsed.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }
}
