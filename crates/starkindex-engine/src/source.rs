//! The unified block stream: historical paging handed off to live heads.
//!
//! A background task produces one ordered sequence of block candidates:
//!
//! 1. **Historical** — `[start, head_at_start)` fetched through a pool of
//!    `W` concurrent `getBlockWithReceipts` calls; `buffered(W)` re-sequences
//!    the results into strictly ascending order before emission.
//! 2. **Gap close** — blocks that arrived while draining are fetched once
//!    the subscription is up, by re-reading the current head.
//! 3. **Live** — each WebSocket head triggers an RPC receipts fetch for
//!    every block from the last emitted up to the announced number.
//!
//! When the head stream ends (connection drop), the task re-subscribes with
//! capped exponential backoff and runs the gap close again — it never assumes
//! the stream resumes where it left off. A head at or below the last emitted
//! number is re-fetched and re-emitted so the reorg detector can compare
//! hashes; it is never silently dropped.
//!
//! Backpressure: a bounded channel of depth `2W` between the task and the
//! consumer.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use starkindex_core::BlockCandidate;
use starkindex_rpc::{RetryConfig, RetryPolicy, StarknetProvider, TransportError};

use crate::health::HealthTracker;

/// One item of the unified stream.
#[derive(Debug)]
pub enum SourceItem {
    Block(BlockCandidate),
    /// A failure the transports could not absorb (retry budget exhausted or
    /// a malformed response). The orchestrator decides; the source stops.
    Failed(TransportError),
}

/// Consumer handle over the background production task.
pub struct ChainSource {
    rx: mpsc::Receiver<SourceItem>,
}

impl ChainSource {
    /// Start producing candidates from `start_block` onward.
    pub fn spawn<P: StarknetProvider>(
        provider: Arc<P>,
        start_block: u64,
        concurrency: usize,
        health: Arc<HealthTracker>,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(concurrency.max(1) * 2);
        tokio::spawn(run_source(
            provider,
            start_block,
            concurrency.max(1),
            health,
            cancel,
            tx,
        ));
        Self { rx }
    }

    /// Next item, or `None` once the task has stopped and drained.
    pub async fn next(&mut self) -> Option<SourceItem> {
        self.rx.recv().await
    }
}

struct Producer<P> {
    provider: Arc<P>,
    health: Arc<HealthTracker>,
    cancel: CancellationToken,
    tx: mpsc::Sender<SourceItem>,
    /// Next block number to emit; only ever raised.
    next_emit: u64,
}

async fn run_source<P: StarknetProvider>(
    provider: Arc<P>,
    start_block: u64,
    concurrency: usize,
    health: Arc<HealthTracker>,
    cancel: CancellationToken,
    tx: mpsc::Sender<SourceItem>,
) {
    let mut producer = Producer {
        provider,
        health,
        cancel,
        tx,
        next_emit: start_block,
    };

    let head_at_start = match producer.provider.block_number().await {
        Ok(head) => {
            producer.health.record_rpc();
            head
        }
        Err(e) => {
            producer.fail(e).await;
            return;
        }
    };

    if producer.historical(head_at_start, concurrency).await.is_break() {
        return;
    }
    producer.live().await;
}

/// Whether the production task should keep going.
type Flow = std::ops::ControlFlow<()>;

impl<P: StarknetProvider> Producer<P> {
    /// Drain `[next_emit, to)` through the worker pool, re-sequenced.
    async fn historical(&mut self, to: u64, concurrency: usize) -> Flow {
        if self.next_emit >= to {
            return Flow::Continue(());
        }
        tracing::info!(
            from = self.next_emit,
            to,
            workers = concurrency,
            "draining historical range"
        );

        let provider = Arc::clone(&self.provider);
        let mut fetches = Box::pin(
            futures::stream::iter(self.next_emit..to)
                .map(move |number| {
                    let provider = Arc::clone(&provider);
                    async move { provider.block_with_receipts(number).await }
                })
                .buffered(concurrency),
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Flow::Break(()),
                fetched = fetches.next() => match fetched {
                    None => return Flow::Continue(()),
                    Some(Ok(candidate)) => {
                        self.health.record_rpc();
                        self.emit(candidate).await?;
                    }
                    Some(Err(e)) => {
                        self.fail(e).await;
                        return Flow::Break(());
                    }
                }
            }
        }
    }

    /// Subscribe to new heads, closing the gap after every (re)connect.
    async fn live(&mut self) {
        let reconnect = RetryPolicy::new(RetryConfig::default());
        let mut attempt = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            attempt += 1;

            let mut heads = match self.provider.subscribe_new_heads().await {
                Ok(stream) => stream,
                Err(e) => {
                    if !e.is_retryable() {
                        self.fail(e).await;
                        return;
                    }
                    let delay = reconnect.delay_for(attempt);
                    tracing::warn!(error = %e, "head subscription failed, retrying in {delay:?}");
                    if self.sleep(delay).await.is_break() {
                        return;
                    }
                    continue;
                }
            };

            // Gap close: whatever arrived before or between subscriptions.
            match self.provider.block_number().await {
                Ok(current) => {
                    self.health.record_rpc();
                    if current >= self.next_emit
                        && self.emit_range(self.next_emit, current).await.is_break()
                    {
                        return;
                    }
                }
                Err(e) => {
                    self.fail(e).await;
                    return;
                }
            }
            attempt = 0;

            loop {
                let head = tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    head = heads.next() => head,
                };
                let Some(head) = head else {
                    tracing::warn!("head stream ended, re-subscribing");
                    break;
                };
                self.health.record_ws();
                // A head below the high-water mark is a potential fork
                // announcement: re-fetch exactly that block and let the
                // detector compare hashes.
                let from = self.next_emit.min(head.number);
                if self.emit_range(from, head.number).await.is_break() {
                    return;
                }
            }
        }
    }

    async fn emit_range(&mut self, from: u64, to: u64) -> Flow {
        for number in from..=to {
            if self.cancel.is_cancelled() {
                return Flow::Break(());
            }
            match self.provider.block_with_receipts(number).await {
                Ok(candidate) => {
                    self.health.record_rpc();
                    self.emit(candidate).await?;
                }
                Err(e) => {
                    self.fail(e).await;
                    return Flow::Break(());
                }
            }
        }
        Flow::Continue(())
    }

    async fn emit(&mut self, candidate: BlockCandidate) -> Flow {
        let number = candidate.header.number;
        if self.tx.send(SourceItem::Block(candidate)).await.is_err() {
            // Consumer gone; stop quietly.
            return Flow::Break(());
        }
        self.next_emit = self.next_emit.max(number + 1);
        Flow::Continue(())
    }

    async fn fail(&self, error: TransportError) {
        tracing::error!(error = %error, "block source failed");
        let _ = self.tx.send(SourceItem::Failed(error)).await;
    }

    async fn sleep(&self, delay: std::time::Duration) -> Flow {
        tokio::select! {
            _ = self.cancel.cancelled() => Flow::Break(()),
            _ = tokio::time::sleep(delay) => Flow::Continue(()),
        }
    }
}
