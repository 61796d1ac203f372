//! The orchestrator: owns component lifetimes, the cursor and the canonical
//! tail, and drives the pipeline loop.
//!
//! Exactly one task progresses the cursor. Parallelism exists only inside
//! the chain source's fetch fan-out; everything from reorg detection to
//! handler dispatch is serial, so the externally observable order is always
//! commit(N) → handlers(N) → commit(N+1).

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use starkindex_core::{
    AbiRegistry, BlockCandidate, BlockHeader, Cursor, Directive, EventSubscription, IndexerConfig,
    IndexerError, IndexerStatus, ReorgDetector, ReorgHandler, StartBlock, Storage,
};
use starkindex_rpc::{
    HttpClientConfig, JsonRpcProvider, RetryConfig, RetryPolicy, StarknetProvider, WsClientConfig,
};

use crate::dispatcher::HandlerDispatcher;
use crate::health::{Health, HealthTracker};
use crate::processor::BlockProcessor;
use crate::source::{ChainSource, SourceItem};

/// Storage commit attempts per block (first try included).
const MAX_COMMIT_ATTEMPTS: u32 = 5;

/// The indexer: registration API, lifecycle, and the drive loop.
pub struct Indexer<P: StarknetProvider> {
    config: IndexerConfig,
    provider: Arc<P>,
    storage: Arc<dyn Storage>,
    subscriptions: Vec<EventSubscription>,
    reorg_handler: Option<Arc<dyn ReorgHandler>>,
    status: Arc<watch::Sender<IndexerStatus>>,
    health: Arc<HealthTracker>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    started: bool,
}

impl Indexer<JsonRpcProvider> {
    /// Build an indexer against the configured RPC and WebSocket endpoints,
    /// with the configured per-call and handshake timeouts.
    pub fn from_config(
        config: IndexerConfig,
        storage: Arc<dyn Storage>,
    ) -> Result<Self, IndexerError> {
        config.validate()?;
        let http = HttpClientConfig {
            request_timeout: std::time::Duration::from_millis(config.rpc_timeout_ms),
            ..Default::default()
        };
        let ws = WsClientConfig {
            handshake_timeout: std::time::Duration::from_millis(config.ws_handshake_timeout_ms),
            ..Default::default()
        };
        let provider = JsonRpcProvider::new(
            config.rpc_node_url.clone(),
            config.ws_node_url.clone(),
            http,
            ws,
        )?;
        Ok(Self::new(config, provider, storage))
    }
}

impl<P: StarknetProvider> Indexer<P> {
    pub fn new(config: IndexerConfig, provider: P, storage: Arc<dyn Storage>) -> Self {
        let (status, _) = watch::channel(IndexerStatus::Idle);
        Self {
            config,
            provider: Arc::new(provider),
            storage,
            subscriptions: Vec::new(),
            reorg_handler: None,
            status: Arc::new(status),
            health: Arc::new(HealthTracker::new()),
            cancel: CancellationToken::new(),
            task: None,
            started: false,
        }
    }

    /// Register an event subscription. Must be called before `start()`.
    pub fn on_event(&mut self, subscription: EventSubscription) -> Result<(), IndexerError> {
        if self.started {
            return Err(IndexerError::Configuration(
                "subscriptions are frozen once the indexer has started".into(),
            ));
        }
        self.subscriptions.push(subscription);
        Ok(())
    }

    /// Register the reorg handler. At most one; same ordering rule.
    pub fn on_reorg(&mut self, handler: Arc<dyn ReorgHandler>) -> Result<(), IndexerError> {
        if self.started {
            return Err(IndexerError::Configuration(
                "the reorg handler must be registered before start()".into(),
            ));
        }
        if self.reorg_handler.is_some() {
            return Err(IndexerError::Configuration(
                "only one reorg handler may be registered".into(),
            ));
        }
        self.reorg_handler = Some(handler);
        Ok(())
    }

    /// Observe lifecycle transitions; fatal conditions arrive as
    /// [`IndexerStatus::Failed`].
    pub fn status(&self) -> watch::Receiver<IndexerStatus> {
        self.status.subscribe()
    }

    /// Liveness of the external dependencies, from the last successful
    /// interaction within a 30-second window.
    pub fn health_check(&self) -> Health {
        self.health.snapshot()
    }

    /// Initialize storage, resolve the cursor, build the registry, and spawn
    /// the pipeline. Returns once the pipeline is running.
    pub async fn start(&mut self) -> Result<(), IndexerError> {
        if self.started {
            return Err(IndexerError::Configuration("already started".into()));
        }
        self.config.validate()?;

        let registry = Arc::new(AbiRegistry::build(self.subscriptions.clone())?);
        if registry.is_empty() {
            tracing::warn!("no subscriptions registered: blocks will be stored without events");
        }

        self.storage.migrate().await?;
        self.health.record_database();

        let cursor = self.storage.cursor().await?;
        let head_at_start = self.provider.block_number().await?;
        self.health.record_rpc();

        let start_block = match &cursor {
            Some(c) => c.next_block(),
            None => match self.config.starting_block {
                StartBlock::Number(n) => n,
                StartBlock::Latest => head_at_start,
            },
        };

        let mut detector = ReorgDetector::new(self.config.reorg_window);
        if let Some(cursor) = &cursor {
            let mut headers = self.storage.recent_blocks(self.config.reorg_window).await?;
            // Rows above the cursor can exist after a torn write (crash
            // between insert and cursor commit); the cursor is the source of
            // truth, so they are re-processed rather than trusted.
            headers.retain(|h| h.number <= cursor.block_number);
            detector.seed(headers);
        }

        tracing::info!(
            start_block,
            head = head_at_start,
            cursor = cursor.as_ref().map(|c| c.block_number),
            window = self.config.reorg_window,
            subscriptions = registry.len(),
            "starting indexer"
        );

        let source = ChainSource::spawn(
            Arc::clone(&self.provider),
            start_block,
            self.config.historical_concurrency,
            Arc::clone(&self.health),
            self.cancel.child_token(),
        );

        let pipeline = Pipeline {
            provider: Arc::clone(&self.provider),
            processor: BlockProcessor::new(Arc::clone(&self.storage), Arc::clone(&registry)),
            dispatcher: HandlerDispatcher::new(
                registry,
                self.reorg_handler.clone(),
                Arc::clone(&self.storage),
            ),
            storage: Arc::clone(&self.storage),
            detector,
            cursor,
            status: Arc::clone(&self.status),
            health: Arc::clone(&self.health),
            retry: RetryPolicy::new(RetryConfig::default()),
            window: self.config.reorg_window,
            live_from: head_at_start,
            cancel: self.cancel.clone(),
        };

        self.set_status(if start_block >= head_at_start {
            IndexerStatus::Live
        } else {
            IndexerStatus::Backfilling
        });
        self.task = Some(tokio::spawn(pipeline.run(source)));
        self.started = true;
        Ok(())
    }

    /// Signal cancellation, let the in-flight block finish cleanly, and join
    /// every task.
    pub async fn stop(&mut self) {
        if !self.started {
            return;
        }
        if !self.status.borrow().is_terminal() {
            self.set_status(IndexerStatus::Stopping);
        }
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "pipeline task panicked during shutdown");
            }
        }
        tracing::info!("indexer stopped");
    }

    fn set_status(&self, next: IndexerStatus) {
        self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

// ─── Pipeline ────────────────────────────────────────────────────────────────

struct Pipeline<P> {
    provider: Arc<P>,
    processor: BlockProcessor,
    dispatcher: HandlerDispatcher,
    storage: Arc<dyn Storage>,
    detector: ReorgDetector,
    cursor: Option<Cursor>,
    status: Arc<watch::Sender<IndexerStatus>>,
    health: Arc<HealthTracker>,
    retry: RetryPolicy,
    window: usize,
    /// Head observed at start: reaching it flips the status to live.
    live_from: u64,
    cancel: CancellationToken,
}

impl<P: StarknetProvider> Pipeline<P> {
    async fn run(mut self, mut source: ChainSource) {
        loop {
            let item = tokio::select! {
                _ = self.cancel.cancelled() => break,
                item = source.next() => item,
            };
            let Some(item) = item else { break };
            match item {
                SourceItem::Failed(e) => {
                    self.fail(IndexerError::from(e));
                    return;
                }
                SourceItem::Block(candidate) => {
                    if let Err(e) = self.drive(candidate).await {
                        if matches!(e, IndexerError::Aborted { .. }) {
                            break;
                        }
                        self.fail(e);
                        return;
                    }
                }
            }
        }
        self.set_status(IndexerStatus::Stopped);
    }

    /// Process one candidate, including any rollback/replay it triggers.
    async fn drive(&mut self, candidate: BlockCandidate) -> Result<(), IndexerError> {
        let mut queue = VecDeque::from([candidate]);
        while let Some(candidate) = queue.pop_front() {
            match self.detector.evaluate(&candidate.header, self.cursor.as_ref()) {
                Directive::Skip => {
                    tracing::debug!(
                        block = candidate.header.number,
                        hash = %candidate.header.hash,
                        "duplicate candidate skipped"
                    );
                }
                Directive::Accept => self.accept(candidate).await?,
                Directive::ForkSuspected => {
                    let replay_to = candidate.header.number;
                    let fork_point = self.resolve_fork(&candidate.header).await?;
                    // Anything queued belongs to the branch just rolled
                    // back; replay the canonical range instead.
                    queue.clear();
                    for number in fork_point..=replay_to {
                        if self.cancel.is_cancelled() {
                            return Err(IndexerError::Aborted {
                                reason: "shutdown during reorg replay".into(),
                            });
                        }
                        let replayed = self.provider.block_with_receipts(number).await?;
                        self.health.record_rpc();
                        queue.push_back(replayed);
                    }
                }
            }
        }
        Ok(())
    }

    async fn accept(&mut self, candidate: BlockCandidate) -> Result<(), IndexerError> {
        let events = self.processor.prepare(&candidate);
        let cursor = self.commit_with_retry(&candidate.header, &events).await?;
        self.health.record_database();

        self.detector.accept(candidate.header.clone());
        self.cursor = Some(cursor.clone());
        self.set_status(if candidate.header.number >= self.live_from {
            IndexerStatus::Live
        } else {
            IndexerStatus::Backfilling
        });

        let status = self.status.borrow().clone();
        self.dispatcher
            .dispatch_block(&candidate.header, &events, &cursor, status)
            .await;
        Ok(())
    }

    /// Commit with bounded backoff on transient storage failures. On
    /// exhaustion the pipeline halts in a safe state: the cursor is
    /// unchanged and nothing was partially written.
    async fn commit_with_retry(
        &self,
        header: &BlockHeader,
        events: &[starkindex_core::Event],
    ) -> Result<Cursor, IndexerError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.processor.commit_block(header, events).await {
                Ok(cursor) => return Ok(cursor),
                Err(e) if e.is_transient() && attempt < MAX_COMMIT_ATTEMPTS => {
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(
                        block = header.number,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient commit failure, retrying"
                    );
                    if !self.sleep(delay).await {
                        return Err(IndexerError::Aborted {
                            reason: "shutdown while retrying commit".into(),
                        });
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Locate the fork point, roll back past it, and notify the reorg
    /// handler. Returns the fork point (first rolled-back block).
    async fn resolve_fork(&mut self, header: &BlockHeader) -> Result<u64, IndexerError> {
        self.set_status(IndexerStatus::ReorgRecovery);
        tracing::warn!(
            block = header.number,
            hash = %header.hash,
            parent = %header.parent_hash,
            "fork suspected, locating common ancestor"
        );

        let fork_point = self.locate_fork_point(header).await?;
        if fork_point == 0 {
            return Err(IndexerError::DeepReorg {
                at_block: header.number,
                window: self.window,
            });
        }

        let tip_number = fork_point - 1;
        let tip = match self.detector.get(tip_number).cloned() {
            Some(tip) => tip,
            None => self
                .storage
                .block_by_number(tip_number)
                .await?
                .ok_or(IndexerError::DeepReorg {
                    at_block: header.number,
                    window: self.window,
                })?,
        };

        let new_cursor = Cursor::new(tip_number, tip.hash.clone());
        self.rollback_with_retry(fork_point, &new_cursor).await?;
        self.health.record_database();
        self.detector.truncate_from(fork_point);
        self.cursor = Some(new_cursor.clone());

        self.dispatcher
            .dispatch_reorg(fork_point, &tip, &new_cursor)
            .await;
        Ok(fork_point)
    }

    /// Walk the candidate's ancestor chain backward until it reconnects to
    /// the canonical tail. Exceeding the window is fatal.
    async fn locate_fork_point(&self, header: &BlockHeader) -> Result<u64, IndexerError> {
        if self.detector.is_empty() {
            // Tail empty: the candidate failed the cursor linkage check.
            // Walk back one block — the cursor block itself is forked.
            return self
                .cursor
                .as_ref()
                .map(|c| c.block_number)
                .ok_or(IndexerError::Aborted {
                    reason: "fork reported before anything was committed".into(),
                });
        }

        // The candidate may link straight into the tail (e.g. a replaced
        // tip) without any fetching.
        if let Some(fork_point) = self.detector.match_ancestor(header) {
            return Ok(fork_point);
        }

        let oldest = self
            .detector
            .oldest()
            .map(|h| h.number)
            .unwrap_or_default();
        let mut number = header.number.saturating_sub(1);
        while number >= oldest {
            let ancestor = self.provider.block_header(number).await?;
            self.health.record_rpc();
            if let Some(fork_point) = self.detector.match_ancestor(&ancestor) {
                return Ok(fork_point);
            }
            if number == 0 {
                break;
            }
            number -= 1;
        }

        Err(IndexerError::DeepReorg {
            at_block: header.number,
            window: self.window,
        })
    }

    async fn rollback_with_retry(
        &self,
        fork_point: u64,
        new_cursor: &Cursor,
    ) -> Result<(), IndexerError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.processor.rollback_from(fork_point, new_cursor).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_transient() && attempt < MAX_COMMIT_ATTEMPTS => {
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(
                        fork_point,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient rollback failure, retrying"
                    );
                    if !self.sleep(delay).await {
                        return Err(IndexerError::Aborted {
                            reason: "shutdown while retrying rollback".into(),
                        });
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn fail(&self, error: IndexerError) {
        tracing::error!(error = %error, "pipeline halted");
        let _ = self.status.send(IndexerStatus::Failed(error.to_string()));
    }

    fn set_status(&self, next: IndexerStatus) {
        self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    /// Returns `false` if cancelled during the sleep.
    async fn sleep(&self, delay: std::time::Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
