use std::{
    any::Any,
    fmt::{self, Display, Formatter},
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::{Result, anyhow};
use futures::FutureExt;
use itertools::Itertools;
use parking_lot::Mutex;
use primitive_types::U256;
use rand::seq::SliceRandom;
use tokio::{
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        watch,
    },
    task::JoinSet,
    time::Instant,
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    block_queue::{BlockQueue, Next},
    cfg::SyncConfig,
    crypto::Hash,
    dedup::DedupCache,
    in_flight::{Admission, HeaderBatch, InFlightRequests},
    interfaces::{
        ChainEngine, HeaderValidator, ImportOutcome, PeerTransport, SyncEvent, SyncEventSink,
    },
    message::{Block, BlockBody, BlockHeader, ExternalMessage, PeerId, PeerInfo},
    network_best::{NetworkBest, NetworkBestTracker},
    scheduler,
};

// Block synchronization
//
// Peers tell us about their best block in response to our periodic status requests. When one of them
// reports a chain which is both longer and heavier than anything seen so far, and longer than ours, we ask
// a few of the heaviest peers for a window of headers around our current position.
//
//   status --> network best --> header request --> headers --> body request --> bodies --> block queue
//                                     ^                                                        |
//                                     +------------------ retarget <------- import worker <----+
//
// Headers are validated and queued per peer. A single worker turns each queued batch into a body request,
// allowing at most one outstanding request per peer. Bodies are paired with their headers into blocks
// and queued for import. A second worker drains the block queue in short windows of consecutive blocks
// and hands them to the chain engine. The first block of a window which becomes our new best pushes the
// header window forward past the end of the batch, keeping the pipeline full without waiting for a new
// status report.

/// A point-in-time view of the synchronizer, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    pub local_best_number: u64,
    pub local_best_hash: Hash,
    pub local_total_difficulty: U256,
    pub network_best: NetworkBest,
    pub queued_blocks: usize,
    pub in_flight_requests: usize,
    pub retarget: u64,
}

impl Display for SyncStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "local {}/{}/{} network {}/{}/{} queued {} in-flight {} retarget {}",
            self.local_best_number,
            self.local_best_hash.short(),
            self.local_total_difficulty,
            self.network_best.number,
            self.network_best.hash.short(),
            self.network_best.total_difficulty,
            self.queued_blocks,
            self.in_flight_requests,
            self.retarget,
        )
    }
}

pub struct SyncManager {
    config: SyncConfig,
    // collaborators
    chain: Arc<dyn ChainEngine>,
    transport: Arc<dyn PeerTransport>,
    validator: Arc<dyn HeaderValidator>,
    events: Arc<dyn SyncEventSink>,
    // best chain tip reported by any peer
    network_best: NetworkBestTracker,
    // hashes the import path is finished with
    dedup: DedupCache,
    // outstanding body requests, one per peer
    in_flight: InFlightRequests,
    // validated headers awaiting a body request; replaced when a stopped engine is restarted
    pending_headers: Mutex<UnboundedSender<HeaderBatch>>,
    // taken by the body request worker on start
    pending_headers_rx: Mutex<Option<UnboundedReceiver<HeaderBatch>>>,
    // assembled blocks awaiting import
    blocks: BlockQueue,
    // how far ahead the next header request should look; zero when our position is not trusted
    retarget: AtomicU64,
    running: watch::Sender<bool>,
}

impl SyncManager {
    pub fn new(
        config: SyncConfig,
        chain: Arc<dyn ChainEngine>,
        transport: Arc<dyn PeerTransport>,
        validator: Arc<dyn HeaderValidator>,
        events: Arc<dyn SyncEventSink>,
    ) -> Result<SyncManager> {
        config.validate()?;
        let (pending_headers, pending_headers_rx) = mpsc::unbounded_channel();
        let (running, _) = watch::channel(false);
        Ok(SyncManager {
            dedup: DedupCache::new(config.dedup_capacity)?,
            in_flight: InFlightRequests::new(config.body_request_timeout),
            config,
            chain,
            transport,
            validator,
            events,
            network_best: NetworkBestTracker::new(),
            pending_headers: Mutex::new(pending_headers),
            pending_headers_rx: Mutex::new(Some(pending_headers_rx)),
            blocks: BlockQueue::new(),
            retarget: AtomicU64::new(0),
            running,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Spawn the body request worker, the import worker and the status scheduler. Must be called from within a
    /// tokio runtime.
    pub fn start(self: &Arc<Self>) -> Result<SyncHandle> {
        if self.running.send_replace(true) {
            return Err(anyhow!("sync already running"));
        }
        // The previous run's receiver went down with its body request worker.
        let headers = match self.pending_headers_rx.lock().take() {
            Some(headers) => headers,
            None => {
                let (sender, headers) = mpsc::unbounded_channel();
                *self.pending_headers.lock() = sender;
                headers
            }
        };

        let mut tasks = JoinSet::new();
        tasks.spawn(self.clone().body_request_worker(headers, self.running.subscribe()));
        tasks.spawn(self.clone().import_worker(self.running.subscribe()));
        tasks.spawn(scheduler::broadcast_status(
            self.clone(),
            self.running.subscribe(),
        ));
        if self.config.show_status {
            tasks.spawn(scheduler::report_status(self.clone(), self.running.subscribe()));
        }
        info!(
            forward_window = self.config.forward_window,
            max_header_peers = self.config.max_header_peers,
            "Sync : started"
        );

        Ok(SyncHandle {
            sync: self.clone(),
            tasks,
        })
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    pub fn network_best_number(&self) -> u64 {
        self.network_best.number()
    }

    pub fn status(&self) -> SyncStatus {
        let local = self.chain.best_block();
        SyncStatus {
            local_best_number: local.number,
            local_best_hash: local.hash,
            local_total_difficulty: local.total_difficulty,
            network_best: self.network_best.snapshot(),
            queued_blocks: self.blocks.len(),
            in_flight_requests: self.in_flight.len(),
            retarget: self.retarget.load(Ordering::SeqCst),
        }
    }

    /// Ask every active peer for its best block.
    pub fn request_peer_status(&self) {
        let peers = self.transport.active_peers();
        trace!(peers = peers.len(), "PeerStatus : requesting");
        for peer in peers {
            if let Err(e) = self.transport.send(peer.id, ExternalMessage::StatusRequest) {
                debug!(peer = %peer.display_id, %e, "PeerStatus : send failed");
            }
        }
    }

    /// A peer told us about its best block.
    pub fn report_peer_status(
        &self,
        peer: PeerId,
        number: u64,
        hash: Hash,
        total_difficulty: U256,
    ) {
        let observation = self.network_best.observe(number, hash, total_difficulty);
        let local = self.chain.best_block();

        if observation.updated {
            debug!(%peer, %number, %hash, %total_difficulty, local = local.number, "PeerStatus : new best");
            if number > local.number {
                self.dispatch_headers();
            }
        }

        if observation.best.number <= local.number {
            trace!(local = local.number, network = observation.best.number, "PeerStatus : synced");
            self.events.emit(SyncEvent::SyncComplete);
        }
    }

    /// Ask up to `max_header_peers` of the heaviest peers for headers around our current position.
    fn dispatch_headers(&self) {
        let local = self.chain.best_block().number;
        let anchor = local.max(self.retarget.load(Ordering::SeqCst));
        let required = self.network_best.total_difficulty();

        let candidates: Vec<PeerInfo> = self
            .transport
            .active_peers()
            .into_iter()
            .filter(|peer| peer.total_difficulty >= required)
            .unique_by(|peer| peer.id)
            .collect();
        if candidates.is_empty() {
            debug!(%required, "HeaderRequest : insufficient peers");
            return;
        }

        let from = anchor.saturating_sub(self.config.backward_overlap).max(1);
        let to = anchor.saturating_add(self.config.forward_window);
        let count = to - from + 1;

        let selected = candidates.choose_multiple(&mut rand::thread_rng(), self.config.max_header_peers);
        for peer in selected {
            debug!(%from, %to, peer = %peer.display_id, "HeaderRequest : requesting");
            if let Err(e) = self
                .transport
                .send(peer.id, ExternalMessage::HeaderRangeRequest { from, count })
            {
                warn!(peer = %peer.display_id, %e, "HeaderRequest : send failed");
            }
        }
    }

    /// A peer responded to a header range request.
    pub fn submit_headers(&self, peer: PeerId, display_id: &str, mut headers: Vec<BlockHeader>) {
        if headers.is_empty() {
            return;
        }
        // `sort_by_key` is stable.
        headers.sort_by_key(|header| header.number);

        if let Some(invalid) = headers.iter().find(|header| !self.validator.validate(header)) {
            warn!(
                peer = display_id,
                number = invalid.number,
                hash = %invalid.hash,
                count = headers.len(),
                "HeaderResponse : invalid"
            );
            return;
        }

        let received = headers.len();
        headers.retain(|header| !self.dedup.contains(&header.hash));
        trace!(peer = display_id, received, fresh = headers.len(), "HeaderResponse : received");

        let batch = HeaderBatch::new(peer, headers);
        if self.pending_headers.lock().send(batch).is_err() {
            debug!(peer = display_id, "HeaderResponse : stopped");
        }
    }

    /// Turn a queued header batch into a body request, unless the peer is already serving one.
    fn request_bodies(&self, batch: HeaderBatch) {
        let peer = batch.peer;
        if batch.is_empty() {
            trace!(%peer, "BodyRequest : nothing to request");
            return;
        }
        let (first, last) = (batch.first_number(), batch.last_number());

        let hashes = match self.in_flight.admit(batch, Instant::now()) {
            Admission::Fresh(hashes) => {
                debug!(%peer, ?first, ?last, "BodyRequest : requesting");
                hashes
            }
            Admission::Retry(hashes) => {
                debug!(%peer, ?first, ?last, "BodyRequest : retry");
                hashes
            }
            Admission::Busy => {
                trace!(%peer, ?first, ?last, "BodyRequest : busy");
                return;
            }
        };

        if let Err(e) = self
            .transport
            .send(peer, ExternalMessage::BodiesRequest { hashes })
        {
            warn!(%peer, %e, "BodyRequest : send failed");
        }
    }

    /// A peer responded to a body request. `None` means the peer could not serve it.
    pub fn submit_bodies(&self, peer: PeerId, display_id: &str, bodies: Option<Vec<BlockBody>>) {
        let Some(batch) = self.in_flight.take(peer) else {
            debug!(peer = display_id, "BodyResponse : spurious");
            return;
        };
        let Some(bodies) = bodies else {
            debug!(peer = display_id, "BodyResponse : empty");
            return;
        };

        let queued = self.blocks.len();
        if queued >= self.config.max_queued_blocks {
            debug!(peer = display_id, %queued, "BodyResponse : dropped");
            return;
        }

        let mut blocks = Vec::with_capacity(batch.len().min(bodies.len()));
        for (header, body) in batch.headers.into_iter().zip(bodies) {
            match Block::from_network(header, body) {
                Ok(block) => blocks.push(block),
                Err(e) => {
                    warn!(peer = display_id, %e, kept = blocks.len(), "BodyResponse : assembly failed");
                    break;
                }
            }
        }
        if blocks.is_empty() {
            return;
        }

        blocks.sort_by_key(Block::number);
        debug!(
            peer = display_id,
            first = blocks[0].number(),
            count = blocks.len(),
            "BodyResponse : queued"
        );
        self.blocks.push_batch(blocks);
    }

    async fn body_request_worker(
        self: Arc<Self>,
        mut headers: UnboundedReceiver<HeaderBatch>,
        mut running: watch::Receiver<bool>,
    ) {
        loop {
            let batch = tokio::select! {
                biased;
                _ = stopped(&mut running) => break,
                batch = headers.recv() => match batch {
                    Some(batch) => batch,
                    None => break,
                },
            };
            if let Err(panic) =
                std::panic::catch_unwind(AssertUnwindSafe(|| self.request_bodies(batch)))
            {
                error!(panic = panic_message(&*panic), "BodyRequest : cycle failed");
            }
        }
        debug!("BodyRequest : stopped");
    }

    async fn import_worker(self: Arc<Self>, mut running: watch::Receiver<bool>) {
        while *running.borrow() {
            let cycle = AssertUnwindSafe(self.import_cycle(&mut running)).catch_unwind();
            if let Err(panic) = cycle.await {
                error!(panic = panic_message(&*panic), "ImportBlocks : cycle failed");
            }
        }
        debug!("ImportBlocks : stopped");
    }

    async fn import_cycle(&self, running: &mut watch::Receiver<bool>) {
        let batch = self.drain_batch().await;
        if batch.is_empty() {
            tokio::select! {
                _ = stopped(running) => {}
                _ = self.blocks.wait() => {}
                _ = tokio::time::sleep(self.config.import_idle_backoff) => {}
            }
            return;
        }
        self.import_batch(&batch);
    }

    /// Collect a run of consecutive blocks from the queue, for at most `import_batch_window`. Blocks we are already
    /// finished with are consumed but left out.
    async fn drain_batch(&self) -> Vec<Block> {
        let deadline = Instant::now() + self.config.import_batch_window;
        let mut batch = Vec::new();
        let mut previous = None;
        loop {
            match self.blocks.pop_next(previous) {
                Next::Block(block) => {
                    previous = Some(block.number());
                    if self.dedup.contains(&block.hash()) {
                        trace!(number = block.number(), hash = %block.hash(), "ImportBlocks : seen");
                    } else {
                        batch.push(block);
                    }
                }
                Next::Gap(number) => {
                    trace!(%number, ?previous, "ImportBlocks : gap");
                    break;
                }
                Next::Empty => {
                    tokio::select! {
                        _ = self.blocks.wait() => {}
                        _ = tokio::time::sleep_until(deadline) => break,
                    }
                }
            }
            if Instant::now() >= deadline {
                break;
            }
        }
        batch
    }

    fn import_batch(&self, batch: &[Block]) {
        let Some(last) = batch.last().map(Block::number) else {
            return;
        };
        let mut retargeted = false;

        for block in batch {
            let (number, hash) = (block.number(), block.hash());
            match self.chain.try_import(block) {
                Ok(ImportOutcome::ImportedBest) => {
                    info!(%number, %hash, txns = block.transaction_count(), "ImportBlocks : best");
                    self.dedup.insert(hash);
                    if !retargeted {
                        retargeted = true;
                        self.retarget.store(last, Ordering::SeqCst);
                        self.dispatch_headers();
                    }
                }
                Ok(ImportOutcome::ImportedNotBest) => {
                    info!(%number, %hash, "ImportBlocks : side branch");
                    self.dedup.insert(hash);
                }
                Ok(ImportOutcome::AlreadyExists) => {
                    debug!(%number, %hash, "ImportBlocks : exists");
                    self.dedup.insert(hash);
                }
                Ok(ImportOutcome::NoParent) => {
                    debug!(%number, %hash, parent = %block.parent_hash(), "ImportBlocks : no parent");
                    self.retarget.store(0, Ordering::SeqCst);
                    break;
                }
                Ok(ImportOutcome::Invalid) => {
                    debug!(%number, %hash, "ImportBlocks : invalid");
                }
                Err(e) => {
                    warn!(%number, %hash, %e, "ImportBlocks : unrecognized");
                }
            }
        }
    }
}

/// The running synchronizer. Dropping the handle stops the engine and aborts its tasks, without waiting for an
/// import in progress; prefer [SyncHandle::shutdown].
pub struct SyncHandle {
    sync: Arc<SyncManager>,
    tasks: JoinSet<()>,
}

impl SyncHandle {
    pub fn sync(&self) -> &Arc<SyncManager> {
        &self.sync
    }

    /// Stop the scheduler and both workers, and wait for them to finish. An import already in progress completes.
    pub async fn shutdown(mut self) {
        self.sync.running.send_replace(false);
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                error!(%e, "Sync : task failed");
            }
        }
        info!("Sync : stopped");
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        self.sync.running.send_replace(false);
    }
}

/// Completes once the running flag is cleared, or its sender is gone.
pub(crate) async fn stopped(running: &mut watch::Receiver<bool>) {
    let _ = running.wait_for(|running| !*running).await;
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}
