//! In-memory collaborators for running the synchronizer without a real node: a deterministic canonical chain, a
//! [ChainEngine] which stores blocks in a map and a [PeerTransport] whose peers serve the canonical chain after a
//! delay, some of them badly.

use std::{
    collections::HashMap,
    fmt::{self, Display, Formatter},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, anyhow};
use parking_lot::{Mutex, RwLock};
use primitive_types::U256;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::{
    runtime::Handle,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    time::Instant,
};
use tracing::{debug, info, trace};

use crate::{
    cfg::{SimulationConfig, SyncConfig},
    crypto::Hash,
    interfaces::{
        BestBlock, ChainEngine, HeaderValidator, ImportOutcome, PeerTransport, SealValidator,
        SyncEvent,
    },
    message::{Block, BlockBody, BlockHeader, ExternalMessage, PeerId, PeerInfo},
    sync::SyncManager,
};

/// Generate genesis followed by `length` sealed blocks. The same seed always yields the same chain.
pub fn generate_chain(length: u64, seed: u64) -> Vec<Block> {
    CanonicalChain::generate(length, seed).blocks
}

fn next_block(parent: &BlockHeader, rng: &mut ChaCha8Rng) -> Block {
    let transactions = (0..rng.gen_range(0..4usize))
        .map(|_| {
            let mut transaction = vec![0u8; rng.gen_range(1..64usize)];
            rng.fill(&mut transaction[..]);
            transaction
        })
        .collect();
    let body = BlockBody { transactions };
    let header = BlockHeader {
        number: parent.number + 1,
        parent_hash: parent.hash,
        hash: Hash::ZERO,
        difficulty: U256::from(rng.gen_range(1..=16u64)),
        timestamp: parent.timestamp + rng.gen_range(1..20u64),
        transactions_root: body.transactions_root(),
    }
    .seal();
    Block { header, body }
}

/// The chain every simulated peer agrees on. It keeps growing while [mine] runs.
#[derive(Debug)]
pub struct CanonicalChain {
    /// Indexed by block number.
    blocks: Vec<Block>,
    total_difficulties: Vec<U256>,
    by_hash: HashMap<Hash, u64>,
    rng: ChaCha8Rng,
}

impl CanonicalChain {
    pub fn generate(length: u64, seed: u64) -> CanonicalChain {
        let genesis = Block::genesis();
        let mut chain = CanonicalChain {
            total_difficulties: vec![genesis.header.difficulty],
            by_hash: HashMap::from([(genesis.hash(), 0)]),
            blocks: vec![genesis],
            rng: ChaCha8Rng::seed_from_u64(seed),
        };
        for _ in 0..length {
            chain.mine();
        }
        chain
    }

    /// Extend the chain by one block.
    pub fn mine(&mut self) -> &Block {
        let parent = self.tip().header.clone();
        let block = next_block(&parent, &mut self.rng);
        let total_difficulty = self.total_difficulty() + block.header.difficulty;
        self.by_hash.insert(block.hash(), block.number());
        self.total_difficulties.push(total_difficulty);
        self.blocks.push(block);
        self.tip()
    }

    pub fn height(&self) -> u64 {
        self.tip().number()
    }

    pub fn tip(&self) -> &Block {
        // Genesis is always present.
        &self.blocks[self.blocks.len() - 1]
    }

    pub fn total_difficulty(&self) -> U256 {
        self.total_difficulties[self.total_difficulties.len() - 1]
    }

    pub fn block(&self, number: u64) -> Option<&Block> {
        self.blocks.get(usize::try_from(number).ok()?)
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Up to `count` headers starting at `from`; fewer if the chain is shorter.
    pub fn headers(&self, from: u64, count: u64) -> Vec<BlockHeader> {
        (from..from.saturating_add(count))
            .map_while(|number| self.block(number))
            .map(|block| block.header.clone())
            .collect()
    }

    /// Bodies for `hashes` in order, stopping at the first unknown hash.
    pub fn bodies(&self, hashes: &[Hash]) -> Vec<BlockBody> {
        hashes
            .iter()
            .map_while(|hash| self.by_hash.get(hash).and_then(|n| self.block(*n)))
            .map(|block| block.body.clone())
            .collect()
    }
}

/// Grow the canonical chain by one block every `interval`, until the task is aborted.
pub async fn mine(canonical: Arc<RwLock<CanonicalChain>>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        let number = canonical.write().mine().number();
        trace!(%number, "Mine : block");
    }
}

#[derive(Debug)]
struct StoredBlock {
    block: Block,
    total_difficulty: U256,
}

#[derive(Debug)]
struct MemoryChainState {
    blocks: HashMap<Hash, StoredBlock>,
    best: BestBlock,
}

/// A chain engine which keeps every block it accepts in memory and follows the heaviest chain.
#[derive(Debug)]
pub struct MemoryChain {
    state: Mutex<MemoryChainState>,
}

impl Default for MemoryChain {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryChain {
    pub fn new() -> MemoryChain {
        let genesis = Block::genesis();
        let best = BestBlock {
            number: 0,
            hash: genesis.hash(),
            total_difficulty: genesis.header.difficulty,
        };
        MemoryChain {
            state: Mutex::new(MemoryChainState {
                blocks: HashMap::from([(
                    genesis.hash(),
                    StoredBlock {
                        total_difficulty: genesis.header.difficulty,
                        block: genesis,
                    },
                )]),
                best,
            }),
        }
    }

    /// A chain which already holds `blocks`, which must connect to genesis in order.
    pub fn with_blocks<'a>(blocks: impl IntoIterator<Item = &'a Block>) -> Result<MemoryChain> {
        let chain = MemoryChain::new();
        for block in blocks {
            match chain.try_import(block)? {
                ImportOutcome::ImportedBest | ImportOutcome::AlreadyExists => {}
                outcome => {
                    return Err(anyhow!("block {} was {outcome}", block.number()));
                }
            }
        }
        Ok(chain)
    }

    pub fn len(&self) -> usize {
        self.state.lock().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.state.lock().blocks.contains_key(hash)
    }

}

impl ChainEngine for MemoryChain {
    fn best_block(&self) -> BestBlock {
        self.state.lock().best.clone()
    }

    fn try_import(&self, block: &Block) -> Result<ImportOutcome> {
        let mut state = self.state.lock();
        let hash = block.hash();
        if state.blocks.contains_key(&hash) {
            return Ok(ImportOutcome::AlreadyExists);
        }
        let Some(parent) = state.blocks.get(&block.parent_hash()) else {
            return Ok(ImportOutcome::NoParent);
        };
        if block.number() != parent.block.number() + 1
            || !SealValidator.validate(&block.header)
            || block.body.transactions_root() != block.header.transactions_root
        {
            return Ok(ImportOutcome::Invalid);
        }

        let total_difficulty = parent.total_difficulty + block.header.difficulty;
        state.blocks.insert(
            hash,
            StoredBlock {
                block: block.clone(),
                total_difficulty,
            },
        );
        if total_difficulty > state.best.total_difficulty {
            state.best = BestBlock {
                number: block.number(),
                hash,
                total_difficulty,
            };
            Ok(ImportOutcome::ImportedBest)
        } else {
            Ok(ImportOutcome::ImportedNotBest)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerBehaviour {
    Honest,
    /// Drops about half of its responses.
    Unreliable,
    /// Reports an honest status, but serves headers with a broken seal.
    Lying,
}

impl Display for PeerBehaviour {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PeerBehaviour::Honest => write!(f, "honest"),
            PeerBehaviour::Unreliable => write!(f, "unreliable"),
            PeerBehaviour::Lying => write!(f, "lying"),
        }
    }
}

/// A response from a simulated peer, to be fed back into the synchronizer with [deliver].
#[derive(Debug, Clone)]
pub enum Inbound {
    Status {
        peer: PeerId,
        number: u64,
        hash: Hash,
        total_difficulty: U256,
    },
    Headers {
        peer: PeerId,
        display_id: String,
        headers: Vec<BlockHeader>,
    },
    Bodies {
        peer: PeerId,
        display_id: String,
        bodies: Option<Vec<BlockBody>>,
    },
}

#[derive(Debug, Clone)]
struct SimPeer {
    id: PeerId,
    display_id: String,
    behaviour: PeerBehaviour,
}

pub struct SimNetwork {
    peers: Vec<SimPeer>,
    canonical: Arc<RwLock<CanonicalChain>>,
    inbound: UnboundedSender<Inbound>,
    delay: Duration,
    rng: Mutex<ChaCha8Rng>,
    sent: AtomicUsize,
    dropped: AtomicUsize,
}

impl SimNetwork {
    /// Peers are numbered from 1: honest peers first, then unreliable, then lying ones.
    pub fn new(
        config: &SimulationConfig,
        canonical: Arc<RwLock<CanonicalChain>>,
    ) -> (SimNetwork, UnboundedReceiver<Inbound>) {
        let behaviours = std::iter::repeat_n(PeerBehaviour::Honest, config.peers)
            .chain(std::iter::repeat_n(
                PeerBehaviour::Unreliable,
                config.unreliable_peers,
            ))
            .chain(std::iter::repeat_n(PeerBehaviour::Lying, config.lying_peers));
        let peers = behaviours
            .enumerate()
            .map(|(i, behaviour)| SimPeer {
                id: PeerId(i as u64 + 1),
                display_id: format!("{behaviour}-{}", i + 1),
                behaviour,
            })
            .collect();

        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let network = SimNetwork {
            peers,
            canonical,
            inbound,
            delay: config.response_delay,
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(config.seed.wrapping_add(1))),
            sent: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
        };
        (network, inbound_rx)
    }

    pub fn messages_sent(&self) -> usize {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn responses_dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    fn respond(&self, peer: &SimPeer, message: ExternalMessage) -> Inbound {
        let canonical = self.canonical.read();
        match message {
            ExternalMessage::StatusRequest => Inbound::Status {
                peer: peer.id,
                number: canonical.height(),
                hash: canonical.tip().hash(),
                total_difficulty: canonical.total_difficulty(),
            },
            ExternalMessage::HeaderRangeRequest { from, count } => {
                let mut headers = canonical.headers(from, count);
                if peer.behaviour == PeerBehaviour::Lying {
                    for header in &mut headers {
                        header.timestamp += 1;
                    }
                }
                Inbound::Headers {
                    peer: peer.id,
                    display_id: peer.display_id.clone(),
                    headers,
                }
            }
            ExternalMessage::BodiesRequest { hashes } => {
                let bodies = canonical.bodies(&hashes);
                Inbound::Bodies {
                    peer: peer.id,
                    display_id: peer.display_id.clone(),
                    bodies: (!bodies.is_empty()).then_some(bodies),
                }
            }
        }
    }
}

impl PeerTransport for SimNetwork {
    fn active_peers(&self) -> Vec<PeerInfo> {
        let total_difficulty = self.canonical.read().total_difficulty();
        self.peers
            .iter()
            .map(|peer| PeerInfo {
                id: peer.id,
                total_difficulty,
                display_id: peer.display_id.clone(),
            })
            .collect()
    }

    fn send(&self, peer: PeerId, message: ExternalMessage) -> Result<()> {
        let sim_peer = self
            .peers
            .iter()
            .find(|p| p.id == peer)
            .ok_or_else(|| anyhow!("unknown peer {peer}"))?;
        self.sent.fetch_add(1, Ordering::Relaxed);

        if sim_peer.behaviour == PeerBehaviour::Unreliable && self.rng.lock().gen_bool(0.5) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            trace!(peer = %sim_peer.display_id, %message, "SimNetwork : dropped");
            return Ok(());
        }

        let response = self.respond(sim_peer, message);
        let (inbound, delay) = (self.inbound.clone(), self.delay);
        Handle::try_current()?.spawn(async move {
            tokio::time::sleep(delay).await;
            // The simulation may have finished.
            let _ = inbound.send(response);
        });
        Ok(())
    }
}

/// Feed a peer's response into the matching ingress operation.
pub fn deliver(sync: &SyncManager, inbound: Inbound) {
    match inbound {
        Inbound::Status {
            peer,
            number,
            hash,
            total_difficulty,
        } => sync.report_peer_status(peer, number, hash, total_difficulty),
        Inbound::Headers {
            peer,
            display_id,
            headers,
        } => sync.submit_headers(peer, &display_id, headers),
        Inbound::Bodies {
            peer,
            display_id,
            bodies,
        } => sync.submit_bodies(peer, &display_id, bodies),
    }
}

/// How a simulation run ended.
#[derive(Debug, Clone)]
pub struct SimulationReport {
    /// Whether the local chain reached the canonical chain's initial height before the run expired.
    pub synced: bool,
    pub target: u64,
    pub local_best: BestBlock,
    pub canonical_height: u64,
    pub elapsed: Duration,
    pub messages_sent: usize,
    pub responses_dropped: usize,
}

/// A synchronizer wired to a [MemoryChain] and a [SimNetwork].
pub struct Simulation {
    pub canonical: Arc<RwLock<CanonicalChain>>,
    pub chain: Arc<MemoryChain>,
    pub network: Arc<SimNetwork>,
    pub sync: Arc<SyncManager>,
    target: u64,
    run_for: Duration,
    block_interval: Duration,
    inbound: UnboundedReceiver<Inbound>,
    events: UnboundedReceiver<SyncEvent>,
}

impl Simulation {
    pub fn new(sync_config: SyncConfig, config: &SimulationConfig) -> Result<Simulation> {
        config.validate()?;
        let canonical = CanonicalChain::generate(config.chain_length, config.seed);
        let local_length = usize::try_from(config.local_length)?;
        let chain = Arc::new(MemoryChain::with_blocks(
            &canonical.blocks()[1..=local_length],
        )?);
        let canonical = Arc::new(RwLock::new(canonical));

        let (network, inbound) = SimNetwork::new(config, canonical.clone());
        let network = Arc::new(network);
        let (events_tx, events) = mpsc::unbounded_channel();
        let sync = Arc::new(SyncManager::new(
            sync_config,
            chain.clone(),
            network.clone(),
            Arc::new(SealValidator),
            Arc::new(events_tx),
        )?);

        Ok(Simulation {
            canonical,
            chain,
            network,
            sync,
            target: config.chain_length,
            run_for: config.run_for,
            block_interval: config.block_interval,
            inbound,
            events,
        })
    }

    /// Run until the local chain has caught up with the canonical chain, or `run_for` expires.
    pub async fn run(&mut self) -> Result<SimulationReport> {
        let started = Instant::now();
        let handle = self.sync.start()?;
        let miner = tokio::spawn(mine(self.canonical.clone(), self.block_interval));
        info!(target = self.target, "Simulation : started");

        let deadline = tokio::time::sleep(self.run_for);
        tokio::pin!(deadline);
        let synced = loop {
            tokio::select! {
                Some(inbound) = self.inbound.recv() => deliver(&self.sync, inbound),
                Some(SyncEvent::SyncComplete) = self.events.recv() => {
                    if on_canonical_chain(&self.chain, &self.canonical, self.target) {
                        break true;
                    }
                }
                _ = &mut deadline => break false,
            }
        };

        miner.abort();
        handle.shutdown().await;

        let report = SimulationReport {
            synced,
            target: self.target,
            local_best: self.chain.best_block(),
            canonical_height: self.canonical.read().height(),
            elapsed: started.elapsed(),
            messages_sent: self.network.messages_sent(),
            responses_dropped: self.network.responses_dropped(),
        };
        debug!(?report, "Simulation : finished");
        Ok(report)
    }
}

/// Whether our best block is on the canonical chain, at or beyond `target`.
fn on_canonical_chain(
    chain: &MemoryChain,
    canonical: &RwLock<CanonicalChain>,
    target: u64,
) -> bool {
    let local = chain.best_block();
    local.number >= target
        && canonical
            .read()
            .block(local.number)
            .is_some_and(|block| block.hash() == local.hash)
}
