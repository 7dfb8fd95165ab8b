//! Periodic tasks which run alongside the sync workers.

use std::sync::Arc;

use tokio::{
    sync::watch,
    time::{Instant, MissedTickBehavior, interval, interval_at},
};
use tracing::{debug, info};

use crate::sync::{SyncManager, stopped};

/// Ask every active peer for its status, after `status_initial_delay` and then every `status_interval`.
pub(crate) async fn broadcast_status(sync: Arc<SyncManager>, mut running: watch::Receiver<bool>) {
    let config = sync.config();
    let mut ticker = interval_at(
        Instant::now() + config.status_initial_delay,
        config.status_interval,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stopped(&mut running) => break,
            _ = ticker.tick() => sync.request_peer_status(),
        }
    }
    debug!("StatusBroadcast : stopped");
}

/// Log a [crate::sync::SyncStatus] line straight away and then every `status_report_interval`. Observational only.
pub(crate) async fn report_status(sync: Arc<SyncManager>, mut running: watch::Receiver<bool>) {
    let mut ticker = interval(sync.config().status_report_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stopped(&mut running) => break,
            _ = ticker.tick() => {
                let status = sync.status();
                info!(
                    local = status.local_best_number,
                    network = status.network_best.number,
                    queued = status.queued_blocks,
                    %status,
                    "SyncStatus"
                );
            }
        }
    }
    debug!("SyncStatus : stopped");
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use anyhow::Result;
    use parking_lot::Mutex;
    use primitive_types::U256;
    use tokio::sync::mpsc;

    use crate::{
        cfg::SyncConfig,
        crypto::Hash,
        interfaces::{BestBlock, ChainEngine, ImportOutcome, PeerTransport, SealValidator},
        message::{Block, ExternalMessage, PeerId, PeerInfo},
        sync::SyncManager,
    };

    /// Counts how often its best block is read.
    #[derive(Default)]
    struct IdleChain {
        reads: AtomicUsize,
    }

    impl ChainEngine for IdleChain {
        fn best_block(&self) -> BestBlock {
            self.reads.fetch_add(1, Ordering::SeqCst);
            BestBlock {
                number: 0,
                hash: Hash::ZERO,
                total_difficulty: U256::zero(),
            }
        }

        fn try_import(&self, _: &Block) -> Result<ImportOutcome> {
            Ok(ImportOutcome::Invalid)
        }
    }

    #[derive(Default)]
    struct CountingTransport {
        status_requests: Mutex<Vec<PeerId>>,
    }

    impl PeerTransport for CountingTransport {
        fn active_peers(&self) -> Vec<PeerInfo> {
            vec![PeerInfo {
                id: PeerId(9),
                total_difficulty: U256::one(),
                display_id: "peer-9".to_owned(),
            }]
        }

        fn send(&self, peer: PeerId, message: ExternalMessage) -> Result<()> {
            if message == ExternalMessage::StatusRequest {
                self.status_requests.lock().push(peer);
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_cadence_follows_config() {
        let transport = Arc::new(CountingTransport::default());
        let (events, _events) = mpsc::unbounded_channel();
        let config = SyncConfig {
            status_initial_delay: Duration::from_millis(100),
            status_interval: Duration::from_millis(250),
            show_status: true,
            status_report_interval: Duration::from_millis(300),
            ..Default::default()
        };
        let sync = Arc::new(
            SyncManager::new(
                config,
                Arc::new(IdleChain::default()),
                transport.clone(),
                Arc::new(SealValidator),
                Arc::new(events),
            )
            .unwrap(),
        );
        let handle = sync.start().unwrap();

        // Ticks at 100, 350, 600 and 850ms.
        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(*transport.status_requests.lock(), vec![PeerId(9); 4]);

        handle.shutdown().await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(transport.status_requests.lock().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn status_report_starts_immediately() {
        let chain = Arc::new(IdleChain::default());
        let (events, _events) = mpsc::unbounded_channel();
        let config = SyncConfig {
            status_initial_delay: Duration::from_secs(60),
            show_status: true,
            status_report_interval: Duration::from_secs(5),
            ..Default::default()
        };
        let sync = Arc::new(
            SyncManager::new(
                config,
                chain.clone(),
                Arc::new(CountingTransport::default()),
                Arc::new(SealValidator),
                Arc::new(events),
            )
            .unwrap(),
        );
        let handle = sync.start().unwrap();

        // Only the status report reads the local best while nothing is being synced.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(chain.reads.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(chain.reads.load(Ordering::SeqCst), 2);

        handle.shutdown().await;
    }
}
