use std::time::Duration;

use crate::{Network, assert_canonical};

#[blocksync_macros::test]
async fn unreliable_peers_do_not_stall_sync(mut network: Network) {
    network.simulation.peers = 2;
    network.simulation.unreliable_peers = 3;

    let (simulation, report) = network.run_until_synced().await;
    assert_canonical(&simulation, &report);
    assert!(report.responses_dropped > 0);
}

#[blocksync_macros::test]
async fn lying_peers_are_ignored(mut network: Network) {
    network.simulation.chain_length = 300;
    network.simulation.peers = 1;
    network.simulation.lying_peers = 3;

    let (simulation, report) = network.run_until_synced().await;
    assert_canonical(&simulation, &report);
}

#[blocksync_macros::test]
async fn only_lying_peers_never_complete(mut network: Network) {
    network.simulation.peers = 0;
    network.simulation.lying_peers = 3;
    network.simulation.run_for = Duration::from_secs(20);

    let mut simulation = network.simulation();
    let report = simulation.run().await.unwrap();
    assert!(!report.synced);
    assert_eq!(report.local_best.number, 0);
    assert_eq!(simulation.chain.len(), 1);
    // Their status reports were still believed.
    assert!(simulation.sync.network_best_number() >= network.simulation.chain_length);
}
