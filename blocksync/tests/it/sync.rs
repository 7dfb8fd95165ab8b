use std::time::Duration;

use blocksync::interfaces::ChainEngine;

use crate::{Network, assert_canonical};

#[blocksync_macros::test]
async fn syncs_from_genesis(network: Network) {
    let (simulation, report) = network.run_until_synced().await;
    assert_canonical(&simulation, &report);
    assert!(simulation.sync.network_best_number() >= network.simulation.chain_length);
}

#[blocksync_macros::test]
async fn resumes_from_a_partial_chain(mut network: Network) {
    network.simulation.local_length = network.random_length(network.simulation.chain_length);
    let (simulation, report) = network.run_until_synced().await;
    assert_canonical(&simulation, &report);
}

#[blocksync_macros::test]
async fn caught_up_node_completes_on_first_status(mut network: Network) {
    network.simulation.local_length = network.simulation.chain_length;
    network.simulation.block_interval = Duration::from_secs(3600);

    let (simulation, report) = network.run_until_synced().await;
    assert_eq!(report.local_best.number, network.simulation.chain_length);
    // The first status round completes the sync.
    assert!(report.elapsed < network.sync.status_initial_delay * 2);
    assert_eq!(simulation.sync.status().queued_blocks, 0);
}

#[blocksync_macros::test]
async fn narrow_windows_still_reach_the_tip(mut network: Network) {
    network.sync.forward_window = 16;
    network.sync.backward_overlap = 4;
    network.sync.max_header_peers = 1;
    network.simulation.chain_length = 200;

    let (simulation, report) = network.run_until_synced().await;
    assert_canonical(&simulation, &report);
}

#[blocksync_macros::test]
async fn tiny_block_queue(mut network: Network) {
    network.sync.max_queued_blocks = 1;

    let (simulation, report) = network.run_until_synced().await;
    assert_canonical(&simulation, &report);
}

#[blocksync_macros::test]
async fn shutdown_stops_the_engine(network: Network) {
    let (simulation, _) = network.run_until_synced().await;
    assert!(!simulation.sync.is_running());

    // Nothing more is imported once stopped.
    let best = simulation.chain.best_block();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(simulation.chain.best_block(), best);
}
