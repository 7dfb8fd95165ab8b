mod sync;
mod unreliable;

use blocksync::{
    cfg::{SimulationConfig, SyncConfig},
    sim::{Simulation, SimulationReport},
};
use rand::Rng;
use rand_chacha::ChaCha8Rng;

/// A simulated peer network and a local node to sync from it. Built by `#[blocksync_macros::test]` for each seed.
pub struct Network {
    pub seed: u64,
    rng: ChaCha8Rng,
    pub sync: SyncConfig,
    pub simulation: SimulationConfig,
}

impl Network {
    pub fn new(rng: ChaCha8Rng, seed: u64) -> Network {
        Network {
            seed,
            rng,
            sync: SyncConfig::default(),
            simulation: SimulationConfig {
                chain_length: 600,
                seed,
                ..Default::default()
            },
        }
    }

    pub fn random_length(&mut self, max: u64) -> u64 {
        self.rng.gen_range(1..max)
    }

    pub fn simulation(&self) -> Simulation {
        Simulation::new(self.sync.clone(), &self.simulation).unwrap()
    }

    /// Build the simulation and run it to completion, asserting that the local node caught up.
    pub async fn run_until_synced(&self) -> (Simulation, SimulationReport) {
        let mut simulation = self.simulation();
        let report = simulation.run().await.unwrap();
        assert!(
            report.synced,
            "did not reach {} (got to {} of {})",
            report.target, report.local_best.number, report.canonical_height
        );
        (simulation, report)
    }
}

/// Every canonical block up to `report.target` is in the local chain, and nothing else is.
pub fn assert_canonical(simulation: &Simulation, report: &SimulationReport) {
    let canonical = simulation.canonical.read();
    for block in &canonical.blocks()[..=report.target as usize] {
        assert!(
            simulation.chain.contains(&block.hash()),
            "missing canonical block {}",
            block.number()
        );
    }
    assert_eq!(
        simulation.chain.len() as u64,
        report.local_best.number + 1,
        "local chain holds blocks off the canonical chain"
    );
}
