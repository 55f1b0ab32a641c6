use std::path::PathBuf;
use std::sync::Arc;

use ln_consensus::{Clique, ConsensusEngine, DatasetCache, Ethash, EthashConfig, PowMode};
use ln_types::ChainConfig;
use tracing::{info, warn};

use crate::{NodeError, ServiceContext};

/// Pick the consensus engine for `chain_config`.
///
/// An authority schedule wins over proof-of-work.  `shared` is the dataset
/// cache handed to engines in [`PowMode::Shared`]; without one each such
/// engine gets its own test-sized cache.
pub fn create_consensus_engine(
    ctx: &ServiceContext,
    config: &EthashConfig,
    chain_config: &ChainConfig,
    shared: Option<Arc<DatasetCache>>,
) -> Result<ConsensusEngine, NodeError> {
    if let Some(clique) = chain_config.clique {
        if clique.epoch == 0 {
            return Err(NodeError::InvalidConsensusConfig(
                "clique epoch must be positive".into(),
            ));
        }
        info!(period = clique.period, epoch = clique.epoch, "Using proof-of-authority consensus");
        return Ok(ConsensusEngine::Clique(Clique::new(clique)));
    }

    let engine = match config.pow_mode {
        PowMode::Fake => {
            warn!("Ethash used in fake mode");
            Ethash::new_fake()
        }
        PowMode::Test => {
            warn!("Ethash used in test mode");
            Ethash::new(config.clone())
        }
        PowMode::Shared => {
            warn!("Ethash used in shared mode");
            Ethash::new_shared(shared.unwrap_or_else(DatasetCache::shared))
        }
        PowMode::Normal => {
            // Without a data directory the verification caches stay in memory.
            let (cache_dir, caches_on_disk) = match ctx.resolve_path(&config.cache_dir) {
                Some(dir) => (dir, config.caches_on_disk),
                None => (PathBuf::new(), 0),
            };
            let engine = Ethash::new(EthashConfig {
                cache_dir,
                caches_on_disk,
                ..config.clone()
            });
            engine.set_threads(-1);
            engine
        }
    };
    Ok(ConsensusEngine::Ethash(engine))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ln_types::CliqueConfig;

    #[test]
    fn clique_takes_precedence_over_pow_mode() {
        let ctx = ServiceContext::ephemeral();
        let engine = create_consensus_engine(
            &ctx,
            &EthashConfig {
                pow_mode: PowMode::Fake,
                ..EthashConfig::default()
            },
            &ChainConfig::all_clique(5),
            None,
        )
        .unwrap();
        assert!(engine.is_clique());
    }

    #[test]
    fn pow_modes_map_to_engines() {
        let ctx = ServiceContext::ephemeral();
        let chain = ChainConfig::all_ethash();
        for mode in [PowMode::Fake, PowMode::Shared] {
            let config = EthashConfig {
                pow_mode: mode,
                ..EthashConfig::default()
            };
            let engine = create_consensus_engine(&ctx, &config, &chain, None).unwrap();
            assert_eq!(engine.as_ethash().map(Ethash::mode), Some(mode));
        }
    }

    #[test]
    fn normal_mode_disables_local_mining() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ServiceContext::new(Some(dir.path().to_path_buf()), Default::default());
        let config = EthashConfig {
            caches_on_disk: 0,
            datasets_on_disk: 0,
            ..EthashConfig::default()
        };
        let engine = create_consensus_engine(&ctx, &config, &ChainConfig::all_ethash(), None).unwrap();
        let ethash = engine.as_ethash().unwrap();
        assert_eq!(ethash.mode(), PowMode::Normal);
        assert_eq!(ethash.threads(), -1);
    }

    #[test]
    fn shared_engines_reuse_one_cache() {
        let ctx = ServiceContext::ephemeral();
        let config = EthashConfig {
            pow_mode: PowMode::Shared,
            ..EthashConfig::default()
        };
        let cache = DatasetCache::shared();
        let a = create_consensus_engine(&ctx, &config, &ChainConfig::all_ethash(), Some(cache.clone())).unwrap();
        let b = create_consensus_engine(&ctx, &config, &ChainConfig::all_ethash(), Some(cache.clone())).unwrap();
        let a = a.as_ethash().unwrap().dataset_cache();
        let b = b.as_ethash().unwrap().dataset_cache();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn zero_epoch_is_rejected() {
        let mut chain = ChainConfig::all_clique(1);
        chain.clique = Some(CliqueConfig { period: 1, epoch: 0 });
        let err = create_consensus_engine(&ServiceContext::ephemeral(), &EthashConfig::default(), &chain, None)
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
