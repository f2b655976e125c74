//! Fleet Configuration

use std::sync::Arc;
use std::time::Duration;

use stratus_codec::{CompressionMode, Encoding, PackerFactory};
use stratus_shard::{IdentifyGate, IdentifyProperties};

use crate::error::ConfigError;

/// Guilds intent bit; it decides whether readiness waits for guilds.
pub const GUILDS_INTENT: u64 = 1 << 0;

const DEFAULT_WAIT_GUILD_TIMEOUT: Duration = Duration::from_secs(15);

/// Which shard ids this fleet runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardSelection {
    /// Adopt the gateway-recommended count, running all of its ids
    Auto,
    /// Run a fixed subset of a fixed total
    Explicit { ids: Vec<u16>, total: u16 },
}

/// What to do with non-whitelisted packets arriving before fleet readiness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferPolicy {
    /// Queue for replay at readiness; a full queue drops the oldest entry
    Buffer { cap: Option<usize> },
    /// Drop them (shard state is still updated)
    Drop,
}

/// How shard ids are chunked across workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardsPerWorker {
    /// One worker runs everything
    All,
    Count(u16),
}

/// What to do when a worker thread dies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Surface the death as a fatal fleet error
    Fatal,
    /// Respawn with the same assignment, resuming persisted sessions
    Restart { max_retries: u32 },
}

/// Fleet-wide configuration.
#[derive(Clone)]
pub struct FleetConfig {
    pub token: String,
    pub intents: u64,
    pub shards: ShardSelection,
    pub encoding: Encoding,
    pub compression: CompressionMode,
    pub packer_factory: Option<PackerFactory>,
    pub properties: IdentifyProperties,
    /// How long a shard may wait for its guilds before being declared ready
    /// anyway. Only consulted when the guilds intent is set.
    pub wait_guild_timeout: Duration,
    pub buffer_policy: BufferPolicy,
    pub shards_per_worker: ShardsPerWorker,
    pub restart_policy: RestartPolicy,
    /// Overrides the bucket throttle entirely when set.
    pub identify_gate: Option<Arc<dyn IdentifyGate>>,
}

impl FleetConfig {
    pub fn new(token: impl Into<String>, intents: u64) -> Self {
        FleetConfig {
            token: token.into(),
            intents,
            shards: ShardSelection::Auto,
            encoding: Encoding::Json,
            compression: CompressionMode::Stream,
            packer_factory: None,
            properties: IdentifyProperties::default(),
            wait_guild_timeout: DEFAULT_WAIT_GUILD_TIMEOUT,
            buffer_policy: BufferPolicy::Buffer { cap: None },
            shards_per_worker: ShardsPerWorker::All,
            restart_policy: RestartPolicy::Restart { max_retries: 3 },
            identify_gate: None,
        }
    }

    pub fn has_guilds_intent(&self) -> bool {
        self.intents & GUILDS_INTENT != 0
    }

    /// Fail fast on nonsensical settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let ShardSelection::Explicit { ids, total } = &self.shards {
            if *total == 0 {
                return Err(ConfigError::ZeroShardCount);
            }
            if ids.is_empty() {
                return Err(ConfigError::NoShards);
            }
            if let Some(&id) = ids.iter().find(|&&id| id >= *total) {
                return Err(ConfigError::ShardOutOfRange { id, total: *total });
            }
        }
        if self.shards_per_worker == ShardsPerWorker::Count(0) {
            return Err(ConfigError::ZeroShardsPerWorker);
        }
        Ok(())
    }

    /// Resolve the shard selection against gateway metadata.
    pub fn resolve_shards(&self, recommended: u16) -> Result<(Vec<u16>, u16), ConfigError> {
        match &self.shards {
            ShardSelection::Auto => {
                let total = recommended.max(1);
                Ok(((0..total).collect(), total))
            }
            ShardSelection::Explicit { ids, total } => {
                self.validate()?;
                Ok((ids.clone(), *total))
            }
        }
    }

    /// Chunk shard ids into per-worker assignments.
    pub fn chunk_shards(&self, ids: &[u16]) -> Vec<Vec<u16>> {
        match self.shards_per_worker {
            ShardsPerWorker::All => vec![ids.to_vec()],
            ShardsPerWorker::Count(count) => ids
                .chunks(count.max(1) as usize)
                .map(<[u16]>::to_vec)
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_selection_is_validated() {
        let mut config = FleetConfig::new("t", 0);

        config.shards = ShardSelection::Explicit { ids: vec![], total: 4 };
        assert_eq!(config.validate(), Err(ConfigError::NoShards));

        config.shards = ShardSelection::Explicit { ids: vec![0, 4], total: 4 };
        assert_eq!(
            config.validate(),
            Err(ConfigError::ShardOutOfRange { id: 4, total: 4 })
        );

        config.shards = ShardSelection::Explicit { ids: vec![0, 1], total: 0 };
        assert_eq!(config.validate(), Err(ConfigError::ZeroShardCount));

        config.shards = ShardSelection::Explicit { ids: vec![0, 3], total: 4 };
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_auto_selection_adopts_recommendation() {
        let config = FleetConfig::new("t", 0);
        let (ids, total) = config.resolve_shards(3).unwrap();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(total, 3);
    }

    #[test]
    fn test_chunking() {
        let mut config = FleetConfig::new("t", 0);
        let ids: Vec<u16> = (0..5).collect();

        assert_eq!(config.chunk_shards(&ids), vec![vec![0, 1, 2, 3, 4]]);

        config.shards_per_worker = ShardsPerWorker::Count(2);
        assert_eq!(
            config.chunk_shards(&ids),
            vec![vec![0, 1], vec![2, 3], vec![4]]
        );
    }

    #[test]
    fn test_guilds_intent_detection() {
        assert!(FleetConfig::new("t", GUILDS_INTENT).has_guilds_intent());
        assert!(!FleetConfig::new("t", 1 << 9).has_guilds_intent());
    }
}
