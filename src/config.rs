//! Engine configuration.

use crate::compression::CompressionMode;
use serde::{Deserialize, Serialize};

/// Tunables for one engine instance.
///
/// With the `figment_config` feature the configuration can be layered
/// from the environment, e.g. `BRT_NODESIZE=1048576`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Target serialized size of a node in bytes. A nonleaf whose
    /// serialized size exceeds this is gorged; a leaf is fissible.
    pub nodesize: usize,
    /// Target serialized size of a single basement partition. Controls
    /// how many partitions a leaf is cut into on write-out.
    pub basementsize: usize,
    /// Maximum child count of a nonleaf node before it becomes fissible.
    pub fanout: usize,
    /// Cache budget in bytes for all pinned and resident nodes.
    pub cache_bytes: usize,
    /// Compression applied to partition sub-blocks.
    pub compression: CompressionMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            nodesize: 4 * 1024 * 1024,
            basementsize: 128 * 1024,
            fanout: 16,
            cache_bytes: 256 * 1024 * 1024,
            compression: CompressionMode::default(),
        }
    }
}

impl EngineConfig {
    /// Small sizes for exercising splits and flushes quickly.
    #[cfg(any(test, feature = "internal-api"))]
    pub fn tiny() -> Self {
        EngineConfig {
            nodesize: 4096,
            basementsize: 512,
            fanout: 4,
            cache_bytes: 1024 * 1024,
            ..EngineConfig::default()
        }
    }
}

#[cfg(feature = "figment_config")]
impl EngineConfig {
    /// Returns the [figment::Figment] with defaults layered under the
    /// `BRT_`-prefixed environment.
    pub fn figment() -> figment::Figment {
        use figment::providers::Env;
        figment::Figment::new()
            .merge(figment::providers::Serialized::defaults(
                EngineConfig::default(),
            ))
            .merge(Env::prefixed("BRT_"))
    }

    /// Builds a configuration from defaults and the environment.
    pub fn from_env() -> Result<Self, figment::Error> {
        Self::figment().extract()
    }
}
