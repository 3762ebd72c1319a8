//! Memory-Bounded Stream Registry
//!
//! One independent detector per stream key, created on first sight from a
//! shared configuration template. The registry is bounded; when full, the
//! least recently observed stream is evicted and loses its calibration.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::detector::{DetectorConfig, StreamAnomalyDetector, Verdict};
use crate::error::{DetectorError, Result};

/// Hash used to key streams.
pub fn stream_hash(stream_id: &str) -> u64 {
    xxhash_rust::xxh3::xxh3_64(stream_id.as_bytes())
}

/// Configuration for the stream registry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RegistryConfig {
    /// Maximum number of streams to keep
    pub max_streams: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_streams: 100_000,
        }
    }
}

/// Statistics about the registry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub streams: usize,
    pub creations: u64,
    pub evictions: u64,
    pub observations: u64,
}

#[derive(Debug)]
struct StreamEntry {
    detector: StreamAnomalyDetector,
    last_seen: u64,
}

/// Arena of per-stream detectors keyed by [`stream_hash`].
///
/// Only the 64-bit hash is stored, so two stream IDs that collide under xxh3
/// share one detector. Callers needing strict isolation must keep their own
/// ID-keyed detectors.
pub struct StreamRegistry {
    streams: HashMap<u64, StreamEntry>,
    template: DetectorConfig,
    config: RegistryConfig,
    stats: RegistryStats,
    // Logical clock for LRU ordering
    clock: u64,
}

impl StreamRegistry {
    /// Create a registry whose streams use `template`.
    pub fn new(template: DetectorConfig) -> Result<Self> {
        Self::with_config(template, RegistryConfig::default())
    }

    pub fn with_config(template: DetectorConfig, config: RegistryConfig) -> Result<Self> {
        template.validate()?;
        if config.max_streams == 0 {
            return Err(DetectorError::invalid_config(
                "max_streams",
                "must be at least 1",
            ));
        }
        Ok(Self {
            streams: HashMap::with_capacity(config.max_streams.min(1024)),
            template,
            config,
            stats: RegistryStats::default(),
            clock: 0,
        })
    }

    /// Feed `value` to the detector for `stream_id`, creating it if needed.
    pub fn observe(&mut self, stream_id: &str, value: f64) -> Result<Verdict> {
        self.observe_hashed(stream_hash(stream_id), value)
    }

    pub fn observe_hashed(&mut self, hash: u64, value: f64) -> Result<Verdict> {
        // Reject before a fresh detector is allocated for an unknown key.
        if !value.is_finite() {
            return Err(DetectorError::NonFiniteInput { value });
        }

        self.clock += 1;
        let now = self.clock;

        if !self.streams.contains_key(&hash) && self.streams.len() >= self.config.max_streams {
            self.evict_one();
        }

        let entry = match self.streams.entry(hash) {
            Entry::Occupied(occupied) => occupied.into_mut(),
            Entry::Vacant(vacant) => {
                let detector = StreamAnomalyDetector::new(self.template)?;
                self.stats.creations += 1;
                vacant.insert(StreamEntry {
                    detector,
                    last_seen: now,
                })
            }
        };
        entry.last_seen = now;
        let verdict = entry.detector.observe(value)?;

        self.stats.observations += 1;
        self.stats.streams = self.streams.len();
        Ok(verdict)
    }

    pub fn get(&self, stream_id: &str) -> Option<&StreamAnomalyDetector> {
        self.streams
            .get(&stream_hash(stream_id))
            .map(|entry| &entry.detector)
    }

    pub fn contains(&self, stream_id: &str) -> bool {
        self.streams.contains_key(&stream_hash(stream_id))
    }

    pub fn remove(&mut self, stream_id: &str) -> Option<StreamAnomalyDetector> {
        let removed = self
            .streams
            .remove(&stream_hash(stream_id))
            .map(|entry| entry.detector);
        self.stats.streams = self.streams.len();
        removed
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn stats(&self) -> &RegistryStats {
        &self.stats
    }

    pub fn template(&self) -> &DetectorConfig {
        &self.template
    }

    fn evict_one(&mut self) {
        let candidate = self
            .streams
            .iter()
            .min_by_key(|(_, entry)| entry.last_seen)
            .map(|(hash, _)| *hash);

        if let Some(hash) = candidate {
            if let Some(entry) = self.streams.remove(&hash) {
                self.stats.evictions += 1;
                debug!(
                    stream = hash,
                    samples = entry.detector.sample_count(),
                    "Evicted least recently observed stream"
                );
            }
        }
    }
}
