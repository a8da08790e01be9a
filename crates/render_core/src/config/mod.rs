//! Configuration system
//!
//! Tunables for the resource-management core. Every field has a reference
//! default, so a config file only needs to name the values it overrides.

pub use serde::{Serialize, Deserialize};

use crate::foundation::collections::{DEFAULT_GROWTH_CHUNK, MAX_HANDLE_SLOTS};
use crate::render::api::BufferUsage;

/// Configuration trait
pub trait Config: Serialize + for<'de> Deserialize<'de> + Default {
    /// Load configuration from file
    fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(ConfigError::Io)?;

        // Try different formats
        if path.ends_with(".toml") {
            toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
        } else if path.ends_with(".ron") {
            ron::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
        } else {
            Err(ConfigError::UnsupportedFormat(path.to_string()))
        }
    }

    /// Save configuration to file
    fn save_to_file(&self, path: &str) -> Result<(), ConfigError> {
        let contents = if path.ends_with(".toml") {
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?
        } else if path.ends_with(".ron") {
            ron::ser::to_string_pretty(self, Default::default())
                .map_err(|e| ConfigError::Serialize(e.to_string()))?
        } else {
            return Err(ConfigError::UnsupportedFormat(path.to_string()));
        };

        std::fs::write(path, contents).map_err(ConfigError::Io)
    }
}

/// Configuration errors
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialize(String),

    /// Unsupported format
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// A value is outside its permitted range
    #[error("Invalid value for {field}: {reason}")]
    Invalid {
        /// Name of the offending field
        field: &'static str,
        /// Why the value was rejected
        reason: String,
    },
}

/// Preferred backing-buffer sizes for the buffer arena, per usage class
///
/// A new arena pool is sized to the larger of the request and this value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaConfig {
    /// Uniform buffer pools (per-frame / per-object shader data)
    pub uniform_chunk: u64,
    /// Vertex buffer pools
    pub vertex_chunk: u64,
    /// Index buffer pools
    pub index_chunk: u64,
    /// Storage buffer pools
    pub storage_chunk: u64,
    /// Host-visible staging pools used for uploads
    pub staging_chunk: u64,
}

impl ArenaConfig {
    /// Preferred pool size for a usage class
    pub fn chunk_size(&self, usage: BufferUsage) -> u64 {
        match usage {
            BufferUsage::Uniform => self.uniform_chunk,
            BufferUsage::Vertex => self.vertex_chunk,
            BufferUsage::Index => self.index_chunk,
            BufferUsage::Storage => self.storage_chunk,
            BufferUsage::Staging => self.staging_chunk,
        }
    }
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            uniform_chunk: 256 * 1024,
            vertex_chunk: 4 * 1024 * 1024,
            index_chunk: 1024 * 1024,
            storage_chunk: 1024 * 1024,
            staging_chunk: 4 * 1024 * 1024,
        }
    }
}

/// Settings for the GPU resource-management core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Number of threads that may record command buffers, one command pool each
    pub max_threads: usize,
    /// Number of frame slots the CPU may prepare ahead of the GPU
    pub frames_in_flight: usize,
    /// Slots added to a handle pool each time it fills up
    pub handle_growth_chunk: usize,
    /// Upper bound on live handles per pool
    pub max_handle_slots: usize,
    /// New descriptor pools hold this many times the triggering request
    pub descriptor_pool_multiplier: u32,
    /// Buffer arena pool sizes
    pub arena: ArenaConfig,
    /// Timeout for blocking fence waits, in nanoseconds
    pub fence_timeout_ns: u64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            max_threads: 4,
            frames_in_flight: 3,
            handle_growth_chunk: DEFAULT_GROWTH_CHUNK,
            max_handle_slots: MAX_HANDLE_SLOTS,
            descriptor_pool_multiplier: 256,
            arena: ArenaConfig::default(),
            fence_timeout_ns: 1_000_000_000,
        }
    }
}

impl Config for ResourceConfig {}

impl ResourceConfig {
    /// Check that every value is usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("max_threads", self.max_threads as u64),
            ("frames_in_flight", self.frames_in_flight as u64),
            ("handle_growth_chunk", self.handle_growth_chunk as u64),
            ("max_handle_slots", self.max_handle_slots as u64),
            ("descriptor_pool_multiplier", u64::from(self.descriptor_pool_multiplier)),
            ("arena.uniform_chunk", self.arena.uniform_chunk),
            ("arena.vertex_chunk", self.arena.vertex_chunk),
            ("arena.index_chunk", self.arena.index_chunk),
            ("arena.storage_chunk", self.arena.storage_chunk),
            ("arena.staging_chunk", self.arena.staging_chunk),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        if self.max_handle_slots > MAX_HANDLE_SLOTS {
            return Err(ConfigError::Invalid {
                field: "max_handle_slots",
                reason: format!("exceeds the {MAX_HANDLE_SLOTS}-slot handle index space"),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ResourceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_threads, 4);
        assert_eq!(config.frames_in_flight, 3);
        assert_eq!(config.descriptor_pool_multiplier, 256);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: ResourceConfig = toml::from_str(
            "max_threads = 8\n[arena]\nuniform_chunk = 4096\n",
        )
        .unwrap();
        assert_eq!(config.max_threads, 8);
        assert_eq!(config.arena.uniform_chunk, 4096);
        assert_eq!(config.arena.vertex_chunk, ArenaConfig::default().vertex_chunk);
        assert_eq!(config.frames_in_flight, 3);
    }

    #[test]
    fn test_ron_round_trip() {
        let mut config = ResourceConfig::default();
        config.frames_in_flight = 2;
        let text = ron::ser::to_string_pretty(&config, Default::default()).unwrap();
        let parsed: ResourceConfig = ron::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_validate_rejects_zero_and_oversized_values() {
        let config = ResourceConfig { frames_in_flight: 0, ..Default::default() };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "frames_in_flight", .. })
        ));

        let config = ResourceConfig { max_handle_slots: MAX_HANDLE_SLOTS + 1, ..Default::default() };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "max_handle_slots", .. })
        ));
    }

    #[test]
    fn test_unsupported_extension() {
        assert!(matches!(
            ResourceConfig::default().save_to_file("resources.yaml"),
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }
}
