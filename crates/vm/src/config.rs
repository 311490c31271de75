//! Tunables that would otherwise be fixed constants, exposed as a
//! `VmConfig` so a host can override them without recompiling — a
//! `Deserialize` TOML manifest in the same style as a compiler's build
//! config.

use serde::Deserialize;

/// Value-stack capacity in slots.
pub const DEFAULT_STACK_CAPACITY: usize = 64 * 256;

/// Frame-stack capacity.
pub const DEFAULT_FRAME_CAPACITY: usize = 64;

fn default_stack_capacity() -> usize {
    DEFAULT_STACK_CAPACITY
}

fn default_frame_capacity() -> usize {
    DEFAULT_FRAME_CAPACITY
}

fn default_paths() -> Vec<String> {
    vec![
        "<parent>/<path>.hm".to_string(),
        "./<path>.hm".to_string(),
        "./modules/<path>.hm".to_string(),
    ]
}

/// Host-tunable VM limits and defaults, including the module search
/// templates. Deserializable from a TOML file the same way a compiler
/// loads its lint configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    #[serde(default = "default_stack_capacity")]
    pub stack_capacity: usize,
    #[serde(default = "default_frame_capacity")]
    pub frame_capacity: usize,
    /// Initial value of the `__paths` global.
    #[serde(default = "default_paths")]
    pub default_paths: Vec<String>,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            stack_capacity: DEFAULT_STACK_CAPACITY,
            frame_capacity: DEFAULT_FRAME_CAPACITY,
            default_paths: default_paths(),
        }
    }
}

impl VmConfig {
    /// Parse a `VmConfig` from TOML text (e.g. a file the CLI's `-c` flag
    /// points at). Missing fields fall back to the built-in defaults.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_documented_constants() {
        let cfg = VmConfig::default();
        assert_eq!(cfg.stack_capacity, 64 * 256);
        assert_eq!(cfg.frame_capacity, 64);
        assert_eq!(cfg.default_paths.len(), 3);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let cfg = VmConfig::from_toml("frame_capacity = 16\n").unwrap();
        assert_eq!(cfg.frame_capacity, 16);
        assert_eq!(cfg.stack_capacity, 64 * 256);
    }
}
