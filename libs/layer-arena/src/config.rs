//! Configuration for the layer arena.

use std::path::PathBuf;

/// Environment variable naming the arena's cache directory.
pub const ROOT_ENV: &str = "LAYER_ARENA_ROOT";

/// Layer arena configuration.
#[derive(Debug, Clone)]
pub struct ArenaConfig {
    /// Directory holding one decompressed file per cached digest.
    pub root_dir: PathBuf,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            root_dir: std::env::temp_dir().join("layer-arena"),
        }
    }
}

impl ArenaConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let root_dir = std::env::var_os(ROOT_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| Self::default().root_dir);

        Self { root_dir }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_env() {
        std::env::set_var(ROOT_ENV, "/var/lib/layers");
        assert_eq!(ArenaConfig::from_env().root_dir, PathBuf::from("/var/lib/layers"));

        std::env::set_var(ROOT_ENV, "");
        assert_eq!(
            ArenaConfig::from_env().root_dir,
            ArenaConfig::default().root_dir
        );
        std::env::remove_var(ROOT_ENV);
    }
}
