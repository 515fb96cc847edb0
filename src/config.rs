//! # Configuration
//!
//! Hierarchical configuration loading from:
//! - `riverlog.toml` (project configuration)
//! - `riverlog.local.toml` (git-ignored local overrides)
//! - Environment variables (`RIVERLOG_*` prefix, `__` for nesting)
//!
//! ```toml
//! # riverlog.toml
//! [modules]
//! search_paths = ["lib", "vendor/datalog"]
//!
//! [display]
//! tab_width = 4
//! ```
//!
//! ```bash
//! RIVERLOG_DISPLAY__TAB_WIDTH=8
//! RIVERLOG_EMIT__DOT=true
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub modules: ModulesConfig,
    #[serde(default)]
    pub display: DisplaySettings,
    #[serde(default)]
    pub emit: EmitConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// Module resolution.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModulesConfig {
    /// Directories searched by `#import`, in order, after any `-M`/`-I`
    /// flags.
    #[serde(default)]
    pub search_paths: Vec<PathBuf>,
    /// System directories searched last.
    #[serde(default)]
    pub system_paths: Vec<PathBuf>,
}

/// Source display handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplaySettings {
    #[serde(default = "default_tab_width")]
    pub tab_width: u64,
    #[serde(default = "default_true")]
    pub use_tab_stops: bool,
}

fn default_tab_width() -> u64 {
    4
}

fn default_true() -> bool {
    true
}

impl Default for DisplaySettings {
    fn default() -> Self {
        DisplaySettings { tab_width: default_tab_width(), use_tab_stops: true }
    }
}

/// Emission toggles; command-line flags override these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmitConfig {
    /// Also dump the data-flow graph as DOT next to `-o` output.
    #[serde(default)]
    pub dot: bool,
    /// Namespace for the generated interface schema.
    #[serde(default = "default_namespace")]
    pub interface_namespace: String,
}

fn default_namespace() -> String {
    "datalog".to_string()
}

impl Default for EmitConfig {
    fn default() -> Self {
        EmitConfig { dot: false, interface_namespace: default_namespace() }
    }
}

/// Runtime defaults baked into emitted metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Worker count hint for Parallel-region lowering.
    #[serde(default = "default_workers")]
    pub workers: u32,
}

fn default_workers() -> u32 {
    1
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig { workers: default_workers() }
    }
}

impl Config {
    /// Load with the standard precedence: file, local overrides, then
    /// environment.
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("riverlog.toml"))
            .merge(Toml::file("riverlog.local.toml"))
            .merge(Env::prefixed("RIVERLOG_").split("__"))
            .extract()
    }

    /// Load from an explicit file plus the environment; used by tests and
    /// the `--config` flag.
    pub fn load_from(path: &std::path::Path) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("RIVERLOG_").split("__"))
            .extract()
    }

    pub fn display_config(&self) -> crate::display::DisplayConfig {
        crate::display::DisplayConfig {
            tab_width: self.display.tab_width,
            use_tab_stops: self.display.use_tab_stops,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.display.tab_width, 4);
        assert!(config.display.use_tab_stops);
        assert_eq!(config.runtime.workers, 1);
        assert_eq!(config.emit.interface_namespace, "datalog");
        assert!(config.modules.search_paths.is_empty());
    }

    #[test]
    fn loads_from_toml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("riverlog.toml");
        std::fs::write(
            &path,
            "[modules]\nsearch_paths = [\"lib\"]\n\n[display]\ntab_width = 8\n\n[emit]\ndot = true\n",
        )
        .expect("write config");

        let config = Config::load_from(&path).expect("loads");
        assert_eq!(config.modules.search_paths, vec![PathBuf::from("lib")]);
        assert_eq!(config.display.tab_width, 8);
        assert!(config.emit.dot);
        // Unset sections fall back to defaults.
        assert_eq!(config.runtime.workers, 1);
    }
}
