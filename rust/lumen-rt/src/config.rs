//! JIT configuration, read from the `[jit]` table of `lumen.toml`.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

use lumen_codegen::CodegenSettings;

use crate::error::RuntimeError;

/// Name of the project configuration file.
pub const CONFIG_FILE: &str = "lumen.toml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct JitConfig {
    #[serde(default)]
    pub compile: CodegenSettings,
    #[serde(default)]
    pub deopt: DeoptSettings,
    #[serde(default)]
    pub log: LogSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DeoptSettings {
    /// Log every deoptimization at `info` level.
    pub log_deopts: bool,
    /// Count deoptimizations per reason.
    pub collect_stats: bool,
}

impl Default for DeoptSettings {
    fn default() -> Self {
        Self {
            log_deopts: false,
            collect_stats: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// `tracing` filter directives, e.g. `"lumen_rt=debug,warn"`.
    pub filter: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            filter: "warn".to_string(),
        }
    }
}

/// The parts of `lumen.toml` this crate reads. Other tables are ignored.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    jit: JitConfig,
}

impl FromStr for JitConfig {
    type Err = toml::de::Error;

    /// Parse the contents of a `lumen.toml`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str::<ConfigFile>(s).map(|file| file.jit)
    }
}

impl JitConfig {
    /// Load configuration by searching for `lumen.toml` in the current
    /// directory and its ancestors. Falls back to defaults when no file is
    /// found or the file cannot be loaded.
    pub fn load() -> Self {
        Self::load_with_path().map(|(config, _)| config).unwrap_or_default()
    }

    /// Like [`JitConfig::load`], also returning the file that was used.
    pub fn load_with_path() -> Option<(Self, PathBuf)> {
        let cwd = std::env::current_dir().ok()?;
        let path = find_config(&cwd)?;
        match Self::load_from(&path) {
            Ok(config) => Some((config, path)),
            Err(err) => {
                tracing::warn!(error = %err, "ignoring unreadable configuration");
                None
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, RuntimeError> {
        let content = std::fs::read_to_string(path).map_err(|source| RuntimeError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        content
            .parse()
            .map_err(|source| RuntimeError::ConfigParse {
                path: path.to_path_buf(),
                source,
            })
    }
}

/// Find `lumen.toml` in `start` or the nearest ancestor that has one.
pub fn find_config(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(CONFIG_FILE))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_jit_table() {
        let config: JitConfig = "[package]\nname = \"demo\"\n".parse().unwrap();
        assert_eq!(config, JitConfig::default());
        assert!(config.deopt.collect_stats);
        assert!(!config.deopt.log_deopts);
        assert_eq!(config.log.filter, "warn");
    }

    #[test]
    fn nested_tables_override_fields() {
        let config: JitConfig = r#"
            [jit.compile]
            register_budget = 3
            workers = 2

            [jit.deopt]
            log_deopts = true

            [jit.log]
            filter = "lumen_rt=trace"
        "#
        .parse()
        .unwrap();
        assert_eq!(config.compile.register_budget, 3);
        assert_eq!(config.compile.workers, 2);
        assert!(config.compile.validate_ir);
        assert!(config.deopt.log_deopts);
        assert!(config.deopt.collect_stats);
        assert_eq!(config.log.filter, "lumen_rt=trace");
    }

    #[test]
    fn malformed_config_is_an_error() {
        assert!("[jit.deopt]\nlog_deopts = \"yes\"".parse::<JitConfig>().is_err());
    }

    #[test]
    fn load_from_reports_missing_file() {
        let err = JitConfig::load_from(Path::new("/nonexistent/lumen.toml")).unwrap_err();
        assert!(matches!(err, RuntimeError::ConfigIo { .. }));
    }

    #[test]
    fn search_walks_up_to_ancestors() {
        let root = std::env::temp_dir().join(format!("lumen-rt-config-{}", std::process::id()));
        let nested = root.join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(root.join(CONFIG_FILE), "[jit.deopt]\ncollect_stats = false\n").unwrap();

        let found = find_config(&nested).unwrap();
        assert_eq!(found, root.join(CONFIG_FILE));
        let config = JitConfig::load_from(&found).unwrap();
        assert!(!config.deopt.collect_stats);

        std::fs::remove_dir_all(&root).unwrap();
    }
}
