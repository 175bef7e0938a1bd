//! Typed git-lob configuration.
//!
//! All settings come out of the host VCS's own configuration
//! mechanism: global keys in the `git-lob` section, per-remote keys as
//! `remote.<name>.git-lob-*`. Section and variable names arrive
//! lowercased from git, so lookups here are effectively
//! case-insensitive.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Error;
use thiserror::Error;

use lob_git::GitRepo;

/// Errors in remote / provider configuration. Fatal before any I/O.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("remote '{remote}' has no git-lob-provider configured")]
    MissingProvider { remote: String },

    #[error("remote '{remote}' uses unknown provider '{provider}'")]
    UnknownProvider { remote: String, provider: String },

    #[error("remote '{remote}' is missing required option '{key}'")]
    MissingOption { remote: String, key: String },

    #[error("configuration key '{key}' has invalid value '{value}'")]
    InvalidValue { key: String, value: String },
}

/// Days-based windows steering which history a fetch or prune
/// considers. A window of zero keeps only the ref tip itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetentionWindows {
    /// how recent a ref's tip must be for the ref to be considered
    pub refs_days: u32,
    /// history window behind the tip of the current head
    pub head_days: u32,
    /// history window behind the tips of all other refs
    pub other_days: u32,
}

/// Effective git-lob configuration of one repository.
#[derive(Clone, Debug)]
pub struct Config {
    /// machine-wide shared store; enables hard-link mode
    pub shared_store: Option<PathBuf>,
    /// auto-download missing content during checkout
    pub autofetch: bool,
    pub fetch: RetentionWindows,
    pub retention: RetentionWindows,
    /// path globs narrowing which tracked files fetch considers
    pub fetch_include: Vec<String>,
    pub fetch_exclude: Vec<String>,
    /// remote consulted for "pushed" during prune; `*` accepts any
    pub prune_remote: String,
    /// re-verify remote presence before each prune deletion
    pub prune_safe: bool,

    raw: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            shared_store: None,
            autofetch: false,
            fetch: RetentionWindows {
                refs_days: 30,
                head_days: 7,
                other_days: 0,
            },
            retention: RetentionWindows {
                refs_days: 30,
                head_days: 7,
                other_days: 0,
            },
            fetch_include: Vec::new(),
            fetch_exclude: Vec::new(),
            prune_remote: "origin".to_string(),
            prune_safe: false,
            raw: HashMap::new(),
        }
    }
}

impl Config {
    /// Load the effective configuration of `repo`.
    pub fn load(repo: &GitRepo) -> Result<Self, Error> {
        let mut raw = HashMap::new();
        for (key, value) in repo.config_list()? {
            raw.insert(key, value);
        }
        Self::from_raw(raw)
    }

    fn from_raw(raw: HashMap<String, String>) -> Result<Self, Error> {
        let mut config = Config {
            raw,
            ..Default::default()
        };

        if let Some(path) = config.raw.get("git-lob.shared-store") {
            if !path.is_empty() {
                config.shared_store = Some(PathBuf::from(path));
            }
        }

        config.autofetch = config.get_bool("git-lob.autofetch")?.unwrap_or(false);

        if let Some(days) = config.get_days("git-lob.fetch-refs")? {
            config.fetch.refs_days = days;
        }
        if let Some(days) = config.get_days("git-lob.fetch-commits-head")? {
            config.fetch.head_days = days;
        }
        if let Some(days) = config.get_days("git-lob.fetch-commits-other")? {
            config.fetch.other_days = days;
        }
        if let Some(days) = config.get_days("git-lob.retention-period-refs")? {
            config.retention.refs_days = days;
        }
        if let Some(days) = config.get_days("git-lob.retention-period-head")? {
            config.retention.head_days = days;
        }
        if let Some(days) = config.get_days("git-lob.retention-period-other")? {
            config.retention.other_days = days;
        }

        config.fetch_include = config.get_list("git-lob.fetch-include");
        config.fetch_exclude = config.get_list("git-lob.fetch-exclude");

        if let Some(remote) = config.raw.get("git-lob.prune-remote") {
            if !remote.is_empty() {
                config.prune_remote = remote.clone();
            }
        }
        config.prune_safe = config.get_bool("git-lob.prune-safe")?.unwrap_or(false);

        // git-lob.chunksize used to be tunable; the chunk size is a
        // compile time constant now and legacy configs still carrying
        // the key are expected noise, not an error
        let _ = config.raw.get("git-lob.chunksize");

        Ok(config)
    }

    fn get_bool(&self, key: &str) -> Result<Option<bool>, Error> {
        let value = match self.raw.get(key) {
            Some(value) => value,
            None => return Ok(None),
        };
        match value.to_lowercase().as_str() {
            // git's boolean vocabulary, plus the bare-key form
            "true" | "yes" | "on" | "1" | "" => Ok(Some(true)),
            "false" | "no" | "off" | "0" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                value: value.clone(),
            }
            .into()),
        }
    }

    fn get_days(&self, key: &str) -> Result<Option<u32>, Error> {
        let value = match self.raw.get(key) {
            Some(value) => value,
            None => return Ok(None),
        };
        value.trim().parse().map(Some).map_err(|_| {
            ConfigError::InvalidValue {
                key: key.to_string(),
                value: value.clone(),
            }
            .into()
        })
    }

    fn get_list(&self, key: &str) -> Vec<String> {
        match self.raw.get(key) {
            Some(value) => value
                .split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Raw value of an arbitrary configuration key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.raw.get(key).map(|value| value.as_str())
    }

    /// The transport provider configured for a remote.
    pub fn remote_provider(&self, remote: &str) -> Result<String, ConfigError> {
        match self.raw.get(&format!("remote.{}.git-lob-provider", remote)) {
            Some(provider) if !provider.is_empty() => Ok(provider.clone()),
            _ => Err(ConfigError::MissingProvider {
                remote: remote.to_string(),
            }),
        }
    }

    /// A provider-specific per-remote option, e.g. `git-lob-path`.
    pub fn remote_option(&self, remote: &str, option: &str) -> Option<&str> {
        self.raw
            .get(&format!("remote.{}.git-lob-{}", remote, option))
            .map(|value| value.as_str())
    }

    /// The include/exclude globs as git pathspecs; excludes use
    /// pathspec magic so git itself applies them during tree and diff
    /// walks.
    pub fn pathspecs(&self) -> Vec<String> {
        let mut specs: Vec<String> = self.fetch_include.clone();
        for glob in &self.fetch_exclude {
            specs.push(format!(":(exclude){}", glob));
        }
        specs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_from(entries: &[(&str, &str)]) -> Result<Config, Error> {
        let raw = entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_raw(raw)
    }

    #[test]
    fn defaults_match_documentation() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.fetch.refs_days, 30);
        assert_eq!(config.fetch.head_days, 7);
        assert_eq!(config.fetch.other_days, 0);
        assert_eq!(config.retention.refs_days, 30);
        assert_eq!(config.prune_remote, "origin");
        assert!(!config.autofetch);
        assert!(!config.prune_safe);
        assert!(config.shared_store.is_none());
    }

    #[test]
    fn parses_overrides() {
        let config = config_from(&[
            ("git-lob.shared-store", "/srv/lob-shared"),
            ("git-lob.autofetch", "yes"),
            ("git-lob.fetch-refs", "60"),
            ("git-lob.fetch-commits-head", "14"),
            ("git-lob.prune-remote", "backup"),
            ("git-lob.prune-safe", "on"),
        ])
        .unwrap();

        assert_eq!(config.shared_store.as_deref(), Some(std::path::Path::new("/srv/lob-shared")));
        assert!(config.autofetch);
        assert_eq!(config.fetch.refs_days, 60);
        assert_eq!(config.fetch.head_days, 14);
        assert_eq!(config.prune_remote, "backup");
        assert!(config.prune_safe);
    }

    #[test]
    fn legacy_chunksize_is_ignored_silently() {
        // the key was tunable once; configs still carrying it must load
        // without errors or warnings
        let config = config_from(&[("git-lob.chunksize", "1048576")]).unwrap();
        assert!(config.get("git-lob.chunksize").is_some());
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(config_from(&[("git-lob.autofetch", "maybe")]).is_err());
        assert!(config_from(&[("git-lob.fetch-refs", "soon")]).is_err());
    }

    #[test]
    fn remote_provider_lookup() {
        let config = config_from(&[
            ("remote.origin.git-lob-provider", "filesystem"),
            ("remote.origin.git-lob-path", "/mnt/binaries"),
        ])
        .unwrap();

        assert_eq!(config.remote_provider("origin").unwrap(), "filesystem");
        assert_eq!(config.remote_option("origin", "path"), Some("/mnt/binaries"));
        assert!(matches!(
            config.remote_provider("upstream"),
            Err(ConfigError::MissingProvider { .. })
        ));
    }

    #[test]
    fn pathspecs_carry_exclude_magic() {
        let config = config_from(&[
            ("git-lob.fetch-include", "assets/*, textures/*"),
            ("git-lob.fetch-exclude", "assets/tmp/*"),
        ])
        .unwrap();

        assert_eq!(
            config.pathspecs(),
            vec![
                "assets/*".to_string(),
                "textures/*".to_string(),
                ":(exclude)assets/tmp/*".to_string(),
            ]
        );
    }
}
