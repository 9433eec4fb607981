//! Repository configuration, stored as TOML in `.lit/config`.

use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::core::merge::MergeStrategy;
use crate::git::repo::{Error, Repo, Result};
use crate::util::write_file_atomically;

/// Environment variables consulted for the author name, in order.
pub const AUTHOR_NAME_ENV_VARS: &[&str] = &["LIT_AUTHOR_NAME", "GIT_AUTHOR_NAME"];

/// Environment variables consulted for the author email, in order.
pub const AUTHOR_EMAIL_ENV_VARS: &[&str] = &["LIT_AUTHOR_EMAIL", "GIT_AUTHOR_EMAIL"];

/// The `[user]` section.
#[allow(missing_docs)]
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct UserConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// The `[core]` section.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CoreConfig {
    /// The branch `HEAD` is attached to in a freshly-initialized repository.
    pub default_branch: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            default_branch: "main".to_string(),
        }
    }
}

/// The `[merge]` section.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Strategy applied to paths which cannot be merged automatically. When
    /// unset, such paths are reported as conflicts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<MergeStrategy>,

    /// Whether a merge may simply advance the current branch when possible.
    pub fast_forward: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        MergeConfig {
            strategy: None,
            fast_forward: true,
        }
    }
}

/// The contents of a repository's config file.
#[allow(missing_docs)]
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RepoConfig {
    pub user: UserConfig,
    pub core: CoreConfig,
    pub merge: MergeConfig,
}

impl RepoConfig {
    /// Read the config file at `path`. A missing file yields the defaults.
    #[instrument]
    pub fn load(path: &Path) -> Result<Self> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Default::default()),
            Err(source) => {
                return Err(Error::Io {
                    source,
                    path: path.to_path_buf(),
                })
            }
        };
        toml::from_str(&contents).map_err(|source| Error::ReadConfig {
            source,
            path: path.to_path_buf(),
        })
    }

    /// Write this config to `path`, replacing the previous contents.
    #[instrument]
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self).map_err(Error::WriteConfig)?;
        write_file_atomically(path, contents.as_bytes()).map_err(|source| Error::Io {
            source,
            path: path.to_path_buf(),
        })
    }

    /// Determine the `Name <email>` identity used for new commits, preferring
    /// values from `get_env` over the `[user]` section.
    pub fn resolve_identity(&self, get_env: impl Fn(&str) -> Option<String>) -> Result<String> {
        let lookup = |env_vars: &[&str], configured: &Option<String>| {
            env_vars
                .iter()
                .find_map(|var| get_env(var).filter(|value| !value.trim().is_empty()))
                .or_else(|| configured.clone())
        };
        let name = lookup(AUTHOR_NAME_ENV_VARS, &self.user.name);
        let email = lookup(AUTHOR_EMAIL_ENV_VARS, &self.user.email);
        match (name, email) {
            (Some(name), Some(email)) => Ok(format!("{} <{}>", name.trim(), email.trim())),
            _ => Err(Error::IdentityNotConfigured),
        }
    }
}

impl Repo {
    /// Read the repository's config file.
    pub fn get_config(&self) -> Result<RepoConfig> {
        RepoConfig::load(&self.get_config_path())
    }

    /// Write the repository's config file.
    pub fn write_config(&self, config: &RepoConfig) -> Result<()> {
        config.save(&self.get_config_path())
    }

    /// Record the identity used for new commits.
    #[instrument]
    pub fn set_user_identity(&self, name: &str, email: &str) -> Result<()> {
        let mut config = self.get_config()?;
        config.user = UserConfig {
            name: Some(name.to_owned()),
            email: Some(email.to_owned()),
        };
        self.write_config(&config)
    }

    /// The `Name <email>` identity used for new commits, taking environment
    /// overrides into account.
    pub fn get_identity(&self) -> Result<String> {
        self.get_config()?
            .resolve_identity(|var| std::env::var(var).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_round_trip() -> eyre::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config");
        assert_eq!(RepoConfig::load(&path)?, RepoConfig::default());

        let mut config = RepoConfig::default();
        config.user.name = Some("Jane Doe".to_string());
        config.merge.strategy = Some(MergeStrategy::Union);
        config.save(&path)?;
        let contents = fs::read_to_string(&path)?;
        assert!(contents.contains("[user]"));
        assert!(contents.contains(r#"name = "Jane Doe""#));
        assert!(contents.contains(r#"strategy = "union""#));
        assert!(!contents.contains("email"));
        assert_eq!(RepoConfig::load(&path)?, config);
        Ok(())
    }

    #[test]
    fn test_partial_config_uses_defaults() -> eyre::Result<()> {
        let config: RepoConfig = toml::from_str("[merge]\nstrategy = \"recent\"\n")?;
        assert_eq!(config.merge.strategy, Some(MergeStrategy::Recent));
        assert!(config.merge.fast_forward);
        assert_eq!(config.core.default_branch, "main");
        Ok(())
    }

    #[test]
    fn test_resolve_identity() -> eyre::Result<()> {
        let mut config = RepoConfig::default();
        assert!(matches!(
            config.resolve_identity(|_| None),
            Err(Error::IdentityNotConfigured)
        ));

        config.user.name = Some("Jane Doe".to_string());
        config.user.email = Some("jane@example.com".to_string());
        assert_eq!(config.resolve_identity(|_| None)?, "Jane Doe <jane@example.com>");

        let identity = config.resolve_identity(|var| match var {
            "GIT_AUTHOR_NAME" => Some("Git Name".to_string()),
            "LIT_AUTHOR_EMAIL" => Some("lit@example.com".to_string()),
            _ => None,
        })?;
        assert_eq!(identity, "Git Name <lit@example.com>");
        Ok(())
    }
}
