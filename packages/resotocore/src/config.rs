use std::path::PathBuf;

use anyhow::{bail, Result};
use figment::providers::Format;
use figment::Figment;
use resotocore_types::MergeMode;
use serde::{Deserialize, Serialize};

use crate::args::{CliArgs, CliEnvExt};

/// Fully resolved, defaulted configuration the binary runs with. Built by
/// [`ConfigBuilder`] from CLI args, environment variables, and an optional
/// TOML file, in that order of precedence.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: Vec<String>,
    pub merge_mode: MergeMode,
    /// Config id whose changes trigger a restart escalation, see
    /// [`resotocore::core_config::CoreConfigHandler`].
    pub core_config_id: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8900,
            log_level: vec!["info".to_string()],
            merge_mode: MergeMode::default(),
            core_config_id: "resoto.core".to_string(),
        }
    }
}

impl Config {
    pub fn tracing_env_filter(&self) -> Result<tracing_subscriber::EnvFilter> {
        let mut filter = tracing_subscriber::EnvFilter::from_default_env();
        for directive in &self.log_level {
            match directive.parse() {
                Ok(directive) => filter = filter.add_directive(directive),
                Err(err) => bail!("{}: {}", err, directive),
            }
        }
        Ok(filter)
    }
}

#[derive(Debug)]
pub struct ConfigBuilder {
    cli_args: CliArgs,
}

impl ConfigBuilder {
    pub const FILENAME: &'static str = "resotocore.toml";
    pub const DIRNAME: &'static str = "resotocore";

    pub fn new(cli_args: CliArgs) -> Self {
        Self { cli_args }
    }

    fn merge_cli_env_args(&self) -> Result<CliArgs> {
        Ok(Figment::new()
            .merge(figment::providers::Env::prefixed(&format!("{}_", CliArgs::ENV_VAR_PREFIX)))
            .merge(figment::providers::Serialized::defaults(&self.cli_args))
            .extract()?)
    }

    pub fn build(self) -> Result<Config> {
        let cli_env_args = self.merge_cli_env_args()?;

        let config: Config = Figment::new()
            .merge(figment::providers::Toml::file(Self::filepath(&cli_env_args)))
            .merge(figment::providers::Serialized::defaults(&cli_env_args))
            .join(figment::providers::Serialized::defaults(Config::default()))
            .extract()?;

        Ok(config)
    }

    /// The first existing candidate from [`Self::filepaths_to_try`], or a
    /// nonexistent placeholder path so a missing config file just means an
    /// empty TOML layer rather than a hard error.
    fn filepath(cli_env_args: &CliArgs) -> PathBuf {
        Self::filepaths_to_try(cli_env_args)
            .into_iter()
            .find(|path| path.exists())
            .unwrap_or_else(|| PathBuf::from("/nonexistent").join(Self::FILENAME))
    }

    fn filepaths_to_try(cli_env_args: &CliArgs) -> Vec<PathBuf> {
        let mut dirs = Vec::new();

        if let Some(dir) = cli_env_args.home_dir() {
            dirs.push(dir);
        }
        if let Ok(dir) = std::env::current_dir() {
            dirs.push(dir);
        }
        if let Some(dir) = dirs::home_dir().map(|dir| dir.join(format!(".{}", Self::DIRNAME))) {
            dirs.push(dir);
        }
        if let Some(dir) = dirs::config_dir().map(|dir| dir.join(Self::DIRNAME)) {
            dirs.push(dir);
        }
        dirs.push(PathBuf::from("/etc").join(Self::DIRNAME));

        dirs.into_iter().map(|dir| dir.join(Self::FILENAME)).collect()
    }
}
