use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

/// Every field here can come from a CLI flag, an environment variable
/// (`RESOTOCORE_{UPPERCASE_NAME}`), or the config file, in that order of
/// precedence; `None`/empty means "unset", letting later layers fill it in.
#[derive(Debug, Parser, Serialize, Deserialize, Default)]
#[command(version, about, long_about = None)]
#[serde(default)]
pub struct CliArgs {
    /// Home directory holding resotocore.toml; tried before the usual
    /// XDG/system fallback locations.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub home: Option<PathBuf>,

    /// Host to bind the HTTP server to.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Port to bind the HTTP server to.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Comma-separated tracing directives, e.g. `info,resotocore=debug`.
    #[arg(long, value_delimiter = ',')]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub log_level: Vec<String>,

    /// Merge strategy `patch_config` applies to falsy right-hand scalars.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge_mode: Option<String>,

    /// Config id whose change triggers a restart escalation.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub core_config_id: Option<String>,
}

pub trait CliEnvExt {
    const ENV_VAR_PREFIX: &'static str;
    const TOML_IDENTIFIER: &'static str;

    fn home_dir(&self) -> Option<PathBuf>;
}

impl CliEnvExt for CliArgs {
    const ENV_VAR_PREFIX: &'static str = "RESOTOCORE";
    const TOML_IDENTIFIER: &'static str = "resotocore";

    fn home_dir(&self) -> Option<PathBuf> {
        self.home.clone()
    }
}
