use std::env;
use std::ffi::OsString;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct ReskinConfiguration {
    pub app_path: Option<PathBuf>,   // Path to the .app bundle
    pub stylesheet: Option<PathBuf>, // CSS file to inject instead of the built-in theme
    pub backup_dir: Option<PathBuf>,
    #[serde(default = "default_codesign")]
    pub codesign: bool, // Re-sign the bundle after modifying it
    pub entry: Option<String>, // Script to patch (default: package.json's "main")
    pub anchors: Option<AnchorConfiguration>,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct AnchorConfiguration {
    pub definition: String,
    pub call_site: String,
    pub window: String,
}

fn default_codesign() -> bool {
    true
}

impl Default for ReskinConfiguration {
    fn default() -> Self {
        Self {
            app_path: None,
            stylesheet: None,
            backup_dir: None,
            codesign: default_codesign(),
            entry: None,
            anchors: None,
        }
    }
}

fn get_program_name() -> Result<OsString> {
    let current_exe_path = env::current_exe()?;
    Ok(current_exe_path
        .file_stem()
        .context("Current executable path is invalid")?
        .to_os_string())
}

/// Loads the configuration from `config_path`, or from `<program name>.yml`
/// in the working directory if it exists. Missing optional files yield the
/// default configuration.
pub fn retrieve_configuration(config_path: Option<&Path>) -> Result<ReskinConfiguration> {
    if let Some(config_path) = config_path {
        return parse_configuration(config_path).with_context(|| {
            format!(
                "Failed to read configuration '{}'",
                config_path.to_string_lossy()
            )
        });
    }
    let default_path = PathBuf::from(get_program_name()?).with_extension("yml");
    if !default_path.is_file() {
        log::debug!("No configuration file, using defaults");
        return Ok(ReskinConfiguration::default());
    }
    parse_configuration(&default_path).with_context(|| {
        format!(
            "Failed to read configuration '{}'",
            default_path.to_string_lossy()
        )
    })
}

fn parse_configuration<P: AsRef<Path>>(config_file_path: P) -> Result<ReskinConfiguration> {
    let config_file = File::open(config_file_path)?;
    let config_reader = BufReader::new(config_file);
    serde_yaml::from_reader(config_reader).context("Invalid configuration")
}
