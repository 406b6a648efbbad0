//! Configuration management for the crash decoder CLI

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::decoder::{DecodeOptions, BATCH_REMOTE_TIMEOUT_SECS, INTERACTIVE_REMOTE_TIMEOUT_SECS};
use crate::error::{DecodeError, Result};

const LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "crash-decoder")]
#[command(about = "Decodes ESP8266/ESP32 panic output into a symbolicated stack trace")]
#[command(version)]
pub struct Args {
    /// File holding the captured panic output, `-` for stdin
    #[arg(default_value = "-")]
    pub input: PathBuf,

    /// ELF file with debug symbols (skips ELF discovery)
    #[arg(long, env = "CRASH_DECODER_ELF")]
    pub elf: Option<PathBuf>,

    /// GDB binary (skips toolchain discovery)
    #[arg(long, env = "CRASH_DECODER_GDB")]
    pub tool: Option<PathBuf>,

    /// Board FQBN (`esp32:esp32:esp32c3`) or chip name (`esp32c3`)
    #[arg(short, long)]
    pub target: Option<String>,

    /// Build output folder holding `<sketch>.ino.elf`
    #[arg(long)]
    pub build_path: Option<PathBuf>,

    /// Sketch folder
    #[arg(long)]
    pub sketch_path: Option<PathBuf>,

    /// Board build property as KEY=VALUE (repeatable)
    #[arg(long = "build-property", value_parser = parse_key_val)]
    pub build_properties: Vec<(String, String)>,

    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,

    /// GDB remote timeout in seconds for register dump decoding
    #[arg(long)]
    pub remote_timeout: Option<u32>,

    /// Use the short, non-interactive remote timeout
    #[arg(long)]
    pub batch_remote: bool,

    /// Path to configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "warn")]
    pub log_level: String,

    /// Log file path
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Generate default configuration file
    #[arg(long)]
    pub generate_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    pub validate_config: bool,

    /// Show current configuration and exit
    #[arg(long)]
    pub show_config: bool,
}

fn parse_key_val(s: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
    if key.is_empty() {
        return Err(format!("empty key in '{}'", s));
    }
    Ok((key.to_string(), value.to_string()))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Main configuration structure
#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub decoder: DecoderConfig,
    pub output: OutputConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file or create default
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            let content = std::fs::read_to_string(path).map_err(|e| {
                DecodeError::InvalidConfig(format!("Failed to read config file: {}", e))
            })?;
            let config: Config = toml::from_str(&content)
                .map_err(|e| DecodeError::InvalidConfig(format!("Invalid TOML syntax: {}", e)))?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Merge command line arguments into configuration
    pub fn merge_args(&mut self, args: &Args) {
        if args.batch_remote {
            self.decoder.interactive = false;
        }
        if let Some(timeout) = args.remote_timeout {
            if self.decoder.interactive {
                self.decoder.interactive_remote_timeout_secs = timeout;
            } else {
                self.decoder.batch_remote_timeout_secs = timeout;
            }
        }
        if let Some(format) = args.format {
            self.output.format = format;
        }
        self.logging.level = args.log_level.clone();
        if args.log_file.is_some() {
            self.logging.file = args.log_file.clone();
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.decoder.interactive_remote_timeout_secs == 0 {
            return Err(DecodeError::InvalidConfig(
                "decoder.interactive_remote_timeout_secs must be > 0".to_string(),
            ));
        }
        if self.decoder.batch_remote_timeout_secs == 0 {
            return Err(DecodeError::InvalidConfig(
                "decoder.batch_remote_timeout_secs must be > 0".to_string(),
            ));
        }
        if !LOG_LEVELS.contains(&self.logging.level.to_ascii_lowercase().as_str()) {
            return Err(DecodeError::InvalidConfig(format!(
                "logging.level must be one of {}, got '{}'",
                LOG_LEVELS.join(", "),
                self.logging.level
            )));
        }
        Ok(())
    }

    /// Generate TOML configuration string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| DecodeError::InvalidConfig(format!("Failed to serialize config: {}", e)))
    }

    pub fn remote_timeout_secs(&self) -> u32 {
        if self.decoder.interactive {
            self.decoder.interactive_remote_timeout_secs
        } else {
            self.decoder.batch_remote_timeout_secs
        }
    }

    pub fn decode_options(&self, cancel: CancellationToken) -> DecodeOptions {
        DecodeOptions {
            cancel,
            remote_timeout_secs: self.remote_timeout_secs(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DecoderConfig {
    /// Whether a human may be attached to the GDB session
    pub interactive: bool,
    pub interactive_remote_timeout_secs: u32,
    pub batch_remote_timeout_secs: u32,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            interactive: true,
            interactive_remote_timeout_secs: INTERACTIVE_REMOTE_TIMEOUT_SECS,
            batch_remote_timeout_secs: BATCH_REMOTE_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct OutputConfig {
    pub format: OutputFormat,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            file: None,
        }
    }
}
