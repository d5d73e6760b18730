//! Execution core configuration
//!
//! Settings are stored as TOML in the user's configuration directory. Every
//! field has a default so a partial or missing file is fine.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Name of the directory used under the platform config/cache dirs
const APP_DIR: &str = "oxidized-ppu";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cpu: CpuConfig,
    pub cache: CacheConfig,
    pub debug: DebugConfig,
}

/// PPU decoder selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PpuDecoderType {
    /// Batched interpreter
    Interpreter,
    /// Single-step interpreter with precise floating point
    InterpreterPrecise,
    /// Ahead-of-time translated code with interpreter fallback
    #[default]
    Recompiler,
}

/// Reservation granularity policy for lwarx/ldarx
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationGranularity {
    /// Pick per call site by scanning for the matching store-conditional
    #[default]
    Auto,
    /// Always watch the aligned 8-byte word
    Word,
    /// Always watch the full 128-byte line
    Line,
}

/// CPU and recompiler settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuConfig {
    pub ppu_decoder: PpuDecoderType,
    /// Compile worker threads, 0 = host parallelism
    pub ppu_threads: usize,
    /// Concurrent backend invocations allowed across all workers
    pub compiler_slots: usize,
    /// Use fused multiply-add for fmadd
    pub accurate_fma: bool,
    /// dcbz takes the line lock and invalidates reservations
    pub accurate_cache_line_stores: bool,
    pub reservation_granularity: ReservationGranularity,
    /// Transaction attempts before escalating to the line lock
    pub htm_retries: u32,
    /// How long a failed reservation snapshot may be reused
    pub reservation_fail_window_us: u64,
    pub max_chunk_bytes: u32,
    pub max_chunk_functions: usize,
    /// Unknown instructions a thread may skip before it is terminated
    pub stub_unknown_limit: u32,
    /// Capacity of each thread's command inbox
    pub command_capacity: usize,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            ppu_decoder: PpuDecoderType::default(),
            ppu_threads: 0,
            compiler_slots: 2,
            accurate_fma: true,
            accurate_cache_line_stores: false,
            reservation_granularity: ReservationGranularity::Auto,
            htm_retries: 3,
            reservation_fail_window_us: 100,
            max_chunk_bytes: 0x4_0000,
            max_chunk_functions: 1024,
            stub_unknown_limit: 16,
            command_capacity: 32,
        }
    }
}

/// Compiled object cache settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub directory: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let directory = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(APP_DIR)
            .join("ppu");
        Self {
            enabled: true,
            directory,
        }
    }
}

/// Log verbosity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Off,
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

/// Debugging and logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub log_level: LogLevel,
    pub log_to_file: bool,
    pub log_path: PathBuf,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            log_to_file: false,
            log_path: PathBuf::from("oxidized-ppu.log"),
        }
    }
}

impl Config {
    /// Path of the configuration file
    pub fn path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR).join("config.toml"))
    }

    /// Load the configuration file, falling back to defaults when it does not exist
    pub fn load() -> Result<Self, ConfigError> {
        let Some(path) = Self::path() else {
            return Ok(Self::default());
        };
        match std::fs::read_to_string(&path) {
            Ok(text) => Self::from_toml_str(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write the configuration file
    pub fn save(&self) -> Result<(), ConfigError> {
        let Some(path) = Self::path() else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Number of compile workers to use
    pub fn compile_threads(&self) -> usize {
        match self.cpu.ppu_threads {
            0 => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            n => n,
        }
    }
}
