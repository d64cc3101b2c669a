//! Loop configuration parsing from .procloop.rc
//!
//! Recognized keys (the environment overrides the file):
//! - PROCLOOP_TIMEOUT (seconds, fractional allowed, default 3)
//! - PROCLOOP_LOG (log filter, default "info")
//! - PROCLOOP_LOGGING (1/true/on/yes enables loop lifecycle logging)
//! - PROCLOOP_PROCESS_NAME (name applied when the loop starts running)
//! - PROCLOOP_MAX_FRAME (largest accepted frame or field, in bytes)

use crate::protocol::MAX_FRAME_SIZE;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default poll timeout; periodic dispatch still happens without traffic
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

const KEYS: [&str; 5] = [
    "PROCLOOP_TIMEOUT",
    "PROCLOOP_LOG",
    "PROCLOOP_LOGGING",
    "PROCLOOP_PROCESS_NAME",
    "PROCLOOP_MAX_FRAME",
];

#[derive(Debug, Clone, PartialEq)]
pub struct LoopConfig {
    pub timeout: Duration,
    pub log_filter: String,
    pub logging: bool,
    pub process_name: Option<String>,
    pub max_frame: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            log_filter: "info".to_string(),
            logging: false,
            process_name: None,
            max_frame: MAX_FRAME_SIZE,
        }
    }
}

impl LoopConfig {
    /// ~/.procloop.rc, then environment overrides
    pub fn from_rc() -> Self {
        let mut config = Self::from_file(&Self::rc_path()).unwrap_or_default();
        config.apply_env();
        config
    }

    pub fn rc_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".procloop.rc")
    }

    pub fn from_file(path: &Path) -> Option<Self> {
        let content = fs::read_to_string(path).ok()?;
        Some(Self::parse(&content))
    }

    pub fn parse(content: &str) -> Self {
        let mut config = LoopConfig::default();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let line = line.strip_prefix("export ").unwrap_or(line);
            if let Some((key, value)) = parse_assignment(line) {
                config.set(&key, &unquote(&value));
            }
        }

        config
    }

    /// Let PROCLOOP_* environment variables override what the file said
    pub fn apply_env(&mut self) {
        for key in KEYS {
            if let Ok(value) = std::env::var(key) {
                self.set(key, &value);
            }
        }
    }

    // Malformed values keep the current setting
    fn set(&mut self, key: &str, value: &str) {
        match key {
            "PROCLOOP_TIMEOUT" => {
                if let Some(timeout) = parse_seconds(value) {
                    self.timeout = timeout;
                }
            }
            "PROCLOOP_LOG" => {
                if !value.is_empty() {
                    self.log_filter = value.to_string();
                }
            }
            "PROCLOOP_LOGGING" => {
                self.logging = matches!(
                    value.to_lowercase().as_str(),
                    "1" | "true" | "on" | "yes"
                );
            }
            "PROCLOOP_PROCESS_NAME" => {
                self.process_name = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "PROCLOOP_MAX_FRAME" => {
                if let Ok(max) = value.parse::<usize>() {
                    if max > 0 {
                        self.max_frame = max;
                    }
                }
            }
            _ => {}
        }
    }
}

fn parse_seconds(value: &str) -> Option<Duration> {
    let secs = value.parse::<f64>().ok()?;
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(secs))
}

/// Parse a shell variable assignment (KEY=value or KEY="value")
fn parse_assignment(line: &str) -> Option<(String, String)> {
    let eq_pos = line.find('=')?;
    let key = line[..eq_pos].trim().to_string();
    let value = line[eq_pos + 1..].trim().to_string();

    if key.is_empty() || !key.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return None;
    }

    Some((key, value))
}

/// Remove surrounding quotes from a value
fn unquote(s: &str) -> String {
    let s = s.trim();

    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')))
    {
        return s[1..s.len() - 1].to_string();
    }

    s.to_string()
}
