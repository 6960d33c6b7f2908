//! Runtime configuration.
//!
//! Options are read once from the environment and cached for the process
//! lifetime:
//! - `HEARTH_RECLAIM`: `eager` (default) lets collect operations absorb
//!   abandoned heaps opportunistically; `off` leaves abandoned heaps on the
//!   registry until a forced collect.
//! - `HEARTH_TRACE`: `on` (default) records structured lifecycle events per
//!   thread; `off` disables recording.

use std::sync::OnceLock;

/// When collect operations try to absorb abandoned heaps.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimMode {
    /// Reclaim opportunistically on every non-abandoning collect.
    #[default]
    Eager,
    /// Never reclaim from the normal collect path.
    Off,
}

impl ReclaimMode {
    /// Parse from string (case-insensitive); unknown values fall back to
    /// the default.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "eager" | "on" | "default" => Self::Eager,
            "off" | "none" | "disabled" => Self::Off,
            _ => Self::Eager,
        }
    }
}

/// Process-wide options, parsed once.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeOptions {
    /// Gate for opportunistic abandoned-heap reclamation.
    pub reclaim: ReclaimMode,
    /// Gate for structured lifecycle recording.
    pub trace: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            reclaim: ReclaimMode::Eager,
            trace: true,
        }
    }
}

fn parse_bool_loose(s: &str, default: bool) -> bool {
    match s.to_ascii_lowercase().as_str() {
        "on" | "true" | "1" | "yes" => true,
        "off" | "false" | "0" | "no" | "none" | "disabled" => false,
        _ => default,
    }
}

static GLOBAL_OPTIONS: OnceLock<RuntimeOptions> = OnceLock::new();

/// Get the configured options (reads env vars on first call, caches thereafter).
#[must_use]
pub fn options() -> RuntimeOptions {
    *GLOBAL_OPTIONS.get_or_init(|| {
        let defaults = RuntimeOptions::default();
        RuntimeOptions {
            reclaim: std::env::var("HEARTH_RECLAIM")
                .map(|v| ReclaimMode::from_str_loose(&v))
                .unwrap_or(defaults.reclaim),
            trace: std::env::var("HEARTH_TRACE")
                .map(|v| parse_bool_loose(&v, defaults.trace))
                .unwrap_or(defaults.trace),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reclaim_modes() {
        assert_eq!(ReclaimMode::from_str_loose("eager"), ReclaimMode::Eager);
        assert_eq!(ReclaimMode::from_str_loose("EAGER"), ReclaimMode::Eager);
        assert_eq!(ReclaimMode::from_str_loose("on"), ReclaimMode::Eager);
        assert_eq!(ReclaimMode::from_str_loose("off"), ReclaimMode::Off);
        assert_eq!(ReclaimMode::from_str_loose("none"), ReclaimMode::Off);
        assert_eq!(ReclaimMode::from_str_loose("bogus"), ReclaimMode::Eager);
    }

    #[test]
    fn test_parse_bool_loose() {
        assert!(parse_bool_loose("on", false));
        assert!(parse_bool_loose("TRUE", false));
        assert!(!parse_bool_loose("off", true));
        assert!(!parse_bool_loose("0", true));
        assert!(parse_bool_loose("garbage", true));
        assert!(!parse_bool_loose("garbage", false));
    }

    #[test]
    fn test_defaults() {
        let defaults = RuntimeOptions::default();
        assert_eq!(defaults.reclaim, ReclaimMode::Eager);
        assert!(defaults.trace);
    }
}
