//! Timing configuration, the enabled flag and the toggle command.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use serde::{Deserialize, Serialize};

/// Timings used by the dispatcher and the document watcher.
///
/// Hosts usually embed this under an `"autorun"` key in their own settings
/// document; see [`AutorunConfig::from_settings`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AutorunConfig {
    /// Minimum interval between two dispatches of the same cell id.
    pub cooldown_ms: u64,
    /// Quiet period after the last document change before diffing.
    pub debounce_ms: u64,
    /// Extra wait after the debounce so trailing structural edits land.
    pub settle_ms: u64,
    /// Wait before running a cell a peer just inserted.
    pub insert_settle_ms: u64,
    /// Wait before attaching an observer to a newly added cell.
    pub materialize_ms: u64,
}

impl Default for AutorunConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: 2000,
            debounce_ms: 1000,
            settle_ms: 300,
            insert_settle_ms: 100,
            materialize_ms: 50,
        }
    }
}

impl AutorunConfig {
    /// Read the `"autorun"` section of a host settings document.
    ///
    /// Missing keys keep their defaults. A malformed section is logged and
    /// ignored rather than failing the host's settings load.
    pub fn from_settings(settings: &serde_json::Value) -> Self {
        match settings.get("autorun") {
            None => Self::default(),
            Some(section) => match serde_json::from_value(section.clone()) {
                Ok(config) => config,
                Err(e) => {
                    warn!("[autorun] Ignoring invalid autorun settings: {}", e);
                    Self::default()
                }
            },
        }
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn insert_settle(&self) -> Duration {
        Duration::from_millis(self.insert_settle_ms)
    }

    pub fn materialize(&self) -> Duration {
        Duration::from_millis(self.materialize_ms)
    }
}

/// Process-wide switch gating all automatic execution. Not persisted.
///
/// Clones share the same flag.
#[derive(Debug, Clone)]
pub struct EnabledFlag(Arc<AtomicBool>);

impl Default for EnabledFlag {
    fn default() -> Self {
        Self::new(true)
    }
}

impl EnabledFlag {
    pub fn new(enabled: bool) -> Self {
        Self(Arc::new(AtomicBool::new(enabled)))
    }

    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, enabled: bool) {
        self.0.store(enabled, Ordering::SeqCst);
    }

    /// Flip the flag and return the new value.
    pub fn toggle(&self) -> bool {
        !self.0.fetch_xor(true, Ordering::SeqCst)
    }
}

/// The `autorun:toggle` command, ready for command-palette binding.
#[derive(Debug, Clone)]
pub struct ToggleCommand {
    flag: EnabledFlag,
}

impl ToggleCommand {
    pub const ID: &'static str = "autorun:toggle";
    pub const CAPTION: &'static str = "Toggle auto-execution of remotely modified cells";

    pub fn new(flag: EnabledFlag) -> Self {
        Self { flag }
    }

    pub fn id(&self) -> &'static str {
        Self::ID
    }

    pub fn caption(&self) -> &'static str {
        Self::CAPTION
    }

    pub fn label(&self) -> &'static str {
        if self.flag.is_enabled() {
            "Auto-Run: ON"
        } else {
            "Auto-Run: OFF"
        }
    }

    pub fn is_toggled(&self) -> bool {
        self.flag.is_enabled()
    }

    /// Flip the flag. Returns whether auto-run is now enabled.
    pub fn execute(&self) -> bool {
        let enabled = self.flag.toggle();
        info!(
            "[autorun] Auto-run {}",
            if enabled { "enabled" } else { "disabled" }
        );
        enabled
    }
}
