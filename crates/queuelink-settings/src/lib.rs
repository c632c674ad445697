//! # queuelink-settings
//!
//! Client settings loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`ClientSettings::default()`]
//! 2. **User file**: `~/.queuelink/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `QUEUELINK_*` overrides (highest priority)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;

use std::sync::OnceLock;

/// Global settings singleton, initialized on first access.
static SETTINGS: OnceLock<ClientSettings> = OnceLock::new();

/// Get the global settings instance.
///
/// On first call, loads settings from `~/.queuelink/settings.json` with env
/// var overrides. If loading fails, returns compiled defaults.
pub fn get_settings() -> &'static ClientSettings {
    SETTINGS.get_or_init(|| load_settings().unwrap_or_default())
}

/// Initialize the global settings with a specific value.
///
/// Returns the settings back if the global was already initialized.
#[allow(clippy::result_large_err)]
pub fn init_settings(settings: ClientSettings) -> std::result::Result<(), ClientSettings> {
    SETTINGS.set(settings)
}
