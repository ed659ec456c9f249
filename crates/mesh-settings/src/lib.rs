//! # mesh-settings
//!
//! Layered configuration for the coordinator and the agent.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults** — [`MeshSettings::default()`]
//! 2. **User file** — `~/.mesh/settings.json` (deep-merged over defaults)
//! 3. **Environment variables** — `MESH_*` overrides (highest priority)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
