//! Configuration for the tradecast relay, gateway and watch client.
//!
//! Values are layered: compiled defaults, then `~/.tradecast/settings.json`,
//! then `TRADECAST_*` environment variables.

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{load_settings, load_settings_from_path, settings_path};
pub use types::{
    ChannelBackend, ChannelSettings, ClientSettings, LoggingSettings, ServerSettings, Settings,
    WorkerSettings,
};
