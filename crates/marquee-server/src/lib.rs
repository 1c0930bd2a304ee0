pub mod server;
pub mod settings;

pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
pub use settings::{deep_merge, load_settings, load_settings_from_path, settings_path, MarqueeSettings, SettingsError};
