pub mod core_settings;
pub mod settings_repository;

pub use core_settings::CoreSettings;
pub use settings_repository::{
    SettingsError, SettingsJsonRepository, SettingsRepository, SettingsResult,
};
