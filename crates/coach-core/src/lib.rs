pub mod conversation;
pub mod credits;
pub mod errors;
pub mod ids;
pub mod messages;
pub mod provider;
pub mod settings;
pub mod shadow;
pub mod traces;

pub use errors::{GuardError, ModelError, SettingsError};
pub use settings::CoachSettings;
