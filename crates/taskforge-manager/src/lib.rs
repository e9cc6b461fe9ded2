pub mod config;
pub mod manager;

pub use config::{BotEntry, BotsConfig};
pub use manager::{ManagerSettings, MultiBotManager};
