pub mod config;
pub mod logging;

pub use config::{Profile, get_env};
pub use logging::setup_logging;
