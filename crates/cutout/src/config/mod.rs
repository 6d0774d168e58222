pub mod loader;
pub mod schema;

pub use loader::{load_config, load_config_from_str, load_config_with_env, validate_config};
pub use schema::{Config, ENV_PREFIX};
