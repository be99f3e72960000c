// src/config/mod.rs
// Gateway configuration - env vars, optional config file, secret store

mod env;
mod file;
mod secrets;

pub use env::{GatewayConfig, parse_bool_env};
pub use file::FileConfig;
pub use secrets::{SecretStore, Secrets};
