pub mod config;
pub mod connectors;
pub mod contract;
pub mod driver;
pub mod error;
pub mod gateway;
pub mod notifications;
pub mod operation_log;
pub mod session;
pub mod tracker;
pub mod user_settings;
pub mod wallet;

#[cfg(test)]
mod testing;
