pub mod config;
pub mod health;
pub mod metrics;
pub mod quotas;
pub mod status;
