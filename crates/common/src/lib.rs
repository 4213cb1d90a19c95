//! Shared configuration, policy values and error types for the admission
//! control workspace.

pub mod config;
pub mod error;

pub use config::{
    AdminConfig, AppConfig, EndpointPolicy, LoadConfig, RateLimit, RateLimitAlgorithm,
    RateLimitConfig, SchedulerConfig, ServerConfig, ThrottleConfig, MAX_WINDOW_SECS,
};
pub use error::{AdmissionError, AdmissionResult};
