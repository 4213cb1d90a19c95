use admission_common::{AppConfig, RateLimitAlgorithm};

#[test]
fn test_shipped_config_is_valid() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../config/admissiond.yaml");
    let config = AppConfig::load(path).unwrap();

    assert_eq!(config.rate_limit.global.capacity, 100);
    assert_eq!(config.rate_limit.global.burst, 20);
    assert_eq!(
        config.rate_limit.endpoints["search"].algorithm,
        RateLimitAlgorithm::SlidingWindow
    );
    assert_eq!(
        config.rate_limit.endpoints["export"].algorithm,
        RateLimitAlgorithm::TokenBucket
    );
    assert_eq!(config.scheduler.max_concurrent, 64);
    assert_eq!(config.throttle.saturation, 0.95);
}

#[test]
fn test_missing_file_is_an_io_error() {
    let err = AppConfig::load("/nonexistent/admissiond.yaml").unwrap_err();
    assert!(err.to_string().starts_with("I/O error"));
}
