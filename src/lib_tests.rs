use super::*;

#[test]
fn test_recovery_config_defaults() {
    let config = RecoveryConfig::default();

    assert_eq!(config.max_retries, 3);
    assert_eq!(config.exchange_config_retries, 6);
    assert!(config.request_timeout > Duration::ZERO);
    assert!(config.exchange_config_backoff_base <= config.exchange_config_backoff_max);
}

#[test]
fn test_recovery_config_json_round_trip() {
    let config = RecoveryConfig {
        max_retries: 5,
        exchange_config_retries: 2,
        request_timeout: Duration::from_millis(1500),
        failed_settle_delay: Duration::from_millis(10),
        low_memory_delay: Duration::from_millis(20),
        exchange_config_backoff_base: Duration::from_millis(1),
        exchange_config_backoff_max: Duration::from_millis(100),
    };

    let json = serde_json::to_string(&config).unwrap();
    let back: RecoveryConfig = serde_json::from_str(&json).unwrap();

    assert_eq!(back.max_retries, 5);
    assert_eq!(back.request_timeout, Duration::from_millis(1500));
}

#[test]
fn test_erp_error_display() {
    let err = ErpError::TargetFailed("port 0x5005076300c7a8d1".to_string());
    assert!(err.to_string().contains("permanently failed"));

    let err = ErpError::InvalidIdentity("garbage".to_string());
    assert!(err.to_string().contains("garbage"));
}
