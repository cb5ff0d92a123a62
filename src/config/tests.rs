use std::time::Duration;

use crate::config::{CacheConfig, ClusterConfig, DebugFlags};
use crate::error::Error;

#[test]
fn defaults_match_documented_values() {
    let config = CacheConfig::default();
    assert!(!config.case_sensitive);
    assert_eq!(config.expiry_interval, Duration::from_secs(15));
    assert_eq!(config.max_deferred, 3);
    assert_eq!(config.break_timeout, Duration::from_secs(30));
    assert_eq!(config.debug, DebugFlags::NONE);
}

#[test]
fn parses_toml_document() {
    let config = CacheConfig::from_toml(
        r#"
        case_sensitive = true
        expiry_interval = 60
        max_deferred = 5
        debug = ["Oplock", "ByteLock"]
        "#,
    )
    .expect("parse");

    assert!(config.case_sensitive);
    assert_eq!(config.expiry_interval, Duration::from_secs(60));
    assert_eq!(config.max_deferred, 5);
    assert!(config.debug_enabled(DebugFlags::OPLOCK));
    assert!(config.debug_enabled(DebugFlags::BYTE_LOCK));
    assert!(!config.debug_enabled(DebugFlags::EXPIRE));
}

#[test]
fn unknown_debug_flags_are_ignored() {
    let config = CacheConfig::from_toml(r#"debug = ["Oplock", "Bogus"]"#).expect("parse");
    assert_eq!(config.debug, DebugFlags::OPLOCK);
}

#[test]
fn cluster_validation_requires_names() {
    let config = ClusterConfig::from_toml(r#"topic_name = "states""#).expect("parse");
    assert!(matches!(config.validate(), Err(Error::Config(_))));
}

#[test]
fn near_cache_timeout_is_clamped() {
    let config = ClusterConfig::from_toml(
        r#"
        cluster_name = "grid"
        topic_name = "states"
        near_cache_timeout = 1
        "#,
    )
    .expect("parse")
    .validate()
    .expect("validate");

    assert_eq!(config.near_cache_timeout, Duration::from_secs(3));
}

#[test]
fn flag_union_and_membership() {
    let flags = DebugFlags::OPLOCK.with(DebugFlags::EXPIRE);
    assert!(flags.has(DebugFlags::OPLOCK));
    assert!(flags.has(DebugFlags::EXPIRE));
    assert!(!flags.has(DebugFlags::RENAME));
    assert!(DebugFlags::ALL.has(flags));
}
