use super::*;

// =============================================================================
// env_bool / env_parse: unique env var names avoid races with parallel tests.
// =============================================================================

#[test]
fn env_bool_true_variants() {
    for (i, val) in ["1", "true", "yes", "on", "TRUE", "On"].iter().enumerate() {
        let key = format!("__TEST_CHAT_EB_TRUE_{i}__");
        unsafe { std::env::set_var(&key, val) };
        assert_eq!(env_bool(&key), Some(true), "expected true for {val:?}");
        unsafe { std::env::remove_var(&key) };
    }
}

#[test]
fn env_bool_false_variants() {
    for (i, val) in ["0", "false", "no", "off", " False "].iter().enumerate() {
        let key = format!("__TEST_CHAT_EB_FALSE_{i}__");
        unsafe { std::env::set_var(&key, val) };
        assert_eq!(env_bool(&key), Some(false), "expected false for {val:?}");
        unsafe { std::env::remove_var(&key) };
    }
}

#[test]
fn env_bool_invalid_or_missing_returns_none() {
    let key = "__TEST_CHAT_EB_INVALID_4411__";
    unsafe { std::env::set_var(key, "maybe") };
    assert_eq!(env_bool(key), None);
    unsafe { std::env::remove_var(key) };
    assert_eq!(env_bool(key), None);
}

#[test]
fn env_parse_falls_back_on_garbage() {
    let key = "__TEST_CHAT_EP_GARBAGE_7730__";
    unsafe { std::env::set_var(key, "not-a-number") };
    assert_eq!(env_parse(key, 42_usize), 42);
    unsafe { std::env::set_var(key, " 17 ") };
    assert_eq!(env_parse(key, 42_usize), 17);
    unsafe { std::env::remove_var(key) };
}

// =============================================================================
// ChatConfig
// =============================================================================

#[test]
fn chat_config_default_values() {
    let cfg = ChatConfig::default();
    assert_eq!(cfg.outbox_capacity, DEFAULT_OUTBOX_CAPACITY);
    assert_eq!(cfg.send_timeout, Duration::from_millis(DEFAULT_SEND_TIMEOUT_MS));
    assert_eq!(cfg.max_message_chars, DEFAULT_MAX_MESSAGE_CHARS);
    assert_eq!(cfg.ping_interval, Duration::from_millis(DEFAULT_PING_INTERVAL_MS));
    assert_eq!(cfg.idle_timeout, Duration::from_millis(DEFAULT_IDLE_TIMEOUT_MS));
    assert!(cfg.ping_interval < cfg.idle_timeout);
    assert!(cfg.echo_to_sender);
    assert!(cfg.require_membership);
    assert_eq!(cfg.session_cookie, "session_token");
}

/// Single test touches the shared `CHAT_*` keys so parallel tests cannot race.
#[test]
fn chat_config_from_env_overrides_and_clamps() {
    unsafe {
        std::env::set_var("CHAT_OUTBOX_CAPACITY", "0");
        std::env::set_var("CHAT_SEND_TIMEOUT_MS", "250");
        std::env::set_var("CHAT_MAX_MESSAGE_CHARS", "12");
        std::env::set_var("CHAT_PING_INTERVAL_MS", "0");
        std::env::set_var("CHAT_IDLE_TIMEOUT_MS", "1500");
        std::env::set_var("CHAT_ECHO_TO_SENDER", "off");
        std::env::set_var("CHAT_REQUIRE_MEMBERSHIP", "no");
        std::env::set_var("SESSION_COOKIE_NAME", "sessionid");
    }

    let cfg = ChatConfig::from_env();
    assert_eq!(cfg.outbox_capacity, 1, "capacity is clamped to at least one slot");
    assert_eq!(cfg.send_timeout, Duration::from_millis(250));
    assert_eq!(cfg.max_message_chars, 12);
    assert_eq!(cfg.ping_interval, Duration::from_millis(1), "ping interval is clamped above zero");
    assert_eq!(cfg.idle_timeout, Duration::from_millis(1500));
    assert!(!cfg.echo_to_sender);
    assert!(!cfg.require_membership);
    assert_eq!(cfg.session_cookie, "sessionid");

    unsafe {
        std::env::remove_var("CHAT_OUTBOX_CAPACITY");
        std::env::remove_var("CHAT_SEND_TIMEOUT_MS");
        std::env::remove_var("CHAT_MAX_MESSAGE_CHARS");
        std::env::remove_var("CHAT_PING_INTERVAL_MS");
        std::env::remove_var("CHAT_IDLE_TIMEOUT_MS");
        std::env::remove_var("CHAT_ECHO_TO_SENDER");
        std::env::remove_var("CHAT_REQUIRE_MEMBERSHIP");
        std::env::remove_var("SESSION_COOKIE_NAME");
    }
}

// =============================================================================
// Config
// =============================================================================

/// Single test touches `DATABASE_URL` / `PORT` so parallel tests cannot race.
#[test]
fn config_from_env_requires_database_url_and_validates_port() {
    unsafe {
        std::env::remove_var("DATABASE_URL");
        std::env::remove_var("PORT");
    }
    assert_eq!(Config::from_env(), Err(ConfigError::Missing("DATABASE_URL")));

    unsafe { std::env::set_var("DATABASE_URL", "postgres://chat@localhost/brewbuddies") };
    let cfg = Config::from_env().expect("config with only DATABASE_URL");
    assert_eq!(cfg.port, DEFAULT_PORT);
    assert_eq!(cfg.database_url, "postgres://chat@localhost/brewbuddies");

    unsafe { std::env::set_var("PORT", "8081") };
    assert_eq!(Config::from_env().map(|c| c.port), Ok(8081));

    unsafe { std::env::set_var("PORT", "eighty") };
    assert_eq!(
        Config::from_env(),
        Err(ConfigError::Invalid { key: "PORT", value: "eighty".into() })
    );

    unsafe {
        std::env::remove_var("DATABASE_URL");
        std::env::remove_var("PORT");
    }
}
