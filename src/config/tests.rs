//! Config module tests

use super::*;

#[test]
fn test_substitute_env_vars_simple() {
    std::env::set_var("RELAYMQ_TEST_VAR_SIMPLE", "hello");
    let result = substitute_env_vars("value = \"${RELAYMQ_TEST_VAR_SIMPLE}\"");
    assert_eq!(result, "value = \"hello\"");
    std::env::remove_var("RELAYMQ_TEST_VAR_SIMPLE");
}

#[test]
fn test_substitute_env_vars_with_default() {
    // Unset var should use default
    std::env::remove_var("RELAYMQ_TEST_VAR_UNSET");
    let result = substitute_env_vars("value = \"${RELAYMQ_TEST_VAR_UNSET:-default_value}\"");
    assert_eq!(result, "value = \"default_value\"");

    // Set var should use env value
    std::env::set_var("RELAYMQ_TEST_VAR_SET", "env_value");
    let result = substitute_env_vars("value = \"${RELAYMQ_TEST_VAR_SET:-default_value}\"");
    assert_eq!(result, "value = \"env_value\"");
    std::env::remove_var("RELAYMQ_TEST_VAR_SET");
}

#[test]
fn test_substitute_env_vars_missing_no_default() {
    std::env::remove_var("RELAYMQ_TEST_VAR_MISSING");
    let result = substitute_env_vars("value = \"${RELAYMQ_TEST_VAR_MISSING}\"");
    assert_eq!(result, "value = \"\"");
}

#[test]
fn test_load_config_with_env_substitution() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("relaymq.toml");

    std::env::set_var("RELAYMQ_TEST_BIND_HOST", "127.0.0.1");
    std::env::set_var("RELAYMQ_TEST_BIND_PORT", "1885");

    let config_content = r#"
[server]
bind = "${RELAYMQ_TEST_BIND_HOST}:${RELAYMQ_TEST_BIND_PORT}"
shutdown_timeout = "${RELAYMQ_TEST_SHUTDOWN:-2s}"

[mqtt]
mount_point = "tenant1/"
"#;

    std::fs::write(&config_path, config_content).unwrap();

    let config = Config::load(&config_path).unwrap();
    assert_eq!(config.server.bind.to_string(), "127.0.0.1:1885");
    assert_eq!(config.server.shutdown_timeout, Duration::from_secs(2));
    assert_eq!(config.mqtt.mount_point, "tenant1/");
    // Untouched sections keep their defaults
    assert_eq!(config.session.queue_size, 64);
    assert_eq!(config.cluster.mode, DeployMode::Local);

    std::env::remove_var("RELAYMQ_TEST_BIND_HOST");
    std::env::remove_var("RELAYMQ_TEST_BIND_PORT");
}

#[test]
fn test_load_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.server.bind.port(), 1883);
    assert_eq!(config.log.level, "warn");
}

#[test]
fn test_default_config() {
    let config = Config::default();
    assert_eq!(config.server.bind.port(), 1883);
    assert_eq!(config.server.connect_timeout, Duration::from_secs(10));
    assert_eq!(config.mqtt.message_size_limit, 256 * 1024);
    assert!(config.mqtt.allow_zero_length_client_id);
    assert!(!config.mqtt.upgrade_outgoing_qos);
    assert!(config.mqtt.mount_point.is_empty());
    assert_eq!(config.session.msg_queue_size, 1000);
    assert_eq!(config.cluster.mqtt_event_mask, 0x00FF);
    assert_eq!(config.storage.backend, StorageBackendKind::Memory);
    assert!(!config.auth.enabled);
    assert!(config.auth.allow_anonymous);
    assert!(!config.acl.enabled);
    assert!(config.validate().is_ok());
}

#[test]
fn test_parse_minimal_config() {
    let toml = r#"
[server]
bind = "127.0.0.1:1883"
"#;

    let config = Config::parse(toml).unwrap();
    assert_eq!(config.server.bind.to_string(), "127.0.0.1:1883");
}

#[test]
fn test_parse_full_config() {
    let toml = r##"
[log]
level = "debug"

[server]
bind = "0.0.0.0:1883"
shutdown_timeout = "3s"
connect_timeout = "500ms"

[mqtt]
message_size_limit = 1024
max_packet_size = 4096
allow_zero_length_client_id = false
user_name_as_client_id = true
upgrade_outgoing_qos = true
mount_point = "acme/"

[session]
queue_size = 16
msg_queue_size = 100
retry_interval = "5s"
tick_interval = "250ms"
default_keep_alive = 30

[cluster]
mode = "cluster"
broker_id = "node-a"
transport_addr = "10.0.0.1:7883"
mqtt_event_mask = 255

[storage]
backend = "fjall"
path = "/var/lib/relaymq"

[auth]
enabled = true
allow_anonymous = false

[[auth.users]]
username = "admin"
password = "secret123"
role = "admin"

[[auth.users]]
username = "sensor1"
password = "pw"
role = "device"

[acl]
enabled = true

[[acl.roles]]
name = "admin"
publish = ["#"]
subscribe = ["#"]

[[acl.roles]]
name = "device"
publish = ["sensors/%c/#"]
subscribe = ["commands/%c/#"]

[acl.default]
publish = []
subscribe = ["public/+"]
"##;

    let config = Config::parse(toml).unwrap();
    assert_eq!(config.log.level, "debug");
    assert_eq!(config.server.connect_timeout, Duration::from_millis(500));
    assert_eq!(config.mqtt.message_size_limit, 1024);
    assert!(!config.mqtt.allow_zero_length_client_id);
    assert!(config.mqtt.user_name_as_client_id);
    assert!(config.mqtt.upgrade_outgoing_qos);
    assert_eq!(config.mqtt.mount_point, "acme/");
    assert_eq!(config.session.retry_interval, Duration::from_secs(5));
    assert_eq!(config.session.tick_interval, Duration::from_millis(250));
    assert_eq!(config.session.default_keep_alive, 30);
    assert_eq!(config.cluster.mode, DeployMode::Cluster);
    assert_eq!(config.cluster.broker_id.as_deref(), Some("node-a"));
    assert_eq!(config.cluster.mqtt_channel, "relaymq.mqtt");
    assert_eq!(config.storage.backend, StorageBackendKind::Fjall);
    assert_eq!(config.storage.path, PathBuf::from("/var/lib/relaymq"));
    assert!(config.auth.enabled);
    assert!(!config.auth.allow_anonymous);
    assert_eq!(config.auth.users.len(), 2);
    assert_eq!(config.auth.users[0].password, "secret123");
    assert_eq!(config.auth.users[1].role.as_deref(), Some("device"));
    assert_eq!(config.acl.roles.len(), 2);
    assert_eq!(config.acl.default.subscribe, vec!["public/+"]);
}

#[test]
fn test_invalid_message_size_limit() {
    let toml = r#"
[mqtt]
message_size_limit = 2048
max_packet_size = 1024
"#;

    let err = Config::parse(toml).unwrap_err().to_string();
    assert!(err.contains("message_size_limit"));
}

#[test]
fn test_invalid_mount_point() {
    let toml = r#"
[mqtt]
mount_point = "tenant/+/"
"#;

    assert!(Config::parse(toml).is_err());
}

#[test]
fn test_invalid_queue_size() {
    let toml = r#"
[session]
queue_size = 0
"#;

    assert!(Config::parse(toml).is_err());
}

#[test]
fn test_invalid_deploy_mode() {
    let toml = r#"
[cluster]
mode = "mesh"
"#;

    assert!(matches!(Config::parse(toml), Err(ConfigError::Parse(_))));
}

#[test]
fn test_cluster_channels_must_differ() {
    let toml = r#"
[cluster]
mode = "cluster"
mqtt_channel = "events"
broker_channel = "events"
"#;

    assert!(Config::parse(toml).is_err());
}

#[test]
fn test_invalid_acl_role_reference() {
    let toml = r#"
[auth]
enabled = true

[[auth.users]]
username = "admin"
password = "secret"
role = "nonexistent_role"

[acl]
enabled = true
"#;

    let result = Config::parse(toml);
    assert!(result.is_err());
}

#[test]
fn test_user_empty_password() {
    let toml = r#"
[auth]
enabled = true

[[auth.users]]
username = "admin"
password = ""
"#;

    let result = Config::parse(toml);
    assert!(result.is_err());
    let err = result.unwrap_err().to_string();
    assert!(err.contains("empty password"));
}
