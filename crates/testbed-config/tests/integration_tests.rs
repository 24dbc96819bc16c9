//! Integration tests for loading provider configuration from disk

use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;
use testbed_config::{ConfigError, parse_file};

#[test]
fn test_parse_full_config_file() {
    let yaml = r#"
version: "1.0"
provider:
  images:
    debian-12: 9000
    ubuntu-24.04: 9001
  management:
    bridge: vmbr0
    network: fd00:10::a/64
  initial_machine_id: 200
  internet_bridge: vmbr1
  bridges:
    prefix: tbr
    comment: scratch bridge
  max_interfaces: 8
  description: nightly run
  timeouts:
    task_ms: 60000
    ssh_connect_ms: 5000
  ssh:
    user: admin
    public_key: "ssh-ed25519 AAAA test"
    identity_file: /keys/id_ed25519
    port: 2222
"#;

    let mut file = NamedTempFile::new().unwrap();
    file.write_all(yaml.as_bytes()).unwrap();

    let config = parse_file(file.path()).unwrap();
    let provider = config.provider;

    assert_eq!(provider.images.len(), 2);
    assert_eq!(provider.images["ubuntu-24.04"], 9001);
    assert_eq!(provider.management.bridge, "vmbr0");
    assert_eq!(
        provider.management.network.addr(),
        "fd00:10::a".parse::<std::net::IpAddr>().unwrap()
    );
    assert_eq!(provider.management.network.prefix_len(), 64);
    assert_eq!(provider.initial_machine_id, 200);
    assert_eq!(provider.internet_bridge.as_deref(), Some("vmbr1"));
    assert_eq!(provider.bridges.prefix, "tbr");
    assert_eq!(provider.bridges.comment, "scratch bridge");
    assert!(provider.bridges.enabled);
    assert_eq!(provider.max_interfaces, 8);
    assert_eq!(provider.description, "nightly run");

    // Unspecified timeouts keep their defaults
    assert_eq!(provider.timeouts.task(), Duration::from_secs(60));
    assert_eq!(provider.timeouts.task_poll(), Duration::from_secs(1));
    assert_eq!(provider.timeouts.ssh_connect(), Duration::from_secs(5));
    assert_eq!(provider.timeouts.ssh_poll(), Duration::from_millis(100));

    assert_eq!(provider.ssh.user, "admin");
    assert_eq!(provider.ssh.port, Some(2222));
    assert_eq!(
        provider.ssh.identity_file.as_deref(),
        Some(std::path::Path::new("/keys/id_ed25519"))
    );
}

#[test]
fn test_missing_file() {
    let result = parse_file("/nonexistent/testbed.yaml");
    assert!(matches!(result, Err(ConfigError::ReadError(_))));
}

#[test]
fn test_malformed_yaml() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(b"version: \"1.0\"\nprovider: [not, a, map]\n")
        .unwrap();

    let result = parse_file(file.path());
    assert!(matches!(result, Err(ConfigError::YamlError(_))));
}

#[test]
fn test_invalid_management_network() {
    let yaml = r#"
version: "1.0"
provider:
  images:
    debian-12: 9000
  management:
    bridge: vmbr0
    network: not-an-address
"#;
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(yaml.as_bytes()).unwrap();

    assert!(matches!(
        parse_file(file.path()),
        Err(ConfigError::YamlError(_))
    ));
}
