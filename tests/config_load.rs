use std::time::Duration;

use plmgate::config::Config;
use plmgate::device::types::DeviceTypeRegistry;
use tempfile::TempDir;

const SAMPLE: &str = r#"
device_types_file = "types.toml"

[modem]
port = "/dev/ttyUSB3"
baud_rate = 19200

[transport]
ack_timeout_ms = 800
max_retries = 5
reconnect_backoff_ms = [100, 200]

[polling]
poll_interval_secs = 60
direct_ack_timeout_ms = 4000
dead_device_count = 3

[[devices]]
address = "28.c3.91"
product_key = "F00.00.02"
name = "porch"

[[devices]]
address = "B.7"
product_key = "X00.00.01"
"#;

#[test]
fn load_sample_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, SAMPLE).unwrap();

    let cfg = tokio_test::block_on(Config::load(path.to_str().unwrap())).unwrap();
    assert_eq!(cfg.modem.port, "/dev/ttyUSB3");
    assert_eq!(cfg.modem.baud_rate, 19200);
    assert_eq!(cfg.devices.len(), 2);
    assert_eq!(cfg.devices[0].parsed_address().unwrap().to_string(), "28.C3.91");
    assert!(cfg.devices[1].parsed_address().unwrap().is_x10());

    let port = cfg.port_tuning();
    assert_eq!(port.ack_timeout, Duration::from_millis(800));
    assert_eq!(port.max_retries, 5);
    assert_eq!(port.reconnect_backoff, vec![Duration::from_millis(100), Duration::from_millis(200)]);

    let dev = cfg.device_tuning();
    assert_eq!(dev.direct_ack_timeout, Duration::from_millis(4000));
    assert_eq!(dev.dead_device_count, 3);
    assert_eq!(cfg.poll_interval(), Duration::from_secs(60));
}

#[test]
fn init_writes_a_loadable_default() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    let path = path.to_str().unwrap();
    tokio_test::block_on(Config::create_default(path)).unwrap();
    let cfg = tokio_test::block_on(Config::load(path)).unwrap();
    assert_eq!(cfg.modem.baud_rate, 115200);
    assert!(!cfg.devices.is_empty());
}

#[test]
fn missing_or_broken_files_are_errors() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("nope.toml");
    let err = tokio_test::block_on(Config::load(missing.to_str().unwrap())).unwrap_err();
    assert!(err.to_string().contains("Failed to read"));

    let broken = dir.path().join("broken.toml");
    std::fs::write(&broken, "[modem\nport=").unwrap();
    let err = tokio_test::block_on(Config::load(broken.to_str().unwrap())).unwrap_err();
    assert!(err.to_string().contains("Failed to parse"));

    let bad_addr = dir.path().join("bad.toml");
    std::fs::write(&bad_addr, "[modem]\nport = \"x\"\n[[devices]]\naddress = \"Q.99\"\nproduct_key = \"X00.00.01\"\n").unwrap();
    assert!(tokio_test::block_on(Config::load(bad_addr.to_str().unwrap())).is_err());
}

#[tokio::test]
async fn device_types_file_extends_builtin_table() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("types.toml");
    std::fs::write(
        &path,
        r#"
[[device_type]]
product_key = "F00.00.0E"
model = "2476D"
description = "SwitchLinc Dimmer (older)"
features = [
    { name = "dimmer", template = "DimmerLevel", group = 1 },
    { name = "lastheardfrom", template = "LastHeardFrom" },
]
"#,
    )
    .unwrap();
    let mut types = DeviceTypeRegistry::builtin();
    let before = types.len();
    assert_eq!(types.load_file(path.to_str().unwrap()).await.unwrap(), 1);
    assert_eq!(types.len(), before + 1);
    let t = types.get("F00.00.0E").unwrap();
    assert_eq!(t.build_features().unwrap().len(), 2);

    std::fs::write(
        &path,
        "[[device_type]]\nproduct_key = \"F00.00.0F\"\nfeatures = [{ name = \"x\", template = \"Toaster\" }]\n",
    )
    .unwrap();
    assert!(types.load_file(path.to_str().unwrap()).await.is_err());
    assert!(types.get("F00.00.0F").is_err());
}
