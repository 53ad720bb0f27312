//! Tests for config module

use std::path::Path;

use backend_controller::config::{CheckpointBackend, Config};
use backend_controller::models::BackendTag;

#[test]
fn test_config_file_exists() {
    let config_path = Path::new("config.toml");
    assert!(
        config_path.exists(),
        "config.toml should exist in project root"
    );
}

#[test]
fn test_config_toml_readable() {
    let content =
        std::fs::read_to_string("config.toml").expect("Should be able to read config.toml");

    for section in ["[controller]", "[checkpoint]", "[logging]", "[[cluster.nodes]]", "[[backends]]"] {
        assert!(
            content.contains(section),
            "config.toml should have {section} section"
        );
    }
}

#[test]
fn test_config_toml_loads() {
    let config = Config::from_file(Path::new("config.toml")).expect("config.toml should load");

    assert_eq!(config.checkpoint.backend, CheckpointBackend::File);
    assert_eq!(config.cluster.nodes.len(), 2);
    assert_eq!(config.backends.len(), 2);

    let svc_a = &config.backends[0];
    assert_eq!(svc_a.tag, BackendTag::new("svc-a").unwrap());
    assert_eq!(svc_a.config.num_replicas, 2);
    assert_eq!(svc_a.replica.resources.memory_mb, 2048);

    let svc_b = &config.backends[1];
    assert_eq!(svc_b.config.max_batch_size, Some(8));
    assert_eq!(svc_b.replica.resources.gpus, 1.0);
}

#[test]
fn test_example_cluster_admits_example_backends() {
    use backend_controller::admission::ResourceScheduler;

    let config = Config::from_file(Path::new("config.toml")).unwrap();
    let cluster = config.cluster.to_resources();

    let mut requests = Vec::new();
    for backend in &config.backends {
        for _ in 0..backend.config.num_replicas {
            requests.push(backend.replica.resources.clone());
        }
    }
    assert!(cluster.can_schedule(&requests).into_iter().all(|ok| ok));
}

#[test]
fn test_invalid_backend_tag_rejected() {
    let result: Result<Config, _> = toml::from_str(
        r#"
        [[backends]]
        tag = "bad tag!"

        [backends.config]
        num_replicas = 1

        [backends.replica]
        entrypoint = "app:Model"
        "#,
    );
    assert!(result.is_err());
}

#[test]
fn test_missing_file() {
    let err = Config::from_file(Path::new("does-not-exist.toml")).unwrap_err();
    assert!(err.to_string().contains("does-not-exist.toml"));
}
