use std::{env, fs, process};

use orchestrator::{ClusterConfig, Credentials, ResourceDescriptor, Transport, create_config};

fn temp_path(name: &str) -> std::path::PathBuf {
    env::temp_dir().join(format!("{name}-{}.json", process::id()))
}

#[test]
fn saved_config_loads_back_equal() {
    let gpu_box = ResourceDescriptor::new("gpu-box")
        .with_address("127.0.0.1")
        .with_port(40001)
        .unwrap()
        .with_gpus([0, 1])
        .unwrap()
        .with_memory_gb(64.0)
        .with_cpu_cores(16)
        .with_credentials(Credentials {
            key_path: Some("/home/ono/.ssh/id_ed25519".into()),
            ..Credentials::new("ono", "t0ken")
        });

    let config = create_config(
        [
            ("local", ResourceDescriptor::local()),
            ("gpu-box", gpu_box),
            ("cpu-box", ResourceDescriptor::new("10.0.0.7")),
        ],
        4,
        true,
    )
    .unwrap();

    let path = temp_path("cluster-roundtrip");
    config.save(&path).unwrap();
    let loaded = ClusterConfig::load(&path).unwrap();
    fs::remove_file(&path).unwrap();

    assert_eq!(loaded, config);

    let names: Vec<&str> = loaded.workers().map(|(name, _)| name).collect();
    assert_eq!(names, ["local", "gpu-box", "cpu-box"]);
    assert_eq!(loaded.worker("local").unwrap().transport(), Transport::InProcess);
}

#[test]
fn persisted_layout_uses_use_cuda() {
    let config = create_config([("w", ResourceDescriptor::new("box"))], 2, true).unwrap();

    let path = temp_path("cluster-layout");
    config.save(&path).unwrap();
    let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    fs::remove_file(&path).unwrap();

    assert_eq!(json["use_cuda"], true);
    assert_eq!(json["batch_size_multiplier"], 2);
    assert_eq!(json["workers"][0]["name"], "w");
    assert_eq!(json["workers"][0]["hostname"], "box");
    assert_eq!(json["workers"][0]["port"], 50051);
    assert_eq!(json["workers"][0]["transport"], "tcp");
}

#[test]
fn loading_a_missing_file_fails() {
    assert!(ClusterConfig::load(temp_path("does-not-exist")).is_err());
}
