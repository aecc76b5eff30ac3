use super::*;

fn write_file(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create parent directory");
    }
    std::fs::write(path, contents.as_bytes()).expect("write file");
}

#[test]
fn defaults_match_batch_script_constants() {
    let config = BatchConfig::default();
    assert_eq!(config.simulator.port, 2000);
    assert_eq!(config.simulator.kill_pattern, "CarlaUE4-Linux-");
    assert_eq!(config.session.ego_role_name, "ego_vehicle");
    assert_eq!(config.detectors.stuck_distance, 0.1);
    assert_eq!(config.detectors.stuck_secs, 2.0);
    assert_eq!(config.detectors.fallen_z, 0.0);
    assert_eq!(config.detectors.max_duration_secs, 180.0);
    assert!((config.session.fixed_delta_seconds() - 0.01).abs() < 1e-12);
    validate_config(&config).expect("defaults validate");
}

#[test]
fn partial_config_file_keeps_other_defaults() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("config.json");
    write_file(
        &path,
        r#"{ "simulator": { "port": 3000 }, "session": { "clock": "simulated" } }"#,
    );
    let config = load_config(Some(&path)).expect("load config");
    assert_eq!(config.simulator.port, 3000);
    assert_eq!(config.simulator.host, "localhost");
    assert_eq!(config.session.clock, ClockSource::Simulated);
    assert_eq!(config.session.fps, 100.0);
}

#[test]
fn unknown_keys_are_rejected() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("config.json");
    write_file(&path, r#"{ "simulator": { "prot": 3000 } }"#);
    let err = load_config(Some(&path)).expect_err("typo must fail");
    assert!(format!("{err:#}").contains("parse config"));
}

#[test]
fn validate_rejects_zero_fps() {
    let mut config = BatchConfig::default();
    config.session.fps = 0.0;
    assert!(validate_config(&config).is_err());
}

#[test]
fn validate_rejects_negative_thresholds() {
    let mut config = BatchConfig::default();
    config.detectors.stuck_secs = -1.0;
    assert!(validate_config(&config).is_err());
}

#[test]
fn secs_clamps_negative_and_nan() {
    assert_eq!(secs(-3.0), Duration::ZERO);
    assert_eq!(secs(f64::NAN), Duration::ZERO);
    assert_eq!(secs(1.5), Duration::from_millis(1500));
}

#[test]
fn secs_saturates_out_of_range_values() {
    assert_eq!(secs(1e20), Duration::MAX);
    assert_eq!(secs(f64::INFINITY), Duration::MAX);
}

#[test]
fn validate_rejects_oversized_durations() {
    let mut config = BatchConfig::default();
    config.simulator.timeout_secs = 1e20;
    assert!(validate_config(&config).is_err());
    assert_eq!(config.simulator.timeout(), Duration::MAX);

    let mut config = BatchConfig::default();
    config.inter_scenario_delay_secs = 1e20;
    assert!(validate_config(&config).is_err());

    let mut config = BatchConfig::default();
    config.interpreter.init_wait_secs = f64::INFINITY;
    assert!(validate_config(&config).is_err());

    let mut config = BatchConfig::default();
    config.session.fps = 1e-20;
    let err = validate_config(&config).expect_err("tick length out of range");
    assert!(err.to_string().contains("fps"), "{err}");
}

#[test]
fn validate_rejects_zero_request_timeout() {
    let mut config = BatchConfig::default();
    config.simulator.timeout_secs = 0.0;
    let err = validate_config(&config).expect_err("zero timeout");
    assert!(err.to_string().contains("simulator.timeout_secs"), "{err}");
}

#[test]
fn endpoint_displays_host_and_port() {
    let endpoint = SimulatorConfig::default().endpoint();
    assert_eq!(endpoint.to_string(), "localhost:2000");
}
