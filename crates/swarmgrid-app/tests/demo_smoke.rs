use std::process::Command;

#[test]
fn demo_runs_headless() {
    let bin = env!("CARGO_BIN_EXE_swarmgrid-app");
    let status = Command::new(bin)
        .args(["--agents", "400", "--ticks", "30", "--broad-phase", "half-shell"])
        .env("RUST_LOG", "off")
        .status()
        .expect("failed to run swarmgrid-app binary");
    assert!(status.success(), "demo run failed");
}

#[test]
fn demo_reads_json_config() {
    let dir = std::env::temp_dir().join(format!("swarmgrid-smoke-{}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("temp dir");
    let path = dir.join("config.json");
    std::fs::write(
        &path,
        r#"{ "cells_across": 96, "resolve": "Accumulate", "impulse": "MomentumConserving" }"#,
    )
    .expect("write config");

    let bin = env!("CARGO_BIN_EXE_swarmgrid-app");
    let status = Command::new(bin)
        .args(["--agents", "200", "--ticks", "10", "--report-every", "5"])
        .arg("--config")
        .arg(&path)
        .env("RUST_LOG", "off")
        .status()
        .expect("failed to run swarmgrid-app binary");
    let _ = std::fs::remove_dir_all(&dir);
    assert!(status.success(), "demo run with config failed");
}

#[test]
fn demo_rejects_invalid_config() {
    let bin = env!("CARGO_BIN_EXE_swarmgrid-app");
    let status = Command::new(bin)
        .args(["--config", "/nonexistent/swarmgrid.json", "--ticks", "1"])
        .env("RUST_LOG", "off")
        .status()
        .expect("failed to run swarmgrid-app binary");
    assert!(!status.success());
}
