use assert_cmd::cargo_bin;
use std::process::Command;

mod common;

#[test]
fn test_large_script_streaming() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("large_script.csv");
    common::generate_script(&path, 5_000).expect("Failed to generate script");

    let output = Command::new(cargo_bin!("payrecon"))
        .arg(&path)
        .env("RUST_LOG", "payrecon=error")
        .output()
        .expect("Failed to execute command");
    assert!(output.status.success(), "Binary failed to replay large script");

    let stdout = String::from_utf8_lossy(&output.stdout);
    // Header plus one row per order.
    assert_eq!(stdout.lines().count(), 5_001);
    assert!(stdout.contains("ORD-5000,cash_on_delivery,completed,100,0,BDT"));
}
