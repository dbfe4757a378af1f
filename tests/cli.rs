use std::fs;
use std::process::Command;

use tempfile::tempdir;

const PROBLEM: &str = r#"
[options]
quasi_fixed = false

[options.fixed]
tolerance = 1e-8

[model]
data_std = 0.5
groups = [
    [1.9, 2.4, 2.2, 1.7],
    [0.8, 1.1, 0.6, 1.3],
    [3.0, 2.6, 3.3, 2.9],
    [1.5, 1.2, 1.9, 1.4],
    [2.2, 2.0, 2.5, 2.8],
]
"#;

#[test]
fn fit_command_writes_a_converged_report() {
    let tmp = tempdir().expect("temporary directory");
    let problem_path = tmp.path().join("problem.toml");
    fs::write(&problem_path, PROBLEM).expect("write problem");

    let exe = env!("CARGO_BIN_EXE_mixed-laplace");
    let status = Command::new(exe)
        .args(["fit", problem_path.to_str().expect("path str")])
        .status()
        .expect("run mixed-laplace cli");
    assert!(status.success(), "CLI exited with status {status:?}");

    let report = fs::read_to_string(tmp.path().join("fit.toml")).expect("fit.toml missing");
    let report: toml::Value = toml::from_str(&report).expect("parse report");
    assert_eq!(report["status"].as_str(), Some("converged"));
    let fixed = report["fixed"].as_array().expect("fixed array");
    assert_eq!(fixed.len(), 2);
    // Balanced groups: the mean estimate is the grand mean, 1.965.
    let mean = fixed[0].as_float().expect("float");
    assert!((mean - 1.965).abs() < 1e-5, "mean estimate {mean}");
    assert_eq!(report["random"].as_array().expect("random array").len(), 5);
}

#[test]
fn check_command_accepts_correct_derivatives() {
    let tmp = tempdir().expect("temporary directory");
    let problem_path = tmp.path().join("problem.toml");
    fs::write(&problem_path, PROBLEM).expect("write problem");

    let output = Command::new(env!("CARGO_BIN_EXE_mixed-laplace"))
        .args(["check", problem_path.to_str().expect("path str"), "--second-order"])
        .output()
        .expect("run mixed-laplace cli");
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert!(String::from_utf8_lossy(&output.stdout).contains("agree"));
}

#[test]
fn malformed_problem_fails_with_an_error_message() {
    let tmp = tempdir().expect("temporary directory");
    let problem_path = tmp.path().join("problem.toml");
    fs::write(&problem_path, "[model]\ndata_std = -1.0\ngroups = [[1.0]]\n").expect("write problem");

    let output = Command::new(env!("CARGO_BIN_EXE_mixed-laplace"))
        .args(["fit", problem_path.to_str().expect("path str")])
        .output()
        .expect("run mixed-laplace cli");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Error:"));
    assert!(!tmp.path().join("fit.toml").exists());
}
