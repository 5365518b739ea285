use assert_cmd::Command;
use predicates::prelude::*;

const ENV_KEYS: [&str; 12] = [
    "ATTNBENCH_BATCH",
    "ATTNBENCH_HEADS",
    "ATTNBENCH_HEAD_DIM",
    "ATTNBENCH_SEQ_LENS",
    "ATTNBENCH_SEED",
    "ATTNBENCH_WARMUP",
    "ATTNBENCH_RUNS",
    "ATTNBENCH_DEVICE",
    "ATTNBENCH_PRECISIONS",
    "ATTNBENCH_CAUSAL",
    "ATTNBENCH_BACKENDS",
    "ATTNBENCH_LOG_FILE",
];

/// The binary with a clean environment and no GPU.
fn attnbench() -> Command {
    let mut cmd = Command::cargo_bin("attnbench").unwrap();
    for key in ENV_KEYS {
        cmd.env_remove(key);
    }
    cmd.env("ATTNBENCH_GPU_FAKE", "none")
        .env_remove("ATTNBENCH_STRICT_MODE")
        .env_remove("RUST_LOG");
    cmd
}

const TINY: [&str; 14] = [
    "--device", "cpu", "--batch", "1", "--heads", "2", "--head-dim", "8", "--seq-lens", "16",
    "--warmup", "0", "--runs", "1",
];

#[test]
fn help_works() {
    attnbench().arg("--help").assert().success();
}

#[test]
fn version_works() {
    attnbench().arg("--version").assert().success();
}

#[test]
fn help_mentions_core_subcommands() {
    let out = attnbench().arg("--help").assert().success().get_output().stdout.clone();
    let s = String::from_utf8(out).unwrap();
    for needle in ["precision", "throughput", "info", "--config", "--device"] {
        assert!(s.contains(needle), "help missing `{needle}`");
    }
}

#[test]
fn invalid_command_fails() {
    attnbench().arg("nonexistent-command").assert().failure();
}

#[test]
fn config_shows_throughput_defaults() {
    attnbench()
        .args(["config", "--throughput"])
        .assert()
        .success()
        .stdout(predicate::str::contains("seq_lens = [").and(predicate::str::contains("1024")))
        .stdout(predicate::str::contains("runs = 100"));
}

#[test]
fn precision_sweep_on_cpu() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("bench_results.txt");
    let out = attnbench()
        .arg("precision")
        .args(TINY)
        .arg("--log-file")
        .arg(&log)
        .assert()
        .success()
        .stdout(predicate::str::starts_with("--- Attention Speed Benchmark ---"))
        .stdout(predicate::str::contains("--- Summary (ms/iter) ---"))
        .stdout(predicate::str::contains("float8_e5m2"))
        .get_output()
        .stdout
        .clone();
    // Everything printed is mirrored to the log file.
    assert_eq!(std::fs::read_to_string(&log).unwrap(), String::from_utf8(out).unwrap());
}

#[test]
fn throughput_sweep_writes_json() {
    let dir = tempfile::tempdir().unwrap();
    let json = dir.path().join("results.json");
    attnbench()
        .arg("throughput")
        .args(TINY)
        .args(["--backends", "sdpa,mem_efficient"])
        .arg("--json")
        .arg(&json)
        .assert()
        .success()
        .stdout(predicate::str::contains("SDPA (TFLOPS)"))
        .stdout(predicate::str::contains("MemEfficient (TFLOPS)"));
    let value: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&json).unwrap()).unwrap();
    assert_eq!(value["mode"], "throughput");
    // 2 causal modes x 1 precision x 2 backends.
    assert_eq!(value["cells"].as_array().unwrap().len(), 4);
}

#[test]
fn missing_cuda_is_reported_and_exits_zero() {
    attnbench()
        .arg("precision")
        .args(["--device", "cuda", "--seq-lens", "16"])
        .assert()
        .success()
        .stdout(predicate::str::contains("ERROR:"))
        .stdout(predicate::str::contains("Summary").not());
}

#[test]
fn invalid_configuration_is_reported_and_exits_zero() {
    attnbench()
        .arg("precision")
        .args(["--runs", "0"])
        .assert()
        .success()
        .stderr(predicate::str::contains("invalid configuration"));
}

#[test]
fn info_lists_backends() {
    attnbench()
        .arg("info")
        .assert()
        .success()
        .stdout(predicate::str::contains("sdpa"))
        .stdout(predicate::str::contains("GPU not available"));
}
