#![allow(dead_code)]

use std::path::Path;

use assert_cmd::{assert::Assert, cargo::cargo_bin_cmd, Command};
use serde_json::Value;

/// `rdx` against `root`, with small keys and no retry delay.
pub fn rdx(root: &Path) -> Command {
    let mut cmd = cargo_bin_cmd!("rdx");
    cmd.env_remove("RDX_ROOT")
        .env("RDX_KEY_BITS", "1024")
        .env("RDX_RETRY_DELAY_MS", "0")
        .env("NO_COLOR", "1")
        .arg("--root")
        .arg(root);
    cmd
}

pub fn parse_json(assert: &Assert) -> Value {
    serde_json::from_slice(&assert.get_output().stdout).expect("valid json")
}

/// Creates a study and one participant; returns the participant id.
pub fn enrolled_participant(root: &Path, study: &str) -> String {
    rdx(root).args(["--json", "study", "create", study]).assert().success();
    let assert = rdx(root)
        .args(["--json", "participant", "create", "--study", study])
        .assert()
        .success();
    parse_json(&assert)["details"]["participant"]["patient_id"]
        .as_str()
        .expect("patient id")
        .to_string()
}

pub fn register(root: &Path, patient_id: &str, device_id: &str) -> Value {
    let assert = rdx(root)
        .args(["--json", "participant", "register", patient_id, "--device-id", device_id])
        .assert()
        .success();
    parse_json(&assert)
}
