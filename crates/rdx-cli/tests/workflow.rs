use std::fs;

mod common;

use common::{enrolled_participant, parse_json, rdx, register};

const GPS_ROWS: &str = "timestamp,UTC time,latitude,longitude\n\
1609459200000,2021-01-01T00:00:00.000,1.0,2.0\n\
1609459260000,2021-01-01T00:01:00.000,1.1,2.1\n\
1609459320000,2021-01-01T00:02:00.000,1.2,2.2\n";

#[test]
fn sealed_upload_is_chunked_and_counted() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().join("data");
    let patient_id = enrolled_participant(&root, "sleep");

    let registered = register(&root, &patient_id, "phone-1");
    assert_eq!(registered["status"], "ok");
    assert_eq!(registered["details"]["http_status"], 200);
    assert!(registered["details"]["public_key"].as_str().is_some_and(|key| !key.is_empty()));

    let plain = temp.path().join("plain.csv");
    fs::write(&plain, GPS_ROWS).expect("write plaintext");
    let sealed = temp.path().join("gps_1609459200000.csv");
    rdx(&root)
        .args(["--json", "device", "seal", &patient_id])
        .arg(&plain)
        .arg("-o")
        .arg(&sealed)
        .assert()
        .success();

    let assert = rdx(&root)
        .args(["--json", "upload", &patient_id])
        .arg(&sealed)
        .assert()
        .success();
    let upload = parse_json(&assert);
    assert_eq!(upload["details"]["state"], "ENQUEUED");
    assert_eq!(upload["details"]["http_status"], 200);

    let assert = rdx(&root).args(["--json", "chunk"]).assert().success();
    let pass = parse_json(&assert);
    assert_eq!(pass["message"], "rdx chunk: processed 2 entries (0 skipped, 0 retained)");
    assert_eq!(pass["details"]["summary"]["chunks_created"], 2);

    let assert = rdx(&root)
        .args(["--json", "chunks", "list", "--study", "sleep", "--data-type", "gps"])
        .assert()
        .success();
    let listed = parse_json(&assert);
    assert_eq!(listed["details"]["count"], 1);
    let chunk = &listed["details"]["chunks"][0];
    assert_eq!(chunk["number_of_observations"], 3);
    assert!(chunk["chunk_path"]
        .as_str()
        .is_some_and(|path| path.starts_with("CHUNKED_DATA/") && path.contains("/gps/")));
    assert!(chunk["blob_key"]
        .as_str()
        .is_some_and(|key| key.starts_with("CHUNKED_DATA/") && key != chunk["chunk_path"]));

    let assert = rdx(&root)
        .args(["--json", "stats", "show", "--participant", &patient_id])
        .assert()
        .success();
    let stats = parse_json(&assert);
    let gps = stats["details"]["stats"]
        .as_array()
        .expect("stats rows")
        .iter()
        .find(|row| row["data_type"] == "gps")
        .expect("gps row");
    assert_eq!(gps["number_of_uploads"], 1);
}

#[test]
fn reuploading_the_same_file_leaves_chunks_unchanged() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().join("data");
    let patient_id = enrolled_participant(&root, "sleep");
    register(&root, &patient_id, "phone-1");

    let plain = temp.path().join("plain.csv");
    fs::write(&plain, GPS_ROWS).expect("write plaintext");
    let sealed = temp.path().join("sealed.bin");
    rdx(&root)
        .args(["device", "seal", &patient_id])
        .arg(&plain)
        .arg("-o")
        .arg(&sealed)
        .assert()
        .success();

    for _ in 0..2 {
        rdx(&root)
            .args(["upload", &patient_id, "--file-name", "gps_1609459200000.csv"])
            .arg(&sealed)
            .assert()
            .success();
        rdx(&root).arg("chunk").assert().success();
    }

    let assert = rdx(&root)
        .args(["--json", "chunks", "recount", "--study", "sleep"])
        .assert()
        .success();
    let recount = parse_json(&assert);
    assert_eq!(recount["details"]["summary"]["updated"], 0);
    assert_eq!(recount["details"]["summary"]["missing"], 0);

    let assert = rdx(&root)
        .args(["--json", "chunks", "list", "--study", "sleep", "--data-type", "gps"])
        .assert()
        .success();
    assert_eq!(parse_json(&assert)["details"]["chunks"][0]["number_of_observations"], 3);
}

#[test]
fn lock_status_and_clear() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path();
    let assert = rdx(root).args(["--json", "lock", "status"]).assert().success();
    assert_eq!(parse_json(&assert)["details"]["locked"], false);

    let assert = rdx(root).args(["--json", "lock", "clear"]).assert().success();
    let cleared = parse_json(&assert);
    assert_eq!(cleared["message"], "rdx lock clear: no lock was held");
    assert_eq!(cleared["details"]["removed"], 0);
}
