use std::{
    fs,
    path::{Path, PathBuf},
    process::{Command, Output},
};

use netcanvas_core::description::{GraphDescription, NodeDescription};

fn netcanvas(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_netcanvas"))
        .args(args)
        .output()
        .unwrap()
}

fn write(dir: &Path, name: &str, desc: &GraphDescription) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, desc.to_json().unwrap()).unwrap();
    path
}

fn mlp(prefix: &str, out_features: usize, x_offset: f64) -> GraphDescription {
    let id = |s: &str| format!("{prefix}{s}");
    GraphDescription::new("mlp")
        .with_node(NodeDescription::new(id("in"), "Input").at(x_offset, 0.0))
        .with_node(NodeDescription::new(id("flat"), "Flatten").at(x_offset + 100.0, 0.0))
        .with_node(
            NodeDescription::new(id("fc"), "Linear")
                .with_param("in_features", 784)
                .with_param("out_features", out_features)
                .at(x_offset + 200.0, 0.0),
        )
        .with_node(NodeDescription::new(id("out"), "Output").at(x_offset + 300.0, 0.0))
        .with_edge(id("in"), id("flat"), "in")
        .with_edge(id("flat"), id("fc"), "in")
        .with_edge(id("fc"), id("out"), "in")
}

#[test]
fn validate_prints_report() {
    let dir = tempfile::tempdir().unwrap();
    let path = write(dir.path(), "mlp.json", &mlp("", 128, 0.0));

    let output = netcanvas(&[
        "validate",
        path.to_str().unwrap(),
        "--input-shape",
        "in=B,1,28,28",
    ]);
    assert!(output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["valid"], true);
    assert_eq!(report["total_params"], 100480);
    assert_eq!(report["shapes"]["fc"], serde_json::json!([null, 128]));
}

#[test]
fn validate_fails_on_invalid_graph() {
    let dir = tempfile::tempdir().unwrap();
    let path = write(dir.path(), "mlp.json", &mlp("", 128, 0.0));

    let output = netcanvas(&[
        "validate",
        path.to_str().unwrap(),
        "--input-shape",
        "in=B,3,28,28",
    ]);
    assert_eq!(output.status.code(), Some(1));
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["valid"], false);
    assert_eq!(report["errors"][0]["kind"], "shape_error");
    assert_eq!(report["errors"][0]["node_id"], "fc");
}

#[test]
fn compare_exit_status() {
    let dir = tempfile::tempdir().unwrap();
    let reference = write(dir.path(), "reference.json", &mlp("a", 128, 0.0));
    let same = write(dir.path(), "same.json", &mlp("b", 64, 40.0));
    let mut broken = mlp("c", 128, 0.0);
    broken.edges.pop();
    let broken = write(dir.path(), "broken.json", &broken);

    let output = netcanvas(&["compare", reference.to_str().unwrap(), same.to_str().unwrap()]);
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "true");

    let output = netcanvas(&[
        "compare",
        reference.to_str().unwrap(),
        broken.to_str().unwrap(),
        "--topological",
    ]);
    assert_eq!(output.status.code(), Some(1));
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "false");
}

#[test]
fn grade_many() {
    let dir = tempfile::tempdir().unwrap();
    let reference = write(dir.path(), "reference.json", &mlp("", 128, 0.0));
    let submissions = (0..8)
        .map(|i| {
            let mut desc = mlp(&format!("s{i}-"), 128, i as f64);
            if i % 2 == 1 {
                desc.nodes[1].ty = "ReLU".into();
            }
            write(dir.path(), &format!("s{i}.json"), &desc)
        })
        .collect::<Vec<_>>();

    let mut args = vec!["grade", reference.to_str().unwrap()];
    args.extend(submissions.iter().map(|p| p.to_str().unwrap()));
    let output = netcanvas(&args);
    assert!(output.status.success());

    let grades: serde_json::Map<String, serde_json::Value> =
        serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(grades.len(), 8);
    for (i, path) in submissions.iter().enumerate() {
        assert_eq!(grades[path.to_str().unwrap()], i % 2 == 0);
    }
}

#[test]
fn grade_survives_bad_submissions() {
    let dir = tempfile::tempdir().unwrap();
    let reference = write(dir.path(), "reference.json", &mlp("", 128, 0.0));
    let good = write(dir.path(), "good.json", &mlp("g-", 128, 10.0));
    let malformed = dir.path().join("malformed.json");
    fs::write(&malformed, "{ not json").unwrap();
    let missing = dir.path().join("missing.json");

    let output = netcanvas(&[
        "grade",
        reference.to_str().unwrap(),
        good.to_str().unwrap(),
        malformed.to_str().unwrap(),
        missing.to_str().unwrap(),
    ]);
    assert!(output.status.success());

    let grades: serde_json::Map<String, serde_json::Value> =
        serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(grades.len(), 3);
    assert_eq!(grades[good.to_str().unwrap()], true);
    assert_eq!(grades[malformed.to_str().unwrap()], false);
    assert_eq!(grades[missing.to_str().unwrap()], false);

    // The reference itself still has to load.
    let output = netcanvas(&["grade", missing.to_str().unwrap(), good.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn missing_file_is_an_error() {
    let output = netcanvas(&["validate", "/nonexistent/graph.json"]);
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Failed to load"));
}
