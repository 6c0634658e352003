use std::path::PathBuf;
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

const GRAPH_YAML: &str = r#"
root: corrected
models:
  - name: lofi
    type: simulation
    variables: 2
    interface: { driver: quadratic, centers: [0.0, 0.0] }
    derivatives: { gradients: analytic }
  - name: hifi
    type: simulation
    variables: 2
    interface: { driver: quadratic, centers: [1.0, 2.0], asynchronous: true, completion: reverse }
    derivatives: { gradients: analytic }
  - name: corrected
    type: hierarchical
    members: [lofi, hifi]
    mode: auto_corrected
    correction: { kind: additive, order: 1 }
"#;

const GRAPH_JSON: &str = r#"{
  "root": "rb",
  "models": [
    {"name": "rb", "type": "simulation", "variables": 2,
     "interface": {"driver": "rosenbrock", "asynchronous": true, "completion": "reverse", "nowait_limit": 1},
     "derivatives": {"gradients": "numerical", "interval": "central"}}
  ]
}"#;

fn bin_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_multifi"))
}

fn tmp_path(filename: &str) -> PathBuf {
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
    let mut p = std::env::temp_dir();
    p.push(format!("multifi_cli_{}_{}_{}", std::process::id(), nanos, filename));
    p
}

fn write_tmp(filename: &str, contents: &str) -> PathBuf {
    let p = tmp_path(filename);
    std::fs::write(&p, contents).unwrap();
    p
}

fn run(args: &[&str]) -> Output {
    Command::new(bin_path())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("failed to run {:?} {:?}: {}", bin_path(), args, e))
}

fn stdout_json(out: &Output) -> serde_json::Value {
    assert!(
        out.status.success(),
        "multifi failed, stderr={}",
        String::from_utf8_lossy(&out.stderr)
    );
    serde_json::from_slice(&out.stdout).expect("stdout should be valid JSON")
}

#[test]
fn eval_corrected_ensemble_matches_truth() {
    let config = write_tmp("graph.yaml", GRAPH_YAML);
    let out = run(&["eval", "--config", config.to_str().unwrap(), "--point", "3,-1"]);
    let v = stdout_json(&out);

    assert_eq!(v["model"], "corrected");
    let value = v["response"]["values"]["0"].as_f64().unwrap();
    assert!((value - 6.5).abs() < 1e-12, "corrected value {value}");
    assert!(v["counters"]["hifi"]["new"].as_u64().unwrap() >= 1);
    let _ = std::fs::remove_file(&config);
}

#[test]
fn eval_single_member_with_gradient() {
    let config = write_tmp("graph.yaml", GRAPH_YAML);
    let out = run(&[
        "eval",
        "--config",
        config.to_str().unwrap(),
        "--model",
        "lofi",
        "--point",
        "-1,2",
        "--asv",
        "3",
    ]);
    let v = stdout_json(&out);

    assert_eq!(v["model"], "lofi");
    assert_eq!(v["response"]["values"]["0"].as_f64().unwrap(), 2.5);
    assert_eq!(v["response"]["gradients"]["0"], serde_json::json!([-1.0, 2.0]));
    let _ = std::fs::remove_file(&config);
}

#[test]
fn batch_nowait_returns_every_point() {
    let config = write_tmp("graph.json", GRAPH_JSON);
    let points = write_tmp("points.json", "[[1.0, 1.0], [0.0, 0.0], [-1.0, 1.0]]");
    let out = run(&[
        "batch",
        "--config",
        config.to_str().unwrap(),
        "--points",
        points.to_str().unwrap(),
        "--nowait",
        "--asv",
        "3",
    ]);
    let v = stdout_json(&out);

    let responses = v["responses"].as_object().unwrap();
    assert_eq!(responses.len(), 3);
    assert_eq!(responses["1"]["values"]["0"].as_f64().unwrap(), 0.0);
    assert_eq!(responses["2"]["values"]["0"].as_f64().unwrap(), 1.0);
    assert_eq!(responses["3"]["values"]["0"].as_f64().unwrap(), 4.0);
    let g = responses["1"]["gradients"]["0"].as_array().unwrap();
    assert!(g.iter().all(|x| x.as_f64().unwrap().abs() < 1e-3));
    let _ = std::fs::remove_file(&config);
    let _ = std::fs::remove_file(&points);
}

#[test]
fn unknown_child_is_reported() {
    let config = write_tmp(
        "bad.json",
        r#"{"root": "fit", "models": [{"name": "fit", "type": "data_fit", "actual": "nope"}]}"#,
    );
    let out = run(&["eval", "--config", config.to_str().unwrap(), "--point", "0,0"]);
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("nope"), "stderr={stderr}");
    let _ = std::fs::remove_file(&config);
}
