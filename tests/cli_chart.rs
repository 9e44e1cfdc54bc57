use std::fs;
use std::process::Command;

use tempfile::tempdir;

const CONFIG: &str = "control_limit = 100.0\n\
\n\
[baseline]\n\
kind = \"constant\"\n\
rate = 0.1\n\
\n\
[risk.coefficients]\n\
age = 0.02\n\
\n\
[risk.centre]\n\
age = 60.0\n";

#[test]
fn chart_cli_writes_trace() {
    let tmp = tempdir().expect("temporary directory");
    let subjects_path = tmp.path().join("subjects.tsv");
    let config_path = tmp.path().join("chart.toml");
    let out_path = tmp.path().join("trace.tsv");

    let data = "entrytime\totime\tcensorid\tage\n\
0\t5\t1\t70\n\
1\t4\t0\t55\n\
2\t3\t1\t62\n\
4\t9\t1\t58\n";
    fs::write(&subjects_path, data).expect("write subjects");
    fs::write(&config_path, CONFIG).expect("write config");

    let status = Command::new(env!("CARGO_BIN_EXE_riskwatch"))
        .current_dir(tmp.path())
        .args([
            "chart",
            subjects_path.to_str().expect("path str"),
            "--config",
            config_path.to_str().expect("path str"),
            "--out",
            out_path.to_str().expect("path str"),
        ])
        .status()
        .expect("run riskwatch cli");

    assert!(status.success(), "CLI exited with status {status:?}");
    let written = fs::read_to_string(&out_path).expect("trace written");
    let mut lines = written.lines();
    assert_eq!(lines.next(), Some("time\tvalue\tmultiplier\tstart_time"));
    assert!(lines.count() >= 5);
}

#[test]
fn limit_cli_prints_calibrated_limit() {
    let tmp = tempdir().expect("temporary directory");
    let units_path = tmp.path().join("units.tsv");
    let config_path = tmp.path().join("chart.toml");

    let data = "unit\tentrytime\totime\tcensorid\tage\n\
a\t0\t5\t1\t70\n\
a\t1\t4\t0\t55\n\
b\t0\t8\t0\t60\n\
b\t2\t3\t1\t62\n\
c\t1\t2\t1\t65\n\
c\t3\t9\t1\t58\n";
    fs::write(&units_path, data).expect("write units");
    fs::write(&config_path, CONFIG).expect("write config");

    let output = Command::new(env!("CARGO_BIN_EXE_riskwatch"))
        .current_dir(tmp.path())
        .args([
            "limit",
            units_path.to_str().expect("path str"),
            "--config",
            config_path.to_str().expect("path str"),
            "--time",
            "10",
            "--alpha",
            "0.5",
        ])
        .output()
        .expect("run riskwatch cli");

    assert!(output.status.success(), "CLI exited with status {:?}", output.status);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let h: f64 = stdout
        .trim()
        .strip_prefix("h\t")
        .expect("limit line")
        .parse()
        .expect("numeric limit");
    assert!(h >= 0.0);
}

#[test]
fn init_config_cli_writes_loadable_defaults() {
    let tmp = tempdir().expect("temporary directory");
    let status = Command::new(env!("CARGO_BIN_EXE_riskwatch"))
        .current_dir(tmp.path())
        .arg("init-config")
        .status()
        .expect("run riskwatch cli");

    assert!(status.success(), "CLI exited with status {status:?}");
    let path = tmp.path().join("chart.toml");
    let config = riskwatch::config::ChartConfig::load(path.to_str().expect("path str"))
        .expect("defaults load back");
    assert_eq!(config, riskwatch::config::ChartConfig::default());
}

#[test]
fn chart_cli_rejects_files_with_several_units() {
    let tmp = tempdir().expect("temporary directory");
    let subjects_path = tmp.path().join("units.tsv");
    let config_path = tmp.path().join("chart.toml");

    let data = "unit\tentrytime\totime\tcensorid\tage\n\
a\t0\t5\t1\t70\n\
b\t0\t8\t0\t60\n";
    fs::write(&subjects_path, data).expect("write subjects");
    fs::write(&config_path, CONFIG).expect("write config");

    let output = Command::new(env!("CARGO_BIN_EXE_riskwatch"))
        .current_dir(tmp.path())
        .args([
            "chart",
            subjects_path.to_str().expect("path str"),
            "--config",
            config_path.to_str().expect("path str"),
        ])
        .output()
        .expect("run riskwatch cli");

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Error: The input file holds 2 units"), "stderr: {stderr}");
}
