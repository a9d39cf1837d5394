//! Exit codes and output of the `clusterflow` binary.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tempfile::TempDir;

fn clusterflow(args: &[&Path]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_clusterflow"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to spawn clusterflow")
}

struct Fixture {
    dir: TempDir,
    image: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let image = dir.path().join("pipeline.sim");
        let out = clusterflow(&[Path::new("--write-sim-image"), image.as_path()]);
        assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
        Self { dir, image }
    }

    fn file(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }
}

fn hex_lines(n: u64) -> String {
    (0..n).map(|i| format!("{:016x}\n", 0xab00_0000_0000_0000 | i)).collect()
}

#[test]
fn test_successful_run_prints_report() {
    let fx = Fixture::new();
    let pixel = fx.file("pixel.txt", &hex_lines(10));
    let strip = fx.file("strip.txt", &hex_lines(5));

    let out = clusterflow(&[fx.image.as_path(), pixel.as_path(), strip.as_path()]);
    let stdout = String::from_utf8_lossy(&out.stdout);

    assert_eq!(out.status.code(), Some(0), "{}", String::from_utf8_lossy(&out.stderr));
    assert!(stdout.contains("Reading done"));
    assert!(stdout.contains("Finalizing F110StreamIntegration standalone host"));
    assert!(stdout.contains("Number of events: 1"));
    for label in [
        "Pixel input ave time:  ",
        "Strip input ave time:  ",
        "Pixel pipeline ave time: ",
        "Strip pipeline ave time: ",
        "Pixel output ave time: ",
        "Strip output ave time: ",
    ] {
        let line = stdout
            .lines()
            .find(|l| l.starts_with(label))
            .unwrap_or_else(|| panic!("missing {label:?} in:\n{stdout}"));
        let value = line[label.len()..].trim().trim_end_matches(" ms");
        assert!(value.parse::<f64>().unwrap() >= 0.0);
    }
}

#[test]
fn test_malformed_input_exits_with_failure() {
    let fx = Fixture::new();
    let pixel = fx.file("pixel.txt", "0000000000000001\nZZZZ\n");
    let strip = fx.file("strip.txt", &hex_lines(1));

    let out = clusterflow(&[fx.image.as_path(), pixel.as_path(), strip.as_path()]);
    let stderr = String::from_utf8_lossy(&out.stderr);

    assert_eq!(out.status.code(), Some(1));
    assert!(stderr.contains("Error:"));
    assert!(stderr.contains("line 2"));
    assert!(stderr.contains("ZZZZ"));
}

#[test]
fn test_missing_image_exits_with_failure() {
    let fx = Fixture::new();
    let pixel = fx.file("pixel.txt", &hex_lines(2));
    let strip = fx.file("strip.txt", &hex_lines(2));
    let missing = fx.dir.path().join("absent.xclbin");

    let out = clusterflow(&[missing.as_path(), pixel.as_path(), strip.as_path()]);

    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stderr).contains("absent.xclbin"));
}

#[test]
fn test_oversized_input_exits_with_failure() {
    let fx = Fixture::new();
    let config = fx.file(
        "small.toml",
        "[layout]\nmax_input_clusters = 1\ninput_padding_words = 0\n",
    );
    // Strip takes two words per cluster.
    let pixel = fx.file("pixel.txt", &hex_lines(1));
    let strip = fx.file("strip.txt", &hex_lines(3));

    let out = clusterflow(&[
        Path::new("--config"),
        config.as_path(),
        fx.image.as_path(),
        pixel.as_path(),
        strip.as_path(),
    ]);

    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stderr).contains("exceeds lane capacity"));
}

#[test]
fn test_usage_error_exits_with_failure() {
    let out = clusterflow(&[Path::new("only-an-image.xclbin")]);
    assert_eq!(out.status.code(), Some(1));
}
