//! Runs the `imgconv` binary against files in a temp directory.

use imgconv_engine::codec::{Codec, ImageCodec};
use imgconv_engine::Format;
use std::process::Command;

fn imgconv() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_imgconv"));
    command.env("RUST_LOG", "warn");
    command
}

#[test]
fn test_converts_png_to_jpeg_by_extension() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.png");
    let output = dir.path().join("out.jpg");
    let png = ImageCodec::new()
        .encode(&image::RgbaImage::from_pixel(24, 12, image::Rgba([9, 9, 9, 255])), Format::Png, 90)
        .unwrap();
    std::fs::write(&input, png).unwrap();

    let run = imgconv()
        .arg(&input)
        .arg(&output)
        .args(["--width", "12", "--quality", "70"])
        .output()
        .unwrap();

    assert!(run.status.success(), "stderr: {}", String::from_utf8_lossy(&run.stderr));
    let written = std::fs::read(&output).unwrap();
    assert_eq!(Format::sniff(&written), Some(Format::Jpeg));

    let summary: serde_json::Value = serde_json::from_slice(&run.stdout).unwrap();
    assert_eq!(summary["metadata"]["width"], 12);
    assert_eq!(summary["metadata"]["height"], 6);
    assert_eq!(summary["route"], serde_json::json!(["png", "jpeg"]));
}

#[test]
fn test_invalid_quality_fails_without_output() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.svg");
    let output = dir.path().join("out.png");
    std::fs::write(
        &input,
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="4" height="4"/>"#,
    )
    .unwrap();

    let run = imgconv()
        .arg(&input)
        .arg(&output)
        .args(["--quality", "5"])
        .output()
        .unwrap();

    assert!(!run.status.success());
    assert!(String::from_utf8_lossy(&run.stderr).contains("INVALID_OPTIONS"));
    assert!(!output.exists());
}

#[test]
fn test_json_log_format() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.svg");
    let output = dir.path().join("out.png");
    std::fs::write(
        &input,
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="4" height="4"/>"#,
    )
    .unwrap();

    let run = imgconv()
        .env("RUST_LOG", "info")
        .env("IMGCONV_LOG_FORMAT", "json")
        .arg(&input)
        .arg(&output)
        .output()
        .unwrap();

    assert!(run.status.success(), "stderr: {}", String::from_utf8_lossy(&run.stderr));
    let stderr = String::from_utf8(run.stderr).unwrap();
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.is_empty()).collect();
    assert!(!lines.is_empty());
    for line in lines {
        let entry: serde_json::Value = serde_json::from_str(line).unwrap();
        assert!(entry.get("level").is_some(), "{}", line);
    }
}
