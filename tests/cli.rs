//! Exercises the `teletext2srt` binary itself (not just the library), since
//! the "no frames produced" diagnostic lives in the binary's `run()` and is
//! otherwise untestable through the public library API.

use std::fs;
use std::process::Command;

#[test]
fn warns_when_no_frames_produced_without_dummy_flag() {
    let pid = std::process::id();
    let input_path = std::env::temp_dir().join(format!("teletext_srt_cli_test_{}.ts", pid));
    let output_path = std::env::temp_dir().join(format!("teletext_srt_cli_test_{}.srt", pid));
    fs::write(&input_path, Vec::<u8>::new()).unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_teletext2srt"))
        .arg("-i")
        .arg(&input_path)
        .arg("-o")
        .arg(&output_path)
        .output()
        .expect("failed to run teletext2srt binary");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("No frames produced."),
        "expected \"No frames produced.\" in stderr, got: {}",
        stderr
    );
    assert_eq!(fs::read_to_string(&output_path).unwrap(), "");

    let _ = fs::remove_file(&input_path);
    let _ = fs::remove_file(&output_path);
}

#[test]
fn dummy_flag_suppresses_the_warning() {
    let pid = std::process::id();
    let input_path = std::env::temp_dir().join(format!("teletext_srt_cli_dummy_test_{}.ts", pid));
    let output_path = std::env::temp_dir().join(format!("teletext_srt_cli_dummy_test_{}.srt", pid));
    fs::write(&input_path, Vec::<u8>::new()).unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_teletext2srt"))
        .arg("-i")
        .arg(&input_path)
        .arg("-o")
        .arg(&output_path)
        .arg("-1")
        .output()
        .expect("failed to run teletext2srt binary");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!stderr.contains("No frames produced."), "stderr was: {}", stderr);

    let _ = fs::remove_file(&input_path);
    let _ = fs::remove_file(&output_path);
}
