// External tool resolver for ffmpeg/ffprobe, plus the timeout-bounded
// subprocess runner used for every cut/probe invocation.
//
// Resolution order:
// 1) Environment variable override (PACKCAM_FFMPEG_PATH, PACKCAM_FFPROBE_PATH)
// 2) Sidecar next to the executable
// 3) PATH fallback

use std::env;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};
use std::time::{Duration, Instant};

use crate::error::{PackCamError, Result};

/// Get the directory containing the current executable
fn exe_dir() -> Option<PathBuf> {
    env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.to_path_buf()))
}

/// Resolve a sidecar tool path.
fn resolve_tool(env_key: &str, default_name: &str) -> PathBuf {
    if let Ok(v) = env::var(env_key) {
        let p = PathBuf::from(&v);
        if p.exists() {
            return p;
        }
    }

    let mut filename = default_name.to_string();
    if cfg!(windows) && !filename.to_lowercase().ends_with(".exe") {
        filename.push_str(".exe");
    }

    if let Some(dir) = exe_dir() {
        let candidate = dir.join(&filename);
        if candidate.exists() {
            return candidate;
        }
        let bin_candidate = dir.join("bin").join(&filename);
        if bin_candidate.exists() {
            return bin_candidate;
        }
    }

    PathBuf::from(default_name)
}

/// Get path to ffprobe binary
pub fn ffprobe_path() -> PathBuf {
    resolve_tool("PACKCAM_FFPROBE_PATH", "ffprobe")
}

/// Get path to ffmpeg binary
pub fn ffmpeg_path() -> PathBuf {
    resolve_tool("PACKCAM_FFMPEG_PATH", "ffmpeg")
}

/// Check if a tool is available at the resolved path
pub fn is_tool_available(tool: &str) -> bool {
    let path = match tool {
        "ffprobe" => ffprobe_path(),
        "ffmpeg" => ffmpeg_path(),
        _ => return false,
    };

    if path.exists() {
        return true;
    }

    Command::new(&path)
        .arg("-version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Run a prepared command with a hard timeout, capturing stdout/stderr.
///
/// Polls `try_wait` so the child can be killed on expiry; a timed-out
/// invocation returns `PackCamError::Timeout` and never leaves a zombie.
pub fn run_with_timeout(mut cmd: Command, timeout: Duration) -> Result<Output> {
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd.spawn()?;
    let started = Instant::now();

    loop {
        match child.try_wait()? {
            Some(status) => {
                let mut stdout = Vec::new();
                let mut stderr = Vec::new();
                if let Some(mut out) = child.stdout.take() {
                    out.read_to_end(&mut stdout)?;
                }
                if let Some(mut err) = child.stderr.take() {
                    err.read_to_end(&mut stderr)?;
                }
                return Ok(Output { status, stdout, stderr });
            }
            None => {
                if started.elapsed() >= timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(PackCamError::Timeout(format!(
                        "subprocess exceeded {}s",
                        timeout.as_secs()
                    )));
                }
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_tool_fallback() {
        // Without env var set, should return the default name for PATH lookup
        let path = resolve_tool("PACKCAM_TEST_NONEXISTENT", "testcmd");
        assert_eq!(path, PathBuf::from("testcmd"));
    }

    #[test]
    fn test_env_override() {
        let temp_dir = std::env::temp_dir();
        let temp_file = temp_dir.join("packcam_test_tool");
        std::fs::write(&temp_file, "test").ok();

        std::env::set_var("PACKCAM_TEST_TOOL", temp_file.to_str().unwrap());
        let path = resolve_tool("PACKCAM_TEST_TOOL", "default");
        assert_eq!(path, temp_file);

        std::env::remove_var("PACKCAM_TEST_TOOL");
        std::fs::remove_file(&temp_file).ok();
    }

    #[test]
    #[cfg(unix)]
    fn test_run_with_timeout_expires() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let result = run_with_timeout(cmd, Duration::from_millis(200));
        assert!(matches!(result, Err(PackCamError::Timeout(_))));
    }

    #[test]
    #[cfg(unix)]
    fn test_run_with_timeout_completes() {
        let cmd = Command::new("true");
        let out = run_with_timeout(cmd, Duration::from_secs(5)).unwrap();
        assert!(out.status.success());
    }
}
