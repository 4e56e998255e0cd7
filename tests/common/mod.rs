use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};

pub struct CmdResult {
    pub args: Vec<String>,
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CmdResult {
    /// Everything the command printed, for assertion messages.
    pub fn transcript(&self) -> String {
        format!(
            "args={:?} status={}\n----- stdout -----\n{}\n----- stderr -----\n{}",
            self.args, self.status, self.stdout, self.stderr
        )
    }
}

fn resolve_bin_path() -> PathBuf {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_slg") {
        return PathBuf::from(path);
    }

    let exe_name = if cfg!(windows) { "slg.exe" } else { "slg" };
    let fallback = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .and_then(|deps| deps.parent().map(PathBuf::from))
        .map(|debug_dir| debug_dir.join(exe_name));

    match fallback {
        Some(path) if path.exists() => path,
        _ => panic!("unable to resolve slg binary path for integration test"),
    }
}

/// Run the binary with `home` as `$HOME`, so no user config leaks in.
pub fn run_cli(home: &Path, args: &[&str]) -> CmdResult {
    let output = Command::new(resolve_bin_path())
        .args(args)
        .env("HOME", home)
        .env_remove("SLG_OUTPUT_FORMAT")
        .env("RUST_BACKTRACE", "1")
        .output()
        .expect("execute slg command");

    CmdResult {
        args: args.iter().map(|arg| (*arg).to_string()).collect(),
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    }
}
