use anyhow::{anyhow, Result};
use log::debug;
use std::{
    fs,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

#[derive(Debug, Clone)]
pub struct Output {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl Output {
    pub fn success(&self) -> bool {
        !self.timed_out && self.code == 0
    }

    /// stdout and stderr joined for error messages.
    pub fn combined(&self) -> String {
        let mut s = self.stdout.trim_end().to_string();
        let err = self.stderr.trim_end();
        if !err.is_empty() {
            if !s.is_empty() {
                s.push('\n');
            }
            s.push_str(err);
        }
        s
    }
}

fn unique_tmp_prefix(cmd: &str) -> String {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_nanos();
    let pid = std::process::id();
    let safe: String = cmd
        .rsplit('/')
        .next()
        .unwrap_or(cmd)
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("xrayctl_{safe}_{pid}_{ts}")
}

fn slurp_and_remove(p: &Path) -> String {
    let s = fs::read(p).map(|b| String::from_utf8_lossy(&b).into_owned()).unwrap_or_default();
    let _ = fs::remove_file(p);
    s
}

/// Run a command with a timeout.
///
/// stdout/stderr go through temp files so a chatty child can't block on a full pipe.
/// On timeout the child is killed and `timed_out` is set.
pub fn run_timeout(cmd: &Path, args: &[&str], timeout: Duration) -> Result<Output> {
    debug!("exec(timeout={:?}): {} {}", timeout, cmd.display(), args.join(" "));

    let tmp_dir = std::env::temp_dir();
    let prefix = unique_tmp_prefix(&cmd.to_string_lossy());
    let out_path: PathBuf = tmp_dir.join(format!("{prefix}.out"));
    let err_path: PathBuf = tmp_dir.join(format!("{prefix}.err"));

    let fo = fs::File::create(&out_path)
        .map_err(|e| anyhow!("failed to create stdout temp file {out_path:?}: {e}"))?;
    let fe = fs::File::create(&err_path)
        .map_err(|e| anyhow!("failed to create stderr temp file {err_path:?}: {e}"))?;

    let mut child = Command::new(cmd)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(fo))
        .stderr(Stdio::from(fe))
        .spawn()
        .map_err(|e| {
            let _ = fs::remove_file(&out_path);
            let _ = fs::remove_file(&err_path);
            anyhow!("failed to spawn {}: {e}", cmd.display())
        })?;
    let start = Instant::now();

    loop {
        if let Some(st) = child
            .try_wait()
            .map_err(|e| anyhow!("failed to wait {}: {e}", cmd.display()))?
        {
            let code = st.code().unwrap_or(-1);
            let out = Output {
                code,
                stdout: slurp_and_remove(&out_path),
                stderr: slurp_and_remove(&err_path),
                timed_out: false,
            };
            debug!("exit={code} stdout_len={} stderr_len={}", out.stdout.len(), out.stderr.len());
            return Ok(out);
        }

        if start.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(Output {
                code: -1,
                stdout: slurp_and_remove(&out_path),
                stderr: slurp_and_remove(&err_path),
                timed_out: true,
            });
        }

        thread::sleep(Duration::from_millis(20));
    }
}

/// Run a full shell line via `sh -c <line>` and require exit code 0.
pub fn ok_sh_timeout(line: &str, timeout: Duration) -> Result<String> {
    let out = run_timeout(Path::new("sh"), &["-c", line], timeout)?;
    if out.success() {
        return Ok(out.stdout);
    }
    if out.timed_out {
        return Err(anyhow!("command timeout after {:?}: {line}", timeout));
    }
    Err(anyhow!("command failed ({}): {line} | out={}", out.code, out.combined()))
}
