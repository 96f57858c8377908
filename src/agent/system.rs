/*
 * Copyright 2026 Oxide Computer Company
 */

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use crate::common::*;

/*
 * Commands run with a scrubbed environment; this is all they get.
 */
const SAFE_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/**
 * A command to run on the device.
 */
#[derive(Debug, Clone)]
pub struct Exec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl Exec {
    pub fn new(program: &str) -> Exec {
        Exec {
            program: program.to_string(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg<S: AsRef<str>>(mut self, arg: S) -> Exec {
        self.args.push(arg.as_ref().to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Exec
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.args.extend(args.into_iter().map(|a| a.as_ref().to_string()));
        self
    }

    pub fn path_arg<P: AsRef<Path>>(self, p: P) -> Exec {
        let s = p.as_ref().to_string_lossy().to_string();
        self.arg(s)
    }

    pub fn env(mut self, key: &str, val: &str) -> Exec {
        self.env.push((key.to_string(), val.to_string()));
        self
    }

}

impl std::fmt::Display for Exec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for a in &self.args {
            write!(f, " {}", a)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.code == Some(0)
    }

    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }
}

impl OutputExt for ExecOutput {
    fn info(&self) -> String {
        let out = render_output(self.code, &self.stdout, &self.stderr);
        if self.timed_out {
            if out.is_empty() {
                "timed out".to_string()
            } else {
                format!("timed out: {}", out)
            }
        } else {
            out
        }
    }
}

/**
 * The host the agent is provisioning.  Everything the agent does to the world
 * outside of the files it manages goes through here.
 */
pub trait System {
    fn exec(&self, log: &Logger, cmd: &Exec) -> Result<ExecOutput>;

    fn has_command(&self, name: &str) -> bool;

    /**
     * Run a command which must succeed.
     */
    fn check(&self, log: &Logger, cmd: &Exec) -> Result<ExecOutput> {
        let out = self.exec(log, cmd)?;
        if !out.success() {
            bail!("{} failed: {}", cmd, out.info());
        }
        Ok(out)
    }
}

/**
 * The real system.  Every command is bounded by a timeout; there is no one
 * around to notice a hung package manager, so we must.
 */
pub struct HostSystem {
    timeout: Duration,
}

impl HostSystem {
    pub fn new(timeout: Duration) -> HostSystem {
        HostSystem { timeout }
    }
}

/*
 * Once the command itself has gone, its output is only waited for this much
 * longer.  Something it left running in the background may hold the pipes
 * open indefinitely.
 */
const DRAIN_GRACE: Duration = Duration::from_secs(5);

const KILL: &str = "/bin/kill";

/*
 * Collects a pipe into a shared buffer, so whatever arrived is still
 * available if we give up on reaching the end.
 */
struct Drain {
    buf: Arc<Mutex<Vec<u8>>>,
    done: mpsc::Receiver<()>,
}

impl Drain {
    fn start<R: Read + Send + 'static>(r: Option<R>) -> Drain {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let (tx, done) = mpsc::channel();
        let b = Arc::clone(&buf);
        std::thread::spawn(move || {
            if let Some(mut r) = r {
                let mut chunk = [0u8; 8192];
                loop {
                    match r.read(&mut chunk) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => match b.lock() {
                            Ok(mut v) => v.extend_from_slice(&chunk[..n]),
                            Err(_) => break,
                        },
                    }
                }
            }
            let _ = tx.send(());
        });
        Drain { buf, done }
    }

    /**
     * Wait for end-of-file until the deadline, then take what we have.
     * Returns the bytes and whether the pipe was still open.
     */
    fn finish(self, deadline: Instant) -> Result<(Vec<u8>, bool)> {
        let wait = deadline.saturating_duration_since(Instant::now());
        let open = match self.done.recv_timeout(wait) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => false,
            Err(mpsc::RecvTimeoutError::Timeout) => true,
        };
        let v = self.buf.lock().map_err(|_| anyhow!("output reader panicked"))?;
        Ok((v.clone(), open))
    }
}

/*
 * Kill every process in the group the command leads.  This takes in anything
 * it started that has not put itself somewhere else.
 */
fn kill_group(log: &Logger, pgid: u32) {
    let group = format!("-{}", pgid);
    match Command::new(KILL).env_clear().args(["-KILL", "--", group.as_str()]).output() {
        Ok(o) if o.status.success() => (),
        Ok(o) => warn!(log, "kill process group {} failure: {}", pgid, o.info()),
        Err(e) => warn!(log, "could not run kill: {}", e),
    }
}

impl System for HostSystem {
    fn exec(&self, log: &Logger, cmd: &Exec) -> Result<ExecOutput> {
        use std::os::unix::process::CommandExt;

        info!(log, "exec: {}", cmd);

        let mut c = Command::new(&cmd.program);
        c.env_clear()
            .env("PATH", SAFE_PATH)
            .env("HOME", "/root")
            .env("LANG", "C")
            .env("DEBIAN_FRONTEND", "noninteractive")
            .args(&cmd.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        for (k, v) in &cmd.env {
            c.env(k, v);
        }

        let mut child =
            c.spawn().with_context(|| format!("could not run {}", cmd.program))?;
        let out = Drain::start(child.stdout.take());
        let err = Drain::start(child.stderr.take());

        let start = Instant::now();
        let mut timed_out = false;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if start.elapsed() > self.timeout {
                error!(
                    log,
                    "{} still running after {}s, killing it",
                    cmd,
                    self.timeout.as_secs()
                );
                timed_out = true;
                kill_group(log, child.id());
                /*
                 * The leader is gone already if the group kill worked, but
                 * make sure of it before we wait.
                 */
                let _ = child.kill();
                break child.wait()?;
            }
            sleep(250);
        };

        let deadline = Instant::now() + DRAIN_GRACE;
        let (stdout, out_open) = out.finish(deadline)?;
        let (stderr, err_open) = err.finish(deadline)?;
        if out_open || err_open {
            warn!(log, "{} left output open; not waiting for it", cmd);
        }

        let output = ExecOutput { code: status.code(), stdout, stderr, timed_out };
        if !output.success() {
            warn!(log, "{} failed: {}", cmd, output.info());
        }
        Ok(output)
    }

    fn has_command(&self, name: &str) -> bool {
        use std::os::unix::fs::PermissionsExt;

        SAFE_PATH.split(':').any(|dir| {
            std::fs::metadata(Path::new(dir).join(name))
                .map(|md| md.is_file() && md.permissions().mode() & 0o111 != 0)
                .unwrap_or(false)
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exec_display() {
        let e = Exec::new("git").args(["-C", "/opt/stacks"]).arg("fetch");
        assert_eq!(e.to_string(), "git -C /opt/stacks fetch");
    }

    #[test]
    fn host_exec_captures_output() -> Result<()> {
        let log = init_log();
        let sys = HostSystem::new(Duration::from_secs(30));

        let out = sys.exec(&log, &Exec::new("sh").args(["-c", "echo hello; echo oops >&2; exit 3"]))?;
        assert_eq!(out.code, Some(3));
        assert!(!out.success());
        assert_eq!(out.stdout_str(), "hello");
        assert_eq!(out.info(), "exit code 3: oops");

        assert!(sys.check(&log, &Exec::new("true")).is_ok());
        assert!(sys.check(&log, &Exec::new("false")).is_err());
        Ok(())
    }

    #[test]
    fn host_exec_scrubs_environment() -> Result<()> {
        let log = init_log();
        let sys = HostSystem::new(Duration::from_secs(30));
        std::env::set_var("HUBPROVISION_TEST_LEAK", "1");

        let out = sys.check(
            &log,
            &Exec::new("sh")
                .args(["-c", "echo ${HUBPROVISION_TEST_LEAK:-clean} $EXTRA"])
                .env("EXTRA", "given"),
        )?;
        assert_eq!(out.stdout_str(), "clean given");
        Ok(())
    }

    #[test]
    fn host_exec_times_out() -> Result<()> {
        let log = init_log();
        let sys = HostSystem::new(Duration::from_millis(500));

        let start = Instant::now();
        let out = sys.exec(&log, &Exec::new("sleep").arg("30"))?;
        assert!(out.timed_out);
        assert!(!out.success());
        assert!(out.info().starts_with("timed out"));
        assert!(start.elapsed() < Duration::from_secs(10));
        Ok(())
    }

    #[test]
    fn host_exec_timeout_kills_children() -> Result<()> {
        let log = init_log();
        let sys = HostSystem::new(Duration::from_millis(500));

        /*
         * The shell forks for the sleep, and the sleep holds the pipes.
         */
        let start = Instant::now();
        let out = sys.exec(&log, &Exec::new("sh").args(["-c", "sleep 20; true"]))?;
        assert!(out.timed_out);
        assert!(start.elapsed() < Duration::from_secs(10));

        let start = Instant::now();
        let out = sys.exec(
            &log,
            &Exec::new("sh").args(["-c", "echo started; (sleep 20) & sleep 20"]),
        )?;
        assert!(out.timed_out);
        assert_eq!(out.stdout_str(), "started");
        assert!(start.elapsed() < Duration::from_secs(10));
        Ok(())
    }

    #[test]
    fn host_exec_does_not_wait_for_background_output() -> Result<()> {
        let log = init_log();
        let sys = HostSystem::new(Duration::from_secs(60));

        /*
         * The command itself succeeds at once, but leaves a process behind
         * that holds its stdout.
         */
        let start = Instant::now();
        let out = sys.exec(&log, &Exec::new("sh").args(["-c", "sleep 30 & echo done"]))?;
        assert!(out.success());
        assert_eq!(out.stdout_str(), "done");
        assert!(start.elapsed() < Duration::from_secs(20));
        Ok(())
    }

    #[test]
    fn host_has_command() {
        let sys = HostSystem::new(Duration::from_secs(1));
        assert!(sys.has_command("sh"));
        assert!(!sys.has_command("definitely-not-a-real-command"));
    }
}
