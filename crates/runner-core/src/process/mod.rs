//! Process-group primitives shared by the run engine and the supervisor.
//!
//! Children are spawned as leaders of their own process group so that one
//! signal reaches the child and everything it forked.

use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Signals the core sends to managed processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

impl Signal {
    #[cfg(unix)]
    fn as_raw(self) -> libc::c_int {
        match self {
            Self::Term => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
        }
    }
}

/// Make the spawned child the leader of a fresh process group.
pub fn isolate_process_group(cmd: &mut Command) {
    #[cfg(unix)]
    cmd.process_group(0);
    #[cfg(not(unix))]
    let _ = cmd;
}

/// Send `signal` to every process in the group led by `pgid`.
///
/// A group that no longer exists is not an error.
#[cfg(unix)]
pub fn signal_group(pgid: u32, signal: Signal) -> io::Result<()> {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "pgid out of range"));
    };
    if pgid <= 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "refusing to signal pgid <= 0"));
    }
    // SAFETY: kill(2) with a negative pid targets the process group we created.
    let ret = unsafe { libc::kill(-pgid, signal.as_raw()) };
    if ret == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

#[cfg(not(unix))]
pub fn signal_group(_pgid: u32, _signal: Signal) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process-group signals require a Unix platform",
    ))
}

/// Whether any process of the group led by `pgid` is still alive.
#[cfg(unix)]
pub fn group_alive(pgid: u32) -> bool {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return false;
    };
    // SAFETY: signal 0 only performs the existence and permission check.
    let ret = unsafe { libc::kill(-pgid, 0) };
    ret == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn group_alive(_pgid: u32) -> bool {
    false
}

/// SIGTERM the group, wait up to `grace` for the leader, then SIGKILL.
///
/// Always reaps the leader and kills whatever is left of the group.
pub async fn terminate_gracefully(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    let Some(pid) = child.id() else {
        // Already reaped.
        return child.wait().await;
    };

    if let Err(e) = signal_group(pid, Signal::Term) {
        warn!(pid, error = %e, "SIGTERM failed, proceeding to SIGKILL");
        child.start_kill().ok();
    }

    let status = match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => {
            debug!(pid, "process exited after SIGTERM");
            status?
        }
        Err(_) => {
            debug!(pid, "process did not exit after SIGTERM, sending SIGKILL");
            if signal_group(pid, Signal::Kill).is_err() {
                child.start_kill().ok();
            }
            child.wait().await?
        }
    };

    signal_group(pid, Signal::Kill).ok();
    Ok(status)
}

// ---------------------------------------------------------------------------
// Exit status reporting
// ---------------------------------------------------------------------------

/// Exit code and signal of a finished process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// Raw exit code, or `-signo` for signal deaths.
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signo) = status.signal() {
                return Self {
                    code: Some(-signo),
                    signal: Some(signo),
                };
            }
        }
        Self {
            code: status.code(),
            signal: None,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Short human description, e.g. `exited with code 2` or
    /// `terminated by signal SIGKILL (9)`.
    pub fn describe(&self) -> String {
        match (self.signal, self.code) {
            (Some(signo), _) => format!("terminated by signal {} ({signo})", signal_name(signo)),
            (None, Some(code)) => format!("exited with code {code}"),
            (None, None) => "exited with unknown status".to_string(),
        }
    }
}

/// Conventional name of a POSIX signal number.
pub fn signal_name(signo: i32) -> &'static str {
    match signo {
        1 => "SIGHUP",
        2 => "SIGINT",
        3 => "SIGQUIT",
        4 => "SIGILL",
        6 => "SIGABRT",
        8 => "SIGFPE",
        9 => "SIGKILL",
        11 => "SIGSEGV",
        13 => "SIGPIPE",
        14 => "SIGALRM",
        15 => "SIGTERM",
        _ => "unknown signal",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use std::time::Instant;

    #[test]
    fn exit_descriptions() {
        let clean = ExitInfo {
            code: Some(0),
            signal: None,
        };
        assert!(clean.success());
        assert_eq!(clean.describe(), "exited with code 0");

        let killed = ExitInfo {
            code: Some(-9),
            signal: Some(9),
        };
        assert!(!killed.success());
        assert_eq!(killed.describe(), "terminated by signal SIGKILL (9)");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn signal_death_is_reported_as_negative_code() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("kill -TERM $$; sleep 5");
        let status = cmd.status().await.unwrap();
        let info = ExitInfo::from_status(status);
        assert_eq!(info.code, Some(-15));
        assert_eq!(info.signal, Some(15));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_gracefully_escalates_to_sigkill() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg("trap '' TERM; while true; do sleep 0.05; done")
            .stdout(Stdio::null())
            .kill_on_drop(true);
        isolate_process_group(&mut cmd);
        let mut child = cmd.spawn().unwrap();
        // Let the shell install its trap.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        let status = terminate_gracefully(&mut child, Duration::from_millis(200))
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(ExitInfo::from_status(status).signal, Some(9));
    }

    #[cfg(unix)]
    #[test]
    fn signalling_a_missing_group_is_ok() {
        // pid_max is far below this on every supported platform.
        assert!(signal_group(2_000_000_000, Signal::Term).is_ok());
        assert!(!group_alive(2_000_000_000));
    }
}
