// ABOUTME: Process-group signalling helpers built on killpg(2)
// ABOUTME: Graceful terminate, grace interval, then SIGKILL for the whole group

use std::io;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Child;

/// Signals the supervisor sends to a whole process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupSignal {
    Terminate,
    Kill,
    Stop,
    Continue,
    /// Signal 0: existence check only.
    Probe,
}

impl GroupSignal {
    fn raw(self) -> libc::c_int {
        match self {
            GroupSignal::Terminate => libc::SIGTERM,
            GroupSignal::Kill => libc::SIGKILL,
            GroupSignal::Stop => libc::SIGSTOP,
            GroupSignal::Continue => libc::SIGCONT,
            GroupSignal::Probe => 0,
        }
    }
}

/// Send `signal` to every member of process group `pgid`.
///
/// Returns `Ok(false)` when the group has no members left.
pub fn signal_group(pgid: i32, signal: GroupSignal) -> io::Result<bool> {
    // pgid 0 and 1 would hit our own group or init.
    if pgid <= 1 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to signal process group {pgid}"),
        ));
    }

    // SAFETY: killpg has no memory-safety preconditions.
    let rc = unsafe { libc::killpg(pgid, signal.raw()) };
    if rc == 0 {
        return Ok(true);
    }

    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(false)
    } else {
        Err(err)
    }
}

/// True while at least one process in the group exists.
pub fn group_alive(pgid: i32) -> bool {
    matches!(signal_group(pgid, GroupSignal::Probe), Ok(true))
}

/// SIGTERM the group, wait up to `grace` for the leader, then SIGKILL the group.
///
/// The group is SIGKILLed even when the leader exits within the grace period so
/// that descendants ignoring SIGTERM do not survive it. A stopped group gets
/// SIGCONT after SIGTERM so it can act on the signal.
pub async fn terminate_group(
    child: &mut Child,
    pgid: i32,
    grace: Duration,
    stopped: bool,
) -> io::Result<ExitStatus> {
    if let Err(e) = signal_group(pgid, GroupSignal::Terminate) {
        tracing::warn!(pgid, error = %e, "SIGTERM to process group failed");
    }
    if stopped {
        let _ = signal_group(pgid, GroupSignal::Continue);
    }

    let status = match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status?,
        Err(_) => {
            tracing::warn!(pgid, grace_ms = grace.as_millis() as u64, "Grace period expired, sending SIGKILL");
            if let Err(e) = signal_group(pgid, GroupSignal::Kill) {
                tracing::warn!(pgid, error = %e, "SIGKILL to process group failed");
            }
            child.wait().await?
        }
    };

    reap_stragglers(pgid);
    Ok(status)
}

/// SIGKILL whatever is left of the group after its leader exited.
pub fn reap_stragglers(pgid: i32) {
    match signal_group(pgid, GroupSignal::Kill) {
        Ok(true) => tracing::debug!(pgid, "Killed remaining members of process group"),
        Ok(false) => {}
        Err(e) => tracing::warn!(pgid, error = %e, "Failed to sweep process group"),
    }
}

/// Exit code in shell convention: the code itself, or 128 + signal number.
pub fn exit_code_of(status: &ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    #[test]
    fn refuses_to_signal_init_or_self_group() {
        assert!(signal_group(0, GroupSignal::Probe).is_err());
        assert!(signal_group(1, GroupSignal::Probe).is_err());
    }

    #[tokio::test]
    async fn terminate_group_kills_descendants() {
        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg("trap '' TERM; sleep 30 & sleep 30")
            .stdin(Stdio::null())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .expect("spawn sh");
        let pgid = child.id().expect("pid") as i32;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(group_alive(pgid));

        let status = terminate_group(&mut child, pgid, Duration::from_millis(200), false)
            .await
            .expect("terminate");
        assert!(!status.success());

        let mut alive = true;
        for _ in 0..50 {
            if !group_alive(pgid) {
                alive = false;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!alive, "process group {pgid} still has members");
    }

    #[tokio::test]
    async fn exit_code_reports_signal_convention() {
        let status = Command::new("/bin/sh")
            .arg("-c")
            .arg("kill -KILL $$")
            .status()
            .await
            .expect("run sh");
        assert_eq!(exit_code_of(&status), 128 + libc::SIGKILL);

        let status = Command::new("/bin/sh")
            .arg("-c")
            .arg("exit 7")
            .status()
            .await
            .expect("run sh");
        assert_eq!(exit_code_of(&status), 7);
    }
}
