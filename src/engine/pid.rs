//! PID identity discipline.
//!
//! A stored pid may have been recycled by the OS between a crash and the
//! next engine start. Before any signal is sent to a stored pid, three
//! checks must pass: the process exists, its command name looks like the
//! Agent runtime, and its kernel-reported start time matches the recorded
//! one within a small drift. If any check fails, nothing is signalled.

use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

/// Allowed drift between the stored start timestamp and the kernel's view.
pub const START_TS_DRIFT_SECS: i64 = 5;

/// Command names the Agent runtime is expected to show up as.
const EXPECTED_COMM: &[&str] = &["claude", "node"];

/// Durable identity of a spawned worker, recorded on the task row before
/// any long operation.
#[derive(Debug, Clone, Copy)]
pub struct WorkerIdentity {
    pub pid: i32,
    /// Process start time as epoch seconds.
    pub start_ts: i64,
}

/// Kernel view of a live process.
#[derive(Debug, Clone)]
pub struct ProcView {
    pub comm: String,
    pub start_ts: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityCheck {
    Verified,
    /// Process is gone; nothing to kill.
    NotRunning,
    /// Process exists but is not our worker. Never signal it.
    Mismatch { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillOutcome {
    /// SIGTERM sufficed.
    Terminated,
    /// SIGTERM was ignored; escalated to SIGKILL.
    Killed,
    NotRunning,
    Mismatch { reason: String },
}

pub fn process_exists(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

/// Read `/proc/<pid>` for the command name and start time. Returns None when
/// the process does not exist or procfs is unreadable.
pub fn read_proc_view(pid: i32) -> Option<ProcView> {
    let comm = std::fs::read_to_string(format!("/proc/{pid}/comm"))
        .ok()?
        .trim()
        .to_string();
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let start_ticks = parse_starttime_ticks(&stat)?;
    let ticks_per_sec = clock_ticks_per_sec();
    let btime = read_boot_time()?;
    Some(ProcView {
        comm,
        start_ts: btime + (start_ticks / ticks_per_sec) as i64,
    })
}

/// Field 22 of `/proc/<pid>/stat` (starttime, in clock ticks since boot).
/// The comm field may contain spaces and parentheses, so parsing starts
/// after the closing paren.
fn parse_starttime_ticks(stat: &str) -> Option<u64> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    // after_comm starts at field 3 (state); starttime is field 22
    after_comm.split_whitespace().nth(19)?.parse().ok()
}

fn read_boot_time() -> Option<i64> {
    let stat = std::fs::read_to_string("/proc/stat").ok()?;
    for line in stat.lines() {
        if let Some(rest) = line.strip_prefix("btime ") {
            return rest.trim().parse().ok();
        }
    }
    None
}

fn clock_ticks_per_sec() -> u64 {
    nix::unistd::sysconf(nix::unistd::SysconfVar::CLK_TCK)
        .ok()
        .flatten()
        .map(|v| v as u64)
        .filter(|v| *v > 0)
        .unwrap_or(100)
}

/// The wall-clock start time of a process we just spawned, for recording on
/// the task row. Falls back to "now" when procfs is unavailable.
pub fn observed_start_ts(pid: i32) -> i64 {
    read_proc_view(pid)
        .map(|view| view.start_ts)
        .unwrap_or_else(|| chrono::Utc::now().timestamp())
}

/// Run the three identity checks against a stored `(pid, start_ts)`.
pub fn check_identity(stored: &WorkerIdentity) -> IdentityCheck {
    if stored.pid <= 0 {
        return IdentityCheck::Mismatch {
            reason: format!("invalid pid {}", stored.pid),
        };
    }
    if !process_exists(stored.pid) {
        return IdentityCheck::NotRunning;
    }
    let Some(view) = read_proc_view(stored.pid) else {
        // exists per kill(0) but unreadable: treat as not ours
        return IdentityCheck::Mismatch {
            reason: "process not inspectable".to_string(),
        };
    };
    if !EXPECTED_COMM.iter().any(|name| view.comm.contains(name)) {
        return IdentityCheck::Mismatch {
            reason: format!("command name '{}' is not the agent runtime", view.comm),
        };
    }
    if (view.start_ts - stored.start_ts).abs() > START_TS_DRIFT_SECS {
        return IdentityCheck::Mismatch {
            reason: format!(
                "start time drift {}s exceeds {}s",
                (view.start_ts - stored.start_ts).abs(),
                START_TS_DRIFT_SECS
            ),
        };
    }
    IdentityCheck::Verified
}

/// Identity-verified SIGTERM, a 5 s grace wait, re-verification, then
/// SIGKILL if the process is still there.
pub async fn verified_kill(stored: &WorkerIdentity) -> KillOutcome {
    match check_identity(stored) {
        IdentityCheck::NotRunning => return KillOutcome::NotRunning,
        IdentityCheck::Mismatch { reason } => return KillOutcome::Mismatch { reason },
        IdentityCheck::Verified => {}
    }
    let pid = Pid::from_raw(stored.pid);
    if kill(pid, Signal::SIGTERM).is_err() {
        return KillOutcome::NotRunning;
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if !process_exists(stored.pid) {
            return KillOutcome::Terminated;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // still present: re-verify before escalating, the pid could have been
    // recycled during the grace window
    match check_identity(stored) {
        IdentityCheck::NotRunning => KillOutcome::Terminated,
        IdentityCheck::Mismatch { reason } => KillOutcome::Mismatch { reason },
        IdentityCheck::Verified => {
            let _ = kill(pid, Signal::SIGKILL);
            KillOutcome::Killed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_starttime_past_comm_with_spaces() {
        // comm "(some cmd) x" contains a space and a paren
        let stat = "1234 (some (weird) cmd) S 1 1234 1234 0 -1 4194304 100 0 0 0 \
                    10 5 0 0 20 0 1 0 987654 10000000 500 18446744073709551615";
        assert_eq!(parse_starttime_ticks(stat), Some(987654));
    }

    #[test]
    fn nonexistent_pid_is_not_running() {
        // pid_max on Linux is bounded well below this
        let stored = WorkerIdentity {
            pid: 1_000_000_000,
            start_ts: 0,
        };
        assert!(!process_exists(stored.pid));
        assert_eq!(check_identity(&stored), IdentityCheck::NotRunning);
    }

    #[test]
    fn own_process_fails_comm_check() {
        // the test binary exists but is not named claude/node
        let me = std::process::id() as i32;
        let stored = WorkerIdentity {
            pid: me,
            start_ts: observed_start_ts(me),
        };
        match check_identity(&stored) {
            IdentityCheck::Mismatch { reason } => {
                assert!(reason.contains("command name"), "unexpected reason {reason}")
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
    }

    #[test]
    fn stale_start_ts_fails_drift_check() {
        // init is pid 1 with comm that is not claude/node on test hosts, so
        // exercise the drift check directly against our own proc view
        let me = std::process::id() as i32;
        let view = read_proc_view(me).expect("own /proc entry");
        let drifted = WorkerIdentity {
            pid: me,
            start_ts: view.start_ts - (START_TS_DRIFT_SECS + 10),
        };
        // comm check fires first for the test binary; the drift path is
        // covered by the pure comparison below
        assert!(matches!(
            check_identity(&drifted),
            IdentityCheck::Mismatch { .. }
        ));
        assert!((view.start_ts - drifted.start_ts).abs() > START_TS_DRIFT_SECS);
    }

    #[tokio::test]
    async fn verified_kill_refuses_mismatched_identity() {
        let stored = WorkerIdentity {
            pid: 99_999,
            start_ts: 0,
        };
        let outcome = verified_kill(&stored).await;
        // either the pid is unused (NotRunning) or belongs to a foreign
        // process (Mismatch); both must refuse to signal
        assert!(matches!(
            outcome,
            KillOutcome::NotRunning | KillOutcome::Mismatch { .. }
        ));
    }
}
