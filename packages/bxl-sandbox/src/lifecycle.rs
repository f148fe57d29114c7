//! Exit-report bracketing (§4.5.5): a `_exit` is bracketed by a
//! deterministic "exit report" sent on every exit path, including recovery
//! from a `SIGKILL`'d child via the supervisor's process-still-alive timer.
//!
//! Grounded on the teacher's process-liveness checks (`sysinfo`) and signal
//! handling (`signal-hook`) dependencies, generalized from "is the daemon
//! still running" to "is the sandboxed child still running, and if not, did
//! its own exit-report event ever arrive".

use std::time::Duration;

use sysinfo::{Pid, System};
use tokio::time::interval;

/// Whether the exit report for a pid arrived through the normal FIFO
/// channel, or had to be synthesized because the process vanished (e.g.
/// `SIGKILL`) before it could write one.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ExitReportOrigin {
    ReportedByChild,
    SynthesizedAfterDisappearance,
}

/// Polls process liveness on an interval until either the expected exit
/// report arrives (via `report_arrived`, checked each tick) or the process
/// itself is no longer running, in which case a synthetic exit report is
/// the result — covering the case where a `SIGKILL` prevents the injected
/// library's own at-exit handler from running.
pub async fn watch_for_exit_report(pid: u32, poll_interval: Duration, mut report_arrived: impl FnMut() -> bool) -> ExitReportOrigin {
    let mut system = System::new();
    let mut ticker = interval(poll_interval);
    loop {
        ticker.tick().await;
        if report_arrived() {
            return ExitReportOrigin::ReportedByChild;
        }
        system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[Pid::from_u32(pid)]), true);
        if system.process(Pid::from_u32(pid)).is_none() {
            return ExitReportOrigin::SynthesizedAfterDisappearance;
        }
    }
}

/// Registers a handler for `SIGCHLD` so the supervisor wakes promptly when
/// any sandboxed child reaps, rather than relying solely on the poll
/// interval in [`watch_for_exit_report`]. Returns the flag the handler
/// flips; callers select on it alongside their own poll loop.
pub fn register_sigchld_flag() -> color_eyre::Result<std::sync::Arc<std::sync::atomic::AtomicBool>> {
    let flag = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGCHLD, flag.clone())?;
    Ok(flag)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn report_arriving_short_circuits_the_poll_loop() {
        let arrived = Arc::new(AtomicBool::new(false));
        let arrived_setter = arrived.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            arrived_setter.store(true, Ordering::SeqCst);
        });

        let origin = watch_for_exit_report(std::process::id(), Duration::from_millis(1), || arrived.load(Ordering::SeqCst)).await;
        assert_eq!(origin, ExitReportOrigin::ReportedByChild);
    }
}
