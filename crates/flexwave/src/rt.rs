//! Realtime scheduling for the data-plane threads.
//!
//! The UDP I/O thread runs at the highest SCHED_FIFO priority the process
//! can get; the data worker runs eight priority steps below it so the
//! socket thread always preempts user callbacks. Platforms without
//! realtime scheduling (or processes without the privilege) degrade to the
//! default policy with a logged warning.

/// Role of a data-plane thread, determining its requested priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RtRole {
    /// The UDP socket thread. Highest realtime priority.
    DataIo,
    /// The data callback worker. Highest realtime priority minus 8.
    DataWorker,
}

/// Request SCHED_FIFO for the calling thread at the priority its role
/// demands. Failure is not fatal: the thread keeps running at its current
/// priority and the degradation is logged.
#[cfg(target_os = "linux")]
pub(crate) fn set_realtime_priority(role: RtRole) {
    // Grounded in sched_get_priority_max(SCHED_FIFO): the kernel reports
    // the ceiling, the worker sits a fixed distance below it.
    unsafe {
        let max = libc::sched_get_priority_max(libc::SCHED_FIFO);
        if max < 0 {
            tracing::warn!(
                ?role,
                "cannot query SCHED_FIFO priority range; thread stays at normal priority"
            );
            return;
        }

        let priority = match role {
            RtRole::DataIo => max,
            RtRole::DataWorker => (max - 8).max(1),
        };

        let param = libc::sched_param {
            sched_priority: priority,
        };
        let ret = libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param);
        if ret != 0 {
            tracing::warn!(
                ?role,
                priority,
                errno = ret,
                "failed to set SCHED_FIFO; thread stays at normal priority"
            );
        } else {
            tracing::debug!(?role, priority, "thread scheduled SCHED_FIFO");
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn set_realtime_priority(role: RtRole) {
    tracing::warn!(
        ?role,
        "realtime scheduling not available on this platform; thread stays at normal priority"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_request_does_not_panic() {
        // Usually fails without CAP_SYS_NICE; the contract is that it
        // degrades quietly either way.
        set_realtime_priority(RtRole::DataIo);
        set_realtime_priority(RtRole::DataWorker);
    }
}
