//! CPU pinning and real-time scheduling for stage threads.
//!
//! Both calls act on the calling thread. Failures are reported as `Err` and the caller
//! decides whether to continue; the orchestrator logs them at warn level and keeps going
//! with default scheduling, since most development machines refuse `SCHED_FIFO` to
//! unprivileged users.

use std::io;

/// Pin the calling thread to CPU `core`.
#[cfg(target_os = "linux")]
pub fn pin_current_thread(core: usize) -> io::Result<()> {
    if core >= libc::CPU_SETSIZE as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("CPU {} out of range", core),
        ));
    }

    // SAFETY: cpu_set_t is a plain bitmask for which all-zero is the empty set; core was
    // bounds-checked against CPU_SETSIZE above.
    let rc = unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set)
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// CPU pinning is only supported on Linux.
#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(_core: usize) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "CPU affinity is not supported on this platform",
    ))
}

/// Switch the calling thread to `SCHED_FIFO` with `priority` (1-99).
#[cfg(target_os = "linux")]
pub fn elevate_current_thread(priority: i32) -> io::Result<()> {
    if !(1..=99).contains(&priority) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("SCHED_FIFO priority {} out of range 1-99", priority),
        ));
    }

    let param = libc::sched_param {
        sched_priority: priority,
    };
    // SAFETY: pthread_self is always a valid handle for the calling thread and param
    // outlives the call.
    let rc = unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    Ok(())
}

/// Real-time scheduling is only supported on Linux.
#[cfg(not(target_os = "linux"))]
pub fn elevate_current_thread(_priority: i32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "real-time scheduling is not supported on this platform",
    ))
}

/// CPUs the calling thread is currently allowed to run on.
#[cfg(target_os = "linux")]
pub fn allowed_cores() -> io::Result<Vec<usize>> {
    // SAFETY: all-zero is a valid empty cpu_set_t and the kernel writes at most
    // size_of::<cpu_set_t>() bytes into it.
    let set = unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        if libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set) != 0 {
            return Err(io::Error::last_os_error());
        }
        set
    };
    let cores = (0..libc::CPU_SETSIZE as usize)
        // SAFETY: every index is below CPU_SETSIZE.
        .filter(|&core| unsafe { libc::CPU_ISSET(core, &set) })
        .collect();
    Ok(cores)
}

/// Without affinity support every core counts as allowed.
#[cfg(not(target_os = "linux"))]
pub fn allowed_cores() -> io::Result<Vec<usize>> {
    Ok((0..available_cores()).collect())
}

/// Number of CPUs the process may run on.
pub fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
