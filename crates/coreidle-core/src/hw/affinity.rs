//! Core enumeration and thread pinning via `sched_setaffinity(2)`.

use std::io;

use crate::platform::CpuTopology;

/// Topology of the running Linux machine.
pub struct LinuxTopology;

impl CpuTopology for LinuxTopology {
    fn online_cores(&self) -> usize {
        online_cores()
    }

    fn pin_current_thread(&self, core: u32) -> io::Result<()> {
        pin_current_thread(core as usize)
    }

    fn is_current_thread_pinned_to(&self, core: u32) -> bool {
        current_affinity()
            .map(|cores| cores == [core as usize])
            .unwrap_or(false)
    }
}

/// Number of online logical cores.
pub fn online_cores() -> usize {
    // SAFETY: sysconf has no preconditions.
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n > 0 {
        n as usize
    } else {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

/// Core the calling thread is executing on right now, if known.
#[cfg(target_os = "linux")]
pub fn current_core() -> Option<u32> {
    // SAFETY: sched_getcpu has no preconditions.
    let cpu = unsafe { libc::sched_getcpu() };
    u32::try_from(cpu).ok()
}

#[cfg(not(target_os = "linux"))]
pub fn current_core() -> Option<u32> {
    None
}

/// Bind the calling thread to `core` only.
#[cfg(target_os = "linux")]
pub fn pin_current_thread(core: usize) -> io::Result<()> {
    if core >= libc::CPU_SETSIZE as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("core {core} does not fit in a cpu_set_t"),
        ));
    }
    // SAFETY: cpu_set_t is plain data and all-zeroes is a valid empty set;
    // CPU_SET is bounds-checked above and pid 0 means the calling thread.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(_core: usize) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "thread pinning needs Linux",
    ))
}

/// Cores the calling thread is allowed to run on.
#[cfg(target_os = "linux")]
pub fn current_affinity() -> io::Result<Vec<usize>> {
    // SAFETY: as in `pin_current_thread`; the kernel fills `set`.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        if libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set) != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok((0..libc::CPU_SETSIZE as usize)
            .filter(|&cpu| libc::CPU_ISSET(cpu, &set))
            .collect())
    }
}

#[cfg(not(target_os = "linux"))]
pub fn current_affinity() -> io::Result<Vec<usize>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "thread affinity needs Linux",
    ))
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn at_least_one_core_online() {
        assert!(online_cores() >= 1);
        assert!(LinuxTopology.online_cores() >= 1);
    }

    #[test]
    fn pinning_a_fresh_thread() {
        // Pin to a core this process may already use, so restricted
        // containers still pass.
        let allowed = current_affinity().unwrap();
        let target = allowed[0];
        std::thread::spawn(move || {
            pin_current_thread(target).unwrap();
            assert_eq!(current_affinity().unwrap(), vec![target]);
            assert!(LinuxTopology.is_current_thread_pinned_to(target as u32));
            assert_eq!(current_core(), Some(target as u32));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn oversized_core_is_rejected() {
        let err = pin_current_thread(1 << 20).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
