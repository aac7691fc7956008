use anyhow::Context;

/// Pin the calling thread to the given CPU set and verify the mask took
/// effect. Workers rely on disjoint CPU sets for their shared-nothing model,
/// so a silently ignored mask would skew every measurement.
#[cfg(target_os = "linux")]
pub fn pin_current_thread(cpus: &[usize]) -> anyhow::Result<()> {
    use libc::{cpu_set_t, sched_getaffinity, sched_setaffinity, CPU_EQUAL, CPU_SET, CPU_ZERO};

    anyhow::ensure!(!cpus.is_empty(), "cpu set is empty");

    let mut expected: cpu_set_t = unsafe { std::mem::zeroed() };
    unsafe { CPU_ZERO(&mut expected) };
    for &cpu in cpus {
        unsafe { CPU_SET(cpu, &mut expected) };
    }

    let size = std::mem::size_of::<cpu_set_t>();
    if unsafe { sched_setaffinity(0, size, &expected) } != 0 {
        return Err(std::io::Error::last_os_error()).context("sched_setaffinity");
    }

    let mut actual: cpu_set_t = unsafe { std::mem::zeroed() };
    if unsafe { sched_getaffinity(0, size, &mut actual) } != 0 {
        return Err(std::io::Error::last_os_error()).context("sched_getaffinity");
    }
    anyhow::ensure!(
        unsafe { CPU_EQUAL(&expected, &actual) },
        "cpu affinity mask rejected: {cpus:?}"
    );
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(_cpus: &[usize]) -> anyhow::Result<()> {
    Ok(())
}
