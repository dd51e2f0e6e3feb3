/// Reads `clock_id` in nanoseconds, or 0 if the clock is unavailable.
pub fn get_clock_value(clock_id: libc::c_int) -> u64 {
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    if unsafe { libc::clock_gettime(clock_id, &mut ts) } != 0 {
        return 0;
    }
    (ts.tv_sec as u64 * 1_000_000_000) + ts.tv_nsec as u64
}

/// Monotonic timestamp used for packet times.
#[inline]
pub fn monotonic_ns() -> u64 {
    get_clock_value(libc::CLOCK_MONOTONIC)
}

/// Wall-clock time in nanoseconds, used for the trace start time.
#[inline]
pub fn realtime_ns() -> u64 {
    get_clock_value(libc::CLOCK_REALTIME)
}

/// Kernel id of the calling thread.
pub fn current_tid() -> u32 {
    unsafe { libc::syscall(libc::SYS_gettid) as u32 }
}
