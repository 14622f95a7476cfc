use std::io;
use std::time::Duration;

/// Current time on the monotonic clock, the clock vblank timestamps are reported on.
pub fn get_monotonic_time() -> Duration {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid timespec and CLOCK_MONOTONIC is always available on Linux.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
}

/// Sleep until `deadline` on the monotonic clock.
///
/// Returns an [`io::ErrorKind::Interrupted`] error when a signal cut the sleep short.
pub fn sleep_until(deadline: Duration) -> io::Result<()> {
    let ts = libc::timespec {
        tv_sec: deadline.as_secs() as libc::time_t,
        tv_nsec: deadline.subsec_nanos() as libc::c_long,
    };
    // SAFETY: ts is a valid timespec and the remainder pointer may be null with TIMER_ABSTIME.
    let ret = unsafe {
        libc::clock_nanosleep(
            libc::CLOCK_MONOTONIC,
            libc::TIMER_ABSTIME,
            &ts,
            std::ptr::null_mut(),
        )
    };

    // clock_nanosleep returns the error instead of setting errno.
    match ret {
        0 => Ok(()),
        err => Err(io::Error::from_raw_os_error(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_time_advances() {
        let a = get_monotonic_time();
        let b = get_monotonic_time();
        assert!(b >= a);
    }

    #[test]
    fn sleep_until_past_deadline_returns() {
        sleep_until(Duration::ZERO).unwrap();
        let deadline = get_monotonic_time() + Duration::from_millis(2);
        sleep_until(deadline).unwrap();
        assert!(get_monotonic_time() >= deadline);
    }
}
