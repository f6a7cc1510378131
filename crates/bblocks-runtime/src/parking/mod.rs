//! Worker parking
//!
//! Each scheduler worker owns one parker. `unpark` leaves a token that the
//! next `park` consumes, so a wake that races ahead of the sleep is never
//! lost.

use std::time::Duration;

/// Sleep/wake primitive for a single worker thread.
pub trait WorkerParking: Send + Sync {
    /// Park until unparked or `timeout` elapses.
    ///
    /// Returns `true` if a wake token was consumed. Callers re-check their
    /// queue either way.
    fn park(&self, timeout: Option<Duration>) -> bool;

    /// Leave a wake token, waking the owner if it is parked.
    fn unpark(&self);
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod futex_linux;
        pub use futex_linux::FutexParking as PlatformParking;
    } else {
        mod fallback;
        pub use fallback::FallbackParking as PlatformParking;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_park_timeout() {
        let parking = PlatformParking::new();
        let start = Instant::now();
        let woken = parking.park(Some(Duration::from_millis(50)));
        assert!(!woken);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_token_before_park() {
        let parking = PlatformParking::new();
        parking.unpark();
        let start = Instant::now();
        assert!(parking.park(Some(Duration::from_secs(10))));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_unpark_wakes_sleeper() {
        let parking = Arc::new(PlatformParking::new());
        let p2 = Arc::clone(&parking);

        let handle = thread::spawn(move || p2.park(Some(Duration::from_secs(10))));
        thread::sleep(Duration::from_millis(50));
        parking.unpark();

        assert!(handle.join().unwrap());
    }
}
