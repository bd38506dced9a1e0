// Copyright (c) The vigil Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Stopwatch for tracking how long a run takes.
//!
//! Elapsed time comes from a monotonic `Instant`, so a wall-clock jump
//! mid-run cannot produce a negative or inflated duration.

use std::time::{Duration, Instant};

pub(crate) fn stopwatch() -> Stopwatch {
    Stopwatch {
        instant: Instant::now(),
    }
}

/// A stopwatch started when a run begins.
#[derive(Clone, Debug)]
pub(crate) struct Stopwatch {
    instant: Instant,
}

impl Stopwatch {
    pub(crate) fn elapsed(&self) -> Duration {
        self.instant.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_advances() {
        let watch = stopwatch();
        std::thread::sleep(Duration::from_millis(50));
        let first = watch.elapsed();
        assert!(first >= Duration::from_millis(50));

        std::thread::sleep(Duration::from_millis(20));
        assert!(watch.elapsed() > first);
    }
}
