use std::fmt::Display;

pub(crate) const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Returns the `CLOCK_MONOTONIC` timestamp in ns
#[inline(never)]
pub fn mono_time_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    from_timespec(&ts)
}

#[inline(always)]
pub(crate) fn from_timespec(ts: &libc::timespec) -> u64 {
    (ts.tv_sec as u64) * NANOS_PER_SEC + (ts.tv_nsec as u64)
}

#[inline(always)]
pub(crate) fn to_timespec(ns: u64) -> libc::timespec {
    libc::timespec {
        tv_sec: (ns / NANOS_PER_SEC) as libc::time_t,
        tv_nsec: (ns % NANOS_PER_SEC) as libc::c_long,
    }
}

/// Fixed-capacity window over the most recent samples.
///
/// Recording never allocates; once full, the oldest sample is overwritten.
/// Extremes are tracked over every sample ever recorded.
#[derive(Debug, Clone)]
pub struct Samples<T> {
    window: Vec<T>,
    capacity: usize,
    next: usize,
    total: u64,
    min: Option<T>,
    max: Option<T>,
}

/// Order statistics of a [`Samples`] window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Summary<T> {
    pub count: u64,
    pub min: T,
    pub p50: T,
    pub p99: T,
    pub max: T,
}

impl<T> Samples<T>
where
    T: Ord + Copy,
{
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            window: Vec::with_capacity(capacity),
            capacity,
            next: 0,
            total: 0,
            min: None,
            max: None,
        }
    }

    pub fn push(&mut self, value: T) {
        if self.window.len() < self.capacity {
            self.window.push(value);
        } else {
            self.window[self.next] = value;
        }
        self.next = (self.next + 1) % self.capacity;
        self.total += 1;
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
    }

    /// Samples currently held in the window.
    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Samples recorded since creation, including overwritten ones.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Quantiles over the window, extremes over everything recorded.
    pub fn summary(&self) -> Option<Summary<T>> {
        let (min, max) = (self.min?, self.max?);
        let mut sorted = self.window.clone();
        sorted.sort_unstable();
        Some(Summary {
            count: self.total,
            min,
            p50: quantile(&sorted, 0.5),
            p99: quantile(&sorted, 0.99),
            max,
        })
    }
}

fn quantile<T: Copy>(sorted: &[T], p: f64) -> T {
    let n = sorted.len();
    assert!(n > 0);
    assert!((0.0..=1.0).contains(&p));
    let idx = ((n - 1) as f64 * p).round() as usize;
    sorted[idx]
}

impl<T: Display> Summary<T> {
    pub fn print_csv(&self, title: &str) {
        println!("name,n,min,p50,p99,max");
        println!(
            "{},{},{},{},{},{}",
            title, self.count, self.min, self.p50, self.p99, self.max
        );
    }
}
