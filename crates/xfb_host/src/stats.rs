//! Latency statistics for the GEMM benchmark.
//!
//! Collects per-call service times and reports minimum, maximum, average and
//! a coarse histogram.

const BUCKETS: usize = 20;

/// Width of one histogram bucket in nanoseconds (100 us).
const BUCKET_NS: u64 = 100_000;

/// Accumulated latency measurements.
#[derive(Debug, Clone)]
pub struct LatencyStats {
    pub min: u64,
    pub max: u64,
    pub sum: u64,
    pub count: u64,
    pub buckets: [u64; BUCKETS],
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyStats {
    /// Creates an empty tracker; the first measurement becomes the minimum.
    pub fn new() -> Self {
        Self {
            min: u64::MAX,
            max: 0,
            sum: 0,
            count: 0,
            buckets: [0; BUCKETS],
        }
    }

    /// Records one measurement in nanoseconds.
    pub fn update(&mut self, nanos: u64) {
        self.min = self.min.min(nanos);
        self.max = self.max.max(nanos);
        self.sum += nanos;
        self.count += 1;

        let idx = (nanos / BUCKET_NS).min(BUCKETS as u64 - 1) as usize;
        self.buckets[idx] += 1;
    }

    /// Folds another tracker into this one.
    pub fn merge(mut self, other: &Self) -> Self {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.sum += other.sum;
        self.count += other.count;
        for (mine, theirs) in self.buckets.iter_mut().zip(other.buckets) {
            *mine += theirs;
        }
        self
    }

    /// Average latency in nanoseconds, or 0.0 with no measurements.
    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum as f64 / self.count as f64
        }
    }

    /// Prints the report to stdout.
    ///
    /// Values are shown in microseconds below one millisecond average and
    /// in milliseconds above.
    pub fn print_report(&self) {
        println!("\nLatency (gemm + result read-back)");
        println!("Count: {}", self.count);
        if self.count == 0 {
            return;
        }

        let avg_ns = self.avg();
        let (unit, scale) = if avg_ns < 1_000_000.0 { ("us", 1e3) } else { ("ms", 1e6) };
        println!("Min:   {:.2} {unit}", self.min as f64 / scale);
        println!("Avg:   {:.2} {unit}", avg_ns / scale);
        println!("Max:   {:.2} {unit}", self.max as f64 / scale);

        println!("Distribution (100us buckets):");
        for (i, &count) in self.buckets.iter().enumerate() {
            if count > 0 {
                let open = if i == BUCKETS - 1 { ">" } else { "" };
                println!("[{:5}-{:5}{open} us]: {count}", i * 100, (i + 1) * 100);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_combines_extremes_and_buckets() {
        let mut a = LatencyStats::new();
        a.update(50_000);
        a.update(250_000);
        let mut b = LatencyStats::new();
        b.update(10_000_000);

        let all = a.merge(&b);
        assert_eq!(all.count, 3);
        assert_eq!(all.min, 50_000);
        assert_eq!(all.max, 10_000_000);
        assert_eq!(all.buckets[0], 1);
        assert_eq!(all.buckets[2], 1);
        assert_eq!(all.buckets[BUCKETS - 1], 1);
        assert_eq!(LatencyStats::new().avg(), 0.0);
    }
}
