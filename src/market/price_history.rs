use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};

/// Rolling window of observed prices, bounded by age and by count
#[derive(Debug, Clone)]
pub struct PriceHistory {
    samples: VecDeque<(DateTime<Utc>, f64)>,
    window: Duration,
    max_samples: usize,
}

impl PriceHistory {
    /// # Arguments
    /// * `window` - Oldest sample age kept relative to the newest one
    /// * `max_samples` - Hard cap on retained samples
    pub fn new(window: Duration, max_samples: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            window,
            max_samples: max_samples.max(2),
        }
    }

    /// Add a price sample, evicting anything older than the window
    pub fn push(&mut self, timestamp: DateTime<Utc>, price: f64) {
        // Out-of-order samples would break the window arithmetic
        if let Some((last, _)) = self.samples.back() {
            if timestamp < *last {
                return;
            }
        }

        self.samples.push_back((timestamp, price));

        let cutoff = timestamp - self.window;
        while let Some((oldest, _)) = self.samples.front() {
            if *oldest < cutoff {
                self.samples.pop_front();
            } else {
                break;
            }
        }

        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn oldest(&self) -> Option<f64> {
        self.samples.front().map(|(_, p)| *p)
    }

    pub fn latest(&self) -> Option<f64> {
        self.samples.back().map(|(_, p)| *p)
    }

    /// Signed fractional change from the oldest to the newest sample
    pub fn change_pct(&self) -> Option<f64> {
        if self.samples.len() < 2 {
            return None;
        }
        match (self.oldest(), self.latest()) {
            (Some(first), Some(last)) if first > 0.0 => Some((last - first) / first),
            _ => None,
        }
    }
}
