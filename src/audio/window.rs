use std::time::Duration;

/// Fixed-length ring of per-buffer power values with an incrementally
/// maintained sum.
///
/// Every `push` overwrites exactly one slot, so the sum is updated with one
/// add and one subtract and never rescanned.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    slots: Vec<f64>,
    cursor: usize,
    sum: f64,
}

impl SlidingWindow {
    /// Create a zero-filled window. `len` is raised to at least 1.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            slots: vec![0.0; len.max(1)],
            cursor: 0,
            sum: 0.0,
        }
    }

    /// Number of buffers needed to span `window` when each buffer lasts `frames / rate`.
    #[must_use]
    pub fn length_for(window: Duration, sample_rate: u32, buffer_frames: usize) -> usize {
        if buffer_frames == 0 {
            return 1;
        }
        let window_frames = f64::from(sample_rate) * window.as_secs_f64();
        let len = (window_frames / buffer_frames as f64).ceil() as usize;
        len.max(1)
    }

    /// Store `value` under the cursor, move the cursor back one slot, and
    /// return the value that was overwritten.
    pub fn push(&mut self, value: f64) -> f64 {
        let displaced = std::mem::replace(&mut self.slots[self.cursor], value);
        self.cursor = if self.cursor == 0 {
            self.slots.len() - 1
        } else {
            self.cursor - 1
        };
        self.sum += value - displaced;
        displaced
    }

    /// Running sum of the values currently held.
    #[must_use]
    pub const fn sum(&self) -> f64 {
        self.sum
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        self.slots.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    #[test]
    fn push_returns_displaced_values_in_fifo_order() {
        let mut w = SlidingWindow::new(3);
        assert_eq!(w.push(1.0), 0.0);
        assert_eq!(w.push(2.0), 0.0);
        assert_eq!(w.push(3.0), 0.0);
        assert_eq!(w.push(4.0), 1.0);
        assert_eq!(w.push(5.0), 2.0);
        assert!((w.sum() - 12.0).abs() < 1e-12);
    }

    #[test]
    fn single_slot_window_replaces_every_time() {
        let mut w = SlidingWindow::new(0);
        assert_eq!(w.len(), 1);
        w.push(7.0);
        assert_eq!(w.push(9.0), 7.0);
        assert!((w.sum() - 9.0).abs() < 1e-12);
    }

    #[test]
    fn length_spans_window() {
        // 44.1 kHz, 3528-frame buffers (80 ms): 250 ms needs 4 buffers.
        assert_eq!(SlidingWindow::length_for(Duration::from_millis(250), 44100, 3528), 4);
        // 48 kHz, 3840-frame buffers: 12000 / 3840 = 3.125 -> 4.
        assert_eq!(SlidingWindow::length_for(Duration::from_millis(250), 48000, 3840), 4);
        // Exact multiple.
        assert_eq!(SlidingWindow::length_for(Duration::from_millis(250), 48000, 1200), 10);
        // Buffer longer than the window.
        assert_eq!(SlidingWindow::length_for(Duration::from_millis(10), 48000, 48000), 1);
    }

    proptest! {
        #[test]
        fn running_sum_matches_full_scan(
            len in 1usize..32,
            values in proptest::collection::vec(0.0f64..100.0, 0..512),
        ) {
            let mut w = SlidingWindow::new(len);
            for v in values {
                w.push(v);
                let scanned: f64 = w.iter().sum();
                prop_assert!((w.sum() - scanned).abs() < 1e-6, "sum {} scan {}", w.sum(), scanned);
            }
        }
    }
}
