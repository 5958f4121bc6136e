// Fixed-capacity circular history buffer with linear-regression analytics.
//
// The ring buffer is not internally MT-safe. Access can be time-critical
// (thermal control loop, exposure convergence) and the appropriate locking
// is use-case specific, so synchronization is left to the integrating code.

use canonical_error::{invalid_argument_error, CanonicalError};

/// Result of an ordinary least-squares fit over ring buffer contents.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
    pub correlation: f64,
}

const DENOM_EPSILON: f64 = 1e-30;

pub struct RingBuf<T> {
    data: Vec<T>,
    /// Physical index of the most recent push; None until the first push
    /// or after clear().
    idx: Option<usize>,
    full: bool,
    /// Lifetime push count; exceeds capacity once the buffer wraps.
    pushed: usize,
}

impl<T: Copy + Default> RingBuf<T> {
    /// Allocates a buffer of fixed `capacity`, zero-filled and empty.
    pub fn new(capacity: usize) -> Result<Self, CanonicalError> {
        if capacity < 1 {
            return Err(invalid_argument_error("Buffer capacity cannot be zero."));
        }
        Ok(RingBuf {
            data: vec![T::default(); capacity],
            idx: None,
            full: false,
            pushed: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Total number of elements ever pushed, not the live count.
    pub fn pushed(&self) -> usize {
        self.pushed
    }

    /// True once at least `capacity` elements have been written.
    pub fn is_full(&self) -> bool {
        self.full
    }

    /// Physical index of the last push, or -1 when empty.
    pub fn index(&self) -> i64 {
        match self.idx {
            Some(i) => i as i64,
            None => -1,
        }
    }

    /// O(1) write; overwrites the oldest slot once full.
    pub fn push(&mut self, value: T) {
        let next = match self.idx {
            Some(i) => (i + 1) % self.capacity(),
            None => 0,
        };
        self.data[next] = value;
        self.idx = Some(next);
        self.pushed += 1;
        if self.pushed >= self.capacity() {
            self.full = true;
        }
    }

    /// Element at logical offset `i` back from the most recent push (0 is
    /// the newest). Offsets at or beyond capacity are reduced modulo
    /// capacity, so an out-of-range offset aliases older data rather than
    /// failing. That policy is deliberate; callers wanting strict bounds
    /// should use absolute_at().
    pub fn at(&self, i: usize) -> Result<T, CanonicalError> {
        let idx = match self.idx {
            Some(idx) => idx,
            None => return Err(invalid_argument_error("Buffer is empty.")),
        };
        let i = i % self.capacity();
        let physical = (idx + self.capacity() - i) % self.capacity();
        Ok(self.data[physical])
    }

    /// Direct slot access at physical index `i`.
    pub fn absolute_at(&self, i: usize) -> Result<T, CanonicalError> {
        if i >= self.capacity() {
            return Err(invalid_argument_error("Index >= capacity, invalid."));
        }
        Ok(self.data[i])
    }

    /// Resets to empty without reallocating.
    pub fn clear(&mut self) {
        self.idx = None;
        self.full = false;
        self.pushed = 0;
        for slot in self.data.iter_mut() {
            *slot = T::default();
        }
    }

    /// Effective sample count for regression. `window` of None means "all
    /// currently available samples", computed as pushed % capacity. That
    /// modulo sizing is inherited behavior: when pushed is an exact multiple
    /// of capacity it yields zero and the fit fails. Preserved, not fixed.
    fn effective_window(&self, window: Option<usize>) -> usize {
        if self.pushed == 0 {
            return 0;
        }
        match window {
            None => self.pushed % self.capacity(),
            Some(0) => self.pushed % self.capacity(),
            Some(s) => (s % self.pushed) % self.capacity(),
        }
    }
}

impl<T: Copy + Default + Into<f64>> RingBuf<T> {
    /// Ordinary least-squares fit of buffer contents against their implicit
    /// sample index 0..n-1 (0 is the most recent sample). Returns None when
    /// fewer than 2 samples are available or the denominator is numerically
    /// zero.
    pub fn linear_regression(&self, window: Option<usize>) -> Option<LinearFit> {
        let n = self.effective_window(window);
        if n < 2 {
            return None;
        }
        let mut s_xy = 0f64;
        let mut s_y = 0f64;
        let mut s_y2 = 0f64;
        for i in 0..n {
            let y: f64 = self.at(i).ok()?.into();
            s_xy += i as f64 * y;
            s_y += y;
            s_y2 += y * y;
        }
        let nf = n as f64;
        let s_x = nf * (nf - 1.0) / 2.0; // sum of 0..n-1
        let s_x2 = nf * (nf - 1.0) * (2.0 * nf - 1.0) / 6.0; // sum of squares
        Self::solve_fit(nf, s_x, s_x2, s_xy, s_y, s_y2)
    }

    /// As linear_regression(), but fits against a second ring buffer
    /// supplying the independent variable. Sample i of `xaxis` pairs with
    /// sample i of self; the effective window is bounded by the smaller
    /// buffer's capacity and push count.
    pub fn linear_regression_against<U>(
        &self,
        xaxis: &RingBuf<U>,
        window: Option<usize>,
    ) -> Option<LinearFit>
    where
        U: Copy + Default + Into<f64>,
    {
        let pushed = self.pushed.min(xaxis.pushed);
        let capacity = self.capacity().min(xaxis.capacity());
        if pushed == 0 {
            return None;
        }
        let n = match window {
            None | Some(0) => pushed % capacity,
            Some(s) => (s % pushed) % capacity,
        };
        if n < 2 {
            return None;
        }
        let mut s_x = 0f64;
        let mut s_x2 = 0f64;
        let mut s_xy = 0f64;
        let mut s_y = 0f64;
        let mut s_y2 = 0f64;
        for i in 0..n {
            let x: f64 = xaxis.at(i).ok()?.into();
            let y: f64 = self.at(i).ok()?.into();
            s_x += x;
            s_x2 += x * x;
            s_xy += x * y;
            s_y += y;
            s_y2 += y * y;
        }
        Self::solve_fit(n as f64, s_x, s_x2, s_xy, s_y, s_y2)
    }

    fn solve_fit(n: f64, s_x: f64, s_x2: f64, s_xy: f64, s_y: f64, s_y2: f64)
                 -> Option<LinearFit> {
        let denom = n * s_x2 - s_x * s_x;
        if denom.abs() < DENOM_EPSILON {
            return None;
        }
        let slope = (n * s_xy - s_x * s_y) / denom;
        let intercept = (s_y * s_x2 - s_x * s_xy) / denom;
        let corr_denom = ((n * s_x2 - s_x * s_x) * (n * s_y2 - s_y * s_y)).sqrt();
        let correlation = if corr_denom.abs() < DENOM_EPSILON {
            0.0
        } else {
            (n * s_xy - s_x * s_y) / corr_denom
        };
        Some(LinearFit { slope, intercept, correlation })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_capacity_rejected() {
        assert!(RingBuf::<f64>::new(0).is_err());
    }

    #[test]
    fn at_zero_is_most_recent() {
        let mut buf = RingBuf::<i32>::new(4).unwrap();
        for v in [10, 20, 30, 40, 50, 60] {
            buf.push(v);
            assert_eq!(buf.at(0).unwrap(), v);
        }
        // at(k) is the value pushed (pushed-1-k) pushes ago.
        assert_eq!(buf.at(1).unwrap(), 50);
        assert_eq!(buf.at(2).unwrap(), 40);
        assert_eq!(buf.at(3).unwrap(), 30);
    }

    #[test]
    fn at_aliases_modulo_capacity() {
        let mut buf = RingBuf::<i32>::new(3).unwrap();
        buf.push(1);
        buf.push(2);
        buf.push(3);
        // Offset 3 wraps back to the newest element.
        assert_eq!(buf.at(3).unwrap(), buf.at(0).unwrap());
    }

    #[test]
    fn at_on_empty_is_an_error() {
        let buf = RingBuf::<i32>::new(3).unwrap();
        assert!(buf.at(0).is_err());
    }

    #[test]
    fn absolute_at_bounds() {
        let mut buf = RingBuf::<i32>::new(2).unwrap();
        buf.push(7);
        assert_eq!(buf.absolute_at(0).unwrap(), 7);
        assert_eq!(buf.absolute_at(1).unwrap(), 0);
        assert!(buf.absolute_at(2).is_err());
    }

    #[test]
    fn full_flag_and_pushed_counter() {
        let mut buf = RingBuf::<i32>::new(3).unwrap();
        buf.push(1);
        buf.push(2);
        assert!(!buf.is_full());
        buf.push(3); // capacity elements written in total
        assert!(buf.is_full());
        buf.push(4);
        assert_eq!(buf.pushed(), 4);
        buf.clear();
        assert!(!buf.is_full());
        assert_eq!(buf.pushed(), 0);
        assert_eq!(buf.index(), -1);
    }

    #[test]
    fn regression_needs_two_samples() {
        let mut buf = RingBuf::<f64>::new(8).unwrap();
        assert!(buf.linear_regression(None).is_none());
        buf.push(1.0);
        assert!(buf.linear_regression(None).is_none());
        buf.push(2.0);
        assert!(buf.linear_regression(None).is_some());
    }

    #[test]
    fn regression_recovers_linear_data() {
        let mut buf = RingBuf::<f64>::new(16).unwrap();
        // Pushing 10, 8, 6, 4, 2: sample offset 0 (newest) is 2, and each
        // step back in time adds 2, so slope against offset is +2.
        for v in [10.0, 8.0, 6.0, 4.0, 2.0] {
            buf.push(v);
        }
        let fit = buf.linear_regression(None).unwrap();
        assert!((fit.slope - 2.0).abs() < 1e-9);
        assert!((fit.intercept - 2.0).abs() < 1e-9);
        assert!((fit.correlation - 1.0).abs() < 1e-9);
    }

    #[test]
    fn regression_against_constant_x_fails() {
        let mut y = RingBuf::<f64>::new(8).unwrap();
        let mut x = RingBuf::<f64>::new(8).unwrap();
        for i in 0..5 {
            y.push(i as f64);
            x.push(3.0); // zero variance
        }
        assert!(y.linear_regression_against(&x, None).is_none());
    }

    #[test]
    fn regression_against_xaxis() {
        let mut y = RingBuf::<f64>::new(8).unwrap();
        let mut x = RingBuf::<f64>::new(8).unwrap();
        // y = 3x + 1 regardless of push order.
        for v in [0.0, 1.0, 2.0, 3.0, 4.0] {
            x.push(v);
            y.push(3.0 * v + 1.0);
        }
        let fit = y.linear_regression_against(&x, None).unwrap();
        assert!((fit.slope - 3.0).abs() < 1e-9);
        assert!((fit.intercept - 1.0).abs() < 1e-9);
    }

    // Inherited quirk: the effective window is pushed % capacity, so a
    // buffer that has wrapped an exact number of times reports zero
    // available samples and the fit fails even though the buffer is full.
    #[test]
    fn regression_window_quirk_on_exact_wrap() {
        let mut buf = RingBuf::<f64>::new(4).unwrap();
        for i in 0..8 {
            buf.push(i as f64);
        }
        assert!(buf.is_full());
        assert!(buf.linear_regression(None).is_none());
        // One more push and the window is usable again... with one sample,
        // which still fails; two more work.
        buf.push(8.0);
        assert!(buf.linear_regression(None).is_none());
        buf.push(9.0);
        assert!(buf.linear_regression(None).is_some());
    }

    #[test]
    fn explicit_window_is_reduced_to_available_data() {
        let mut buf = RingBuf::<f64>::new(8).unwrap();
        for v in [1.0, 2.0, 3.0] {
            buf.push(v);
        }
        // Requested window 2 <= available; plain two-point fit.
        let fit = buf.linear_regression(Some(2)).unwrap();
        assert!((fit.slope - (-1.0)).abs() < 1e-9);
    }
}
