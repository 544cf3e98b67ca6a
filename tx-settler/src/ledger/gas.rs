/// Gas limit that ramps up after failed submissions and drops back to the minimum after a
/// successful one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GasLimitHolder {
    min: u64,
    max: u64,
    increment: u64,
    current: u64,
}

impl GasLimitHolder {
    /// `steps` failures in a row take the limit from `min` to `max`.
    pub fn new(min: u64, max: u64, steps: u64) -> Self {
        let max = max.max(min);
        let increment = (max - min).div_ceil(steps.max(1));

        GasLimitHolder {
            min,
            max,
            increment,
            current: min,
        }
    }

    pub fn gas_limit(&self) -> u64 {
        self.current
    }

    pub fn record_failure(&mut self) {
        self.current = self.current.saturating_add(self.increment).min(self.max);
    }

    pub fn record_success(&mut self) {
        self.current = self.min;
    }

    /// Adjust the limit to the outcome of the last submission
    pub fn update<T, E>(&mut self, outcome: &Result<T, E>) {
        match outcome {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ramps_up_to_max_and_resets() {
        let mut holder = GasLimitHolder::new(10, 21, 3);
        assert_eq!(holder.gas_limit(), 10);

        let failure: Result<(), &str> = Err("out of gas");
        let mut observed = Vec::new();
        for _ in 0..4 {
            holder.update(&failure);
            observed.push(holder.gas_limit());
        }
        assert_eq!(observed, vec![14, 18, 21, 21]);

        holder.update(&Ok::<(), &str>(()));
        assert_eq!(holder.gas_limit(), 10);
    }

    #[test]
    fn degenerate_ranges() {
        let mut fixed = GasLimitHolder::new(50_000, 50_000, 5);
        fixed.record_failure();
        assert_eq!(fixed.gas_limit(), 50_000);

        let mut no_steps = GasLimitHolder::new(100, 200, 0);
        no_steps.record_failure();
        assert_eq!(no_steps.gas_limit(), 200);
    }
}
