use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
}

/// Opens after `threshold` consecutive failures. Once open it stays open
/// until a success or an explicit reset, depending on how the owner uses it.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreaker {
    pub state: CircuitState,
    pub failures: u32,
    pub threshold: u32,
    pub trips: u64,
    pub last_reason: Option<String>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            threshold: threshold.max(1),
            trips: 0,
            last_reason: None,
        }
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.state = CircuitState::Closed;
    }

    pub fn record_failure(&mut self, reason: &str) {
        self.failures += 1;
        if self.failures >= self.threshold {
            self.open(reason);
        }
    }

    /// Open immediately, regardless of the failure count.
    pub fn trip(&mut self, reason: &str) {
        self.failures = self.failures.max(self.threshold);
        self.open(reason);
    }

    fn open(&mut self, reason: &str) {
        if self.state == CircuitState::Closed {
            self.trips += 1;
        }
        self.state = CircuitState::Open;
        self.last_reason = Some(reason.to_string());
    }

    pub fn reset(&mut self) {
        self.failures = 0;
        self.state = CircuitState::Closed;
        self.last_reason = None;
    }

    pub fn allow(&self) -> bool {
        self.state == CircuitState::Closed
    }
}
