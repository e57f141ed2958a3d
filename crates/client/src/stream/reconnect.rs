use std::time::Duration;

use super::UNAUTHORIZED_CLOSE_CODE;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Linear backoff: retry `n` (starting at 1) waits `n * base_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_attempts,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

/// Why a link stopped being open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed with the reserved unauthorized code, or the handshake was refused for auth.
    Unauthorized,
    Remote { code: Option<u16>, reason: String },
    ConnectFailed(String),
    /// Torn down on request; never retried.
    Requested,
}

impl CloseReason {
    pub fn from_close(code: Option<u16>, reason: impl Into<String>) -> Self {
        if code == Some(UNAUTHORIZED_CLOSE_CODE) {
            return Self::Unauthorized;
        }
        Self::Remote {
            code,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Idle,
    Connecting {
        attempt: u32,
    },
    Open,
    Closed(CloseReason),
}

/// What the supervisor does after a close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    Retry { attempt: u32, delay: Duration },
    Unauthorized,
    Exhausted { attempts: u32 },
    Stop,
}

/// `Idle -> Connecting -> Open -> Closed(reason)` with the retry counter owned by the machine.
#[derive(Debug, Clone)]
pub struct Reconnector {
    policy: ReconnectPolicy,
    state: LinkState,
    retries: u32,
}

impl Reconnector {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: LinkState::Idle,
            retries: 0,
        }
    }

    pub fn state(&self) -> &LinkState {
        &self.state
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn begin_connect(&mut self) {
        self.state = LinkState::Connecting {
            attempt: self.retries,
        };
    }

    pub fn opened(&mut self) {
        self.retries = 0;
        self.state = LinkState::Open;
    }

    pub fn closed(&mut self, reason: CloseReason) -> ReconnectDecision {
        let decision = match &reason {
            CloseReason::Requested => ReconnectDecision::Stop,
            CloseReason::Unauthorized => ReconnectDecision::Unauthorized,
            CloseReason::Remote { .. } | CloseReason::ConnectFailed(_) => {
                if self.retries >= self.policy.max_attempts {
                    ReconnectDecision::Exhausted {
                        attempts: self.retries,
                    }
                } else {
                    self.retries += 1;
                    ReconnectDecision::Retry {
                        attempt: self.retries,
                        delay: self.policy.delay_for(self.retries),
                    }
                }
            }
        };
        self.state = LinkState::Closed(reason);
        decision
    }
}
