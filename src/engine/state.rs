use serde::{Deserialize, Serialize};

/// Session lifecycle states
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Waiting for the platform binding
    Binding,
    /// Driver is opening the device on its worker
    Opening,
    Open,
    Closing,
    Closed,
    Failed { reason: String },
}

impl SessionState {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }

    /// Check if transition from current state to target state is valid
    pub fn can_transition_to(&self, target: &SessionState) -> bool {
        use SessionState::*;

        matches!(
            (self, target),
            // From Binding
            (Binding, Opening) |
            (Binding, Closing) |
            (Binding, Failed { .. }) |

            // From Opening
            (Opening, Open) |
            (Opening, Closing) |
            (Opening, Failed { .. }) |

            // From Open
            (Open, Closing) |
            (Open, Closed) |
            (Open, Failed { .. }) |

            // From Failed
            (Failed { .. }, Closing) |

            // From Closing
            (Closing, Closed)
        )
    }

    /// Get human-readable state name
    pub fn name(&self) -> &str {
        match self {
            Self::Binding => "Binding",
            Self::Opening => "Opening",
            Self::Open => "Open",
            Self::Closing => "Closing",
            Self::Closed => "Closed",
            Self::Failed { .. } => "Failed",
        }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::Binding
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let path = [
            SessionState::Binding,
            SessionState::Opening,
            SessionState::Open,
            SessionState::Closing,
            SessionState::Closed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(&pair[1]), "{:?}", pair);
        }
    }

    #[test]
    fn test_failure_reachable_before_close() {
        let failed = SessionState::failed("usb claim refused");
        assert!(SessionState::Binding.can_transition_to(&failed));
        assert!(SessionState::Opening.can_transition_to(&failed));
        assert!(SessionState::Open.can_transition_to(&failed));
        assert!(!SessionState::Closed.can_transition_to(&failed));
        assert!(failed.can_transition_to(&SessionState::Closing));
    }

    #[test]
    fn test_closed_is_final() {
        for target in [
            SessionState::Binding,
            SessionState::Opening,
            SessionState::Open,
            SessionState::Closing,
        ] {
            assert!(!SessionState::Closed.can_transition_to(&target));
        }
        assert!(!SessionState::Closing.can_transition_to(&SessionState::Open));
    }
}
