//! Deterministic routing decisions for a step and for a dispatch call.

/// Which state a step enters after the entry checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
    /// `depth >= max_depth`; terminal, never dispatches.
    DepthExceeded,
    /// Synthetic single action; always converges.
    Mock,
    /// Parse a structured response and optionally act on it.
    Structured,
    /// Legacy heuristics when no structured input is available.
    Unstructured,
}

/// Policy inputs for [`select_step_mode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepPolicy {
    pub max_depth: u32,
    pub mock_mode: bool,
    pub enforce_structured: bool,
    /// A stub or a live completion backend can produce a response.
    pub source_available: bool,
}

/// Route a step: depth check, then mock, then structured, then fallback.
pub fn select_step_mode(depth: u32, policy: &StepPolicy) -> StepMode {
    if depth >= policy.max_depth {
        return StepMode::DepthExceeded;
    }
    if policy.mock_mode {
        return StepMode::Mock;
    }
    if policy.enforce_structured && policy.source_available {
        return StepMode::Structured;
    }
    StepMode::Unstructured
}

/// Execution channel for one dispatch call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Remote,
    Local,
    Mock,
    Bare,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Remote => "remote",
            Channel::Local => "local",
            Channel::Mock => "mock",
            Channel::Bare => "bare",
        }
    }
}

/// Strict priority chain: remote, then local, then mock, then bare.
///
/// Enabling one channel never enables a broader one; the choice is one-shot.
pub fn select_channel(remote_enabled: bool, local_enabled: bool, mock_mode: bool) -> Channel {
    if remote_enabled {
        Channel::Remote
    } else if local_enabled {
        Channel::Local
    } else if mock_mode {
        Channel::Mock
    } else {
        Channel::Bare
    }
}
