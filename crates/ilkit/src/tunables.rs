use std::{sync::OnceLock, time::Duration};

use ilkit_component::{registry::ComponentRegistry, session::SessionConfig};
use parking_lot::Mutex;

/// Default wait for a command completion (milliseconds).
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 1_000;
/// Default single wait for a free input buffer (milliseconds).
pub const DEFAULT_INPUT_WAIT_STEP_MS: u64 = 10;
/// Default total wait for a free input buffer per submission (milliseconds).
pub const DEFAULT_INPUT_DEADLINE_MS: u64 = 1_000;
/// Default single wait for a filled output buffer (milliseconds).
pub const DEFAULT_OUTPUT_WAIT_STEP_MS: u64 = 10;
/// Default number of back-to-back input timeouts tolerated.
pub const DEFAULT_MAX_CONSECUTIVE_TIMEOUTS: u32 = 3;

/// Timing tunables snapshotted into every new session.
///
/// # Example
/// ```rust
/// use ilkit::prelude::*;
///
/// set_session_tunables(SessionTunables {
///     command_timeout_ms: 2_000,
///     ..SessionTunables::default()
/// });
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SessionTunables {
    pub command_timeout_ms: u64,
    pub input_wait_step_ms: u64,
    pub input_deadline_ms: u64,
    pub output_wait_step_ms: u64,
    pub max_consecutive_timeouts: u32,
}

impl Default for SessionTunables {
    fn default() -> Self {
        Self {
            command_timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
            input_wait_step_ms: DEFAULT_INPUT_WAIT_STEP_MS,
            input_deadline_ms: DEFAULT_INPUT_DEADLINE_MS,
            output_wait_step_ms: DEFAULT_OUTPUT_WAIT_STEP_MS,
            max_consecutive_timeouts: DEFAULT_MAX_CONSECUTIVE_TIMEOUTS,
        }
    }
}

impl SessionTunables {
    fn sanitized(self) -> Self {
        let step = self.input_wait_step_ms.max(1);
        Self {
            command_timeout_ms: self.command_timeout_ms.max(1),
            input_wait_step_ms: step,
            input_deadline_ms: self.input_deadline_ms.max(step),
            output_wait_step_ms: self.output_wait_step_ms.max(1),
            max_consecutive_timeouts: self.max_consecutive_timeouts.max(1),
        }
    }

    /// Per-session configuration with these values.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            command_timeout: Duration::from_millis(self.command_timeout_ms),
            input_wait_step: Duration::from_millis(self.input_wait_step_ms),
            input_deadline: Duration::from_millis(self.input_deadline_ms),
            output_wait_step: Duration::from_millis(self.output_wait_step_ms),
            max_consecutive_timeouts: self.max_consecutive_timeouts,
        }
    }
}

/// Component selection tunables applied on top of a registry at open time.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SelectionTunables {
    pub use_blacklist: bool,
    pub prefer_hardware: bool,
    /// Component name and priority; lower is tried first.
    pub priorities: Vec<(String, i32)>,
}

impl Default for SelectionTunables {
    fn default() -> Self {
        Self {
            use_blacklist: true,
            prefer_hardware: true,
            priorities: Vec::new(),
        }
    }
}

impl SelectionTunables {
    pub(crate) fn configure(&self, registry: &ComponentRegistry) -> ComponentRegistry {
        registry
            .clone()
            .with_blacklist(self.use_blacklist)
            .with_hardware_bias(self.prefer_hardware)
            .with_priorities(self.priorities.iter().map(|(name, prio)| (name.as_str(), *prio)))
    }
}

static SESSION_TUNABLES: OnceLock<Mutex<SessionTunables>> = OnceLock::new();
static SELECTION_TUNABLES: OnceLock<Mutex<SelectionTunables>> = OnceLock::new();

/// Override session timing process-wide. Sessions already open keep their snapshot.
pub fn set_session_tunables(tunables: SessionTunables) {
    let lock = SESSION_TUNABLES.get_or_init(|| Mutex::new(SessionTunables::default()));
    *lock.lock() = tunables.sanitized();
}

/// Override component selection process-wide.
pub fn set_selection_tunables(tunables: SelectionTunables) {
    let lock = SELECTION_TUNABLES.get_or_init(|| Mutex::new(SelectionTunables::default()));
    *lock.lock() = tunables;
}

pub fn session_tunables() -> SessionTunables {
    SESSION_TUNABLES
        .get()
        .map(|t| *t.lock())
        .unwrap_or_default()
}

pub(crate) fn session_config() -> SessionConfig {
    session_tunables().session_config()
}

/// Selection overrides, when any were set.
pub(crate) fn selection_overrides() -> Option<SelectionTunables> {
    SELECTION_TUNABLES.get().map(|t| t.lock().clone())
}

/// Builder for process-wide ilkit tunables.
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use ilkit::prelude::*;
///
/// IlkitConfig::new()
///     .command_timeout(Duration::from_millis(1_500))
///     .input_wait(Duration::from_millis(5), Duration::from_millis(500))
///     .priority("OMX.vendor.avc.decoder", -5)
///     .apply();
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct IlkitConfig {
    session: SessionTunables,
    selection: SelectionTunables,
}

impl IlkitConfig {
    /// Start building a new configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.session.command_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Single wait step and total deadline when no input buffer is free.
    pub fn input_wait(mut self, step: Duration, deadline: Duration) -> Self {
        self.session.input_wait_step_ms = step.as_millis() as u64;
        self.session.input_deadline_ms = deadline.as_millis() as u64;
        self
    }

    pub fn output_wait_step(mut self, step: Duration) -> Self {
        self.session.output_wait_step_ms = step.as_millis() as u64;
        self
    }

    pub fn max_consecutive_timeouts(mut self, count: u32) -> Self {
        self.session.max_consecutive_timeouts = count;
        self
    }

    /// Skip known-broken components (on by default).
    pub fn blacklist(mut self, enabled: bool) -> Self {
        self.selection.use_blacklist = enabled;
        self
    }

    /// Try hardware cores before software ones (on by default).
    pub fn hardware_bias(mut self, prefer: bool) -> Self {
        self.selection.prefer_hardware = prefer;
        self
    }

    pub fn priority(mut self, component: impl Into<String>, priority: i32) -> Self {
        self.selection.priorities.push((component.into(), priority));
        self
    }

    /// Snapshot of the session part, without applying it.
    pub fn session(&self) -> SessionConfig {
        self.session.sanitized().session_config()
    }

    /// Apply the configuration to global tunables.
    pub fn apply(self) {
        set_session_tunables(self.session);
        set_selection_tunables(self.selection);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizing_keeps_waits_usable() {
        let t = SessionTunables {
            command_timeout_ms: 0,
            input_wait_step_ms: 0,
            input_deadline_ms: 0,
            output_wait_step_ms: 0,
            max_consecutive_timeouts: 0,
        }
        .sanitized();
        assert_eq!(t.command_timeout_ms, 1);
        assert_eq!(t.input_deadline_ms, t.input_wait_step_ms);
        assert_eq!(t.max_consecutive_timeouts, 1);
    }

    #[test]
    fn builder_snapshot_matches_defaults() {
        let config = IlkitConfig::new().session();
        assert_eq!(config, SessionConfig::default());
        let tuned = IlkitConfig::new()
            .input_wait(Duration::from_millis(20), Duration::from_millis(5))
            .session();
        assert_eq!(tuned.input_deadline, Duration::from_millis(20));
    }

    #[test]
    fn selection_configures_a_registry_copy() {
        let base = ComponentRegistry::new();
        let tuned = SelectionTunables {
            use_blacklist: false,
            prefer_hardware: false,
            priorities: vec![("OMX.a".into(), 1)],
        }
        .configure(&base);
        assert!(format!("{tuned:?}").contains("use_blacklist: false"));
        assert!(format!("{base:?}").contains("use_blacklist: true"));
    }
}
