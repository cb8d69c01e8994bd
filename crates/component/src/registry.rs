//! Candidate components for a role across every registered native core.
use std::{collections::HashMap, fmt, sync::Arc};

use tracing::debug;

use crate::{native::NativeBackend, quirks::QuirkTable};

/// One component that could serve a role.
#[derive(Clone)]
pub struct Candidate {
    pub backend: Arc<dyn NativeBackend>,
    pub name: String,
}

impl fmt::Debug for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Candidate")
            .field("backend", &self.backend.name())
            .field("name", &self.name)
            .finish()
    }
}

/// Registered native cores plus the policy used to order their components.
///
/// Candidates are sorted by explicit priority (lower first), then hardware cores ahead
/// of software ones when hardware bias is on, then by name. Blacklisted names are dropped
/// unless the blacklist is disabled.
///
/// # Example
/// ```rust
/// use ilkit_component::registry::ComponentRegistry;
///
/// let registry = ComponentRegistry::new()
///     .with_priority("OMX.vendor.avc", -10)
///     .with_blacklist(false);
/// assert!(registry.candidates("video_decoder.avc").is_empty());
/// ```
#[derive(Clone)]
pub struct ComponentRegistry {
    backends: Vec<Arc<dyn NativeBackend>>,
    priorities: HashMap<String, i32>,
    prefer_hardware: bool,
    use_blacklist: bool,
    quirks: Arc<QuirkTable>,
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self {
            backends: Vec::new(),
            priorities: HashMap::new(),
            prefer_hardware: true,
            use_blacklist: true,
            quirks: Arc::new(QuirkTable::builtin()),
        }
    }

    pub fn register(&mut self, backend: Arc<dyn NativeBackend>) {
        self.backends.push(backend);
    }

    pub fn with_backend(mut self, backend: Arc<dyn NativeBackend>) -> Self {
        self.register(backend);
        self
    }

    /// Explicit priority for a component name (lower wins).
    pub fn with_priority(mut self, component: &str, priority: i32) -> Self {
        self.priorities
            .insert(component.to_ascii_lowercase(), priority);
        self
    }

    pub fn with_priorities<I, S>(mut self, priorities: I) -> Self
    where
        I: IntoIterator<Item = (S, i32)>,
        S: AsRef<str>,
    {
        self.priorities.extend(
            priorities
                .into_iter()
                .map(|(name, prio)| (name.as_ref().to_ascii_lowercase(), prio)),
        );
        self
    }

    pub fn with_hardware_bias(mut self, prefer: bool) -> Self {
        self.prefer_hardware = prefer;
        self
    }

    pub fn with_blacklist(mut self, enabled: bool) -> Self {
        self.use_blacklist = enabled;
        self
    }

    pub fn with_quirks(mut self, quirks: QuirkTable) -> Self {
        self.quirks = Arc::new(quirks);
        self
    }

    pub fn quirks(&self) -> &Arc<QuirkTable> {
        &self.quirks
    }

    pub fn backends(&self) -> &[Arc<dyn NativeBackend>] {
        &self.backends
    }

    /// Components implementing `role`, best first.
    pub fn candidates(&self, role: &str) -> Vec<Candidate> {
        let mut list: Vec<Candidate> = self
            .backends
            .iter()
            .flat_map(|backend| {
                backend
                    .components_of_role(role)
                    .into_iter()
                    .map(move |name| Candidate {
                        backend: Arc::clone(backend),
                        name,
                    })
            })
            .filter(|c| {
                let blocked = self.use_blacklist && self.quirks.is_blacklisted(&c.name);
                if blocked {
                    debug!(component = %c.name, role, "skipping blacklisted component");
                }
                !blocked
            })
            .collect();
        list.sort_by_key(|c| {
            let name = c.name.to_ascii_lowercase();
            let prio = self.priorities.get(&name).copied().unwrap_or(i32::MAX);
            let hw_bias = if self.prefer_hardware && c.backend.is_hardware() {
                0
            } else {
                1
            };
            (prio, hw_bias, name)
        });
        list
    }
}

impl fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field(
                "backends",
                &self.backends.iter().map(|b| b.name()).collect::<Vec<_>>(),
            )
            .field("priorities", &self.priorities)
            .field("prefer_hardware", &self.prefer_hardware)
            .field("use_blacklist", &self.use_blacklist)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::{ErrorCode, NativeCallbacks, NativeComponent};

    struct Listing {
        name: &'static str,
        hardware: bool,
        components: Vec<&'static str>,
    }

    impl NativeBackend for Listing {
        fn name(&self) -> &str {
            self.name
        }
        fn is_hardware(&self) -> bool {
            self.hardware
        }
        fn init(&self) -> Result<(), ErrorCode> {
            Ok(())
        }
        fn deinit(&self) {}
        fn components_of_role(&self, _role: &str) -> Vec<String> {
            self.components.iter().map(|c| c.to_string()).collect()
        }
        fn get_handle(
            &self,
            _component: &str,
            _callbacks: Arc<dyn NativeCallbacks>,
        ) -> Result<Box<dyn NativeComponent>, ErrorCode> {
            Err(ErrorCode::ComponentNotFound)
        }
        fn free_handle(&self, _component: Box<dyn NativeComponent>) -> Result<(), ErrorCode> {
            Ok(())
        }
    }

    fn registry() -> ComponentRegistry {
        ComponentRegistry::new()
            .with_backend(Arc::new(Listing {
                name: "soft",
                hardware: false,
                components: vec!["OMX.aaa.avc", "OMX.google.h264.decoder"],
            }))
            .with_backend(Arc::new(Listing {
                name: "hard",
                hardware: true,
                components: vec!["OMX.zzz.avc", "OMX.qcom.video.decoder.avc.secure"],
            }))
    }

    #[test]
    fn hardware_first_blacklist_dropped() {
        let names: Vec<String> = registry()
            .candidates("video_decoder.avc")
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, ["OMX.zzz.avc", "OMX.aaa.avc"]);
    }

    #[test]
    fn priority_beats_hardware_bias() {
        let names: Vec<String> = registry()
            .with_priority("OMX.aaa.avc", 0)
            .candidates("video_decoder.avc")
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names[0], "OMX.aaa.avc");
    }

    #[test]
    fn blacklist_can_be_disabled() {
        let list = registry()
            .with_blacklist(false)
            .with_hardware_bias(false)
            .candidates("video_decoder.avc");
        assert_eq!(list.len(), 4);
        assert_eq!(list[0].name, "OMX.aaa.avc");
    }
}
