//! Process-wide init/deinit refcount of native cores.
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, OnceLock},
};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::{ComponentError, Result, native::NativeBackend};

static CORE_USERS: OnceLock<Mutex<HashMap<String, usize>>> = OnceLock::new();

fn users() -> &'static Mutex<HashMap<String, usize>> {
    CORE_USERS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Keeps a native core initialized while alive.
///
/// The first guard for a backend calls [`NativeBackend::init`]; dropping the last one
/// calls [`NativeBackend::deinit`]. Acquisition and release are serialized under one
/// lock, so a concurrent first open and last close cannot interleave init and deinit.
pub struct CoreGuard {
    backend: Arc<dyn NativeBackend>,
}

impl CoreGuard {
    pub fn acquire(backend: &Arc<dyn NativeBackend>) -> Result<Self> {
        let mut map = users().lock();
        let count = map.entry(backend.name().to_owned()).or_insert(0);
        if *count == 0 {
            backend
                .init()
                .map_err(|code| ComponentError::native("core init", code))?;
            info!(backend = backend.name(), "native core initialized");
        }
        *count += 1;
        debug!(backend = backend.name(), users = *count, "native core acquired");
        Ok(Self {
            backend: Arc::clone(backend),
        })
    }

    pub fn backend(&self) -> &Arc<dyn NativeBackend> {
        &self.backend
    }

    /// Current number of guards for the backend named `name`.
    pub fn users(name: &str) -> usize {
        users().lock().get(name).copied().unwrap_or(0)
    }
}

impl Drop for CoreGuard {
    fn drop(&mut self) {
        let mut map = users().lock();
        let name = self.backend.name();
        if let Some(count) = map.get_mut(name) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                map.remove(name);
                self.backend.deinit();
                info!(backend = name, "native core deinitialized");
            }
        }
    }
}

impl fmt::Debug for CoreGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreGuard")
            .field("backend", &self.backend.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::{ErrorCode, NativeCallbacks, NativeComponent};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingBackend {
        name: &'static str,
        inits: AtomicUsize,
        deinits: AtomicUsize,
        fail: bool,
    }

    impl CountingBackend {
        fn new(name: &'static str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                inits: AtomicUsize::new(0),
                deinits: AtomicUsize::new(0),
                fail,
            })
        }
    }

    impl NativeBackend for CountingBackend {
        fn name(&self) -> &str {
            self.name
        }
        fn init(&self) -> std::result::Result<(), ErrorCode> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ErrorCode::InsufficientResources)
            } else {
                Ok(())
            }
        }
        fn deinit(&self) {
            self.deinits.fetch_add(1, Ordering::SeqCst);
        }
        fn components_of_role(&self, _role: &str) -> Vec<String> {
            Vec::new()
        }
        fn get_handle(
            &self,
            _component: &str,
            _callbacks: Arc<dyn NativeCallbacks>,
        ) -> std::result::Result<Box<dyn NativeComponent>, ErrorCode> {
            Err(ErrorCode::ComponentNotFound)
        }
        fn free_handle(
            &self,
            _component: Box<dyn NativeComponent>,
        ) -> std::result::Result<(), ErrorCode> {
            Ok(())
        }
    }

    #[test]
    fn init_once_deinit_on_last_drop() {
        let counting = CountingBackend::new("core-test-refcount", false);
        let backend: Arc<dyn NativeBackend> = counting.clone();
        let a = CoreGuard::acquire(&backend).unwrap();
        let b = CoreGuard::acquire(&backend).unwrap();
        assert_eq!(counting.inits.load(Ordering::SeqCst), 1);
        assert_eq!(CoreGuard::users("core-test-refcount"), 2);
        drop(a);
        assert_eq!(counting.deinits.load(Ordering::SeqCst), 0);
        drop(b);
        assert_eq!(counting.deinits.load(Ordering::SeqCst), 1);
        assert_eq!(CoreGuard::users("core-test-refcount"), 0);
    }

    #[test]
    fn failed_init_leaves_no_user() {
        let counting = CountingBackend::new("core-test-failing", true);
        let backend: Arc<dyn NativeBackend> = counting.clone();
        assert!(CoreGuard::acquire(&backend).is_err());
        assert!(CoreGuard::acquire(&backend).is_err());
        assert_eq!(counting.inits.load(Ordering::SeqCst), 2);
        assert_eq!(counting.deinits.load(Ordering::SeqCst), 0);
    }
}
