//! Process-wide custody of shared heavyweight objects.
//!
//! Embedding models, tokenizers, and word lists are expensive to construct
//! and read-only once loaded, so one copy serves every engine in the
//! process. The manager hands them out as `Arc<dyn Resource>`; callers
//! downcast through [`Resource::as_any`].
//!
//! Lifecycle: scopes are reference-counted. [`ResourceManager::open`]
//! returns an RAII guard; resources load lazily inside an open scope and are
//! unloaded when the last guard drops, including on unwind. Concurrent
//! [`ResourceManager::get`] calls are safe; callers serialize lifecycle
//! transitions themselves.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock};

use tracing::{debug, info};

use crate::error::{CoreError, Result};

/// A shared capability managed by the [`ResourceManager`].
pub trait Resource: Send + Sync {
    /// Identifier the resource is registered under.
    fn identifier(&self) -> &str;

    /// Release anything the resource holds. Called once, when the last open
    /// scope closes.
    fn unload(&self) {}

    /// Downcast hook for callers that know the concrete type.
    fn as_any(&self) -> &dyn Any;
}

type Factory = Box<dyn Fn() -> Result<Arc<dyn Resource>> + Send + Sync>;

#[derive(Default)]
struct ManagerState {
    open_count: usize,
    factories: HashMap<String, Factory>,
    loaded: HashMap<String, Arc<dyn Resource>>,
}

fn state() -> &'static Mutex<ManagerState> {
    static STATE: OnceLock<Mutex<ManagerState>> = OnceLock::new();
    STATE.get_or_init(|| Mutex::new(ManagerState::default()))
}

/// The process-wide resource manager.
///
/// All operations are associated functions on this unit type; there is one
/// manager per process.
pub struct ResourceManager;

impl ResourceManager {
    /// Open a resource scope. Idempotent: nested scopes share the loaded
    /// resources and only the last guard to drop unloads them.
    pub fn open() -> ResourceScope {
        let mut state = state().lock().expect("resource manager poisoned");
        state.open_count += 1;
        debug!(open_count = state.open_count, "opened resource scope");
        ResourceScope { _private: () }
    }

    /// Whether at least one scope is currently open.
    pub fn is_open() -> bool {
        state().lock().expect("resource manager poisoned").open_count > 0
    }

    /// Register a factory for a resource identifier. Replaces any previous
    /// factory under the same identifier; an already-loaded instance is kept.
    pub fn register(
        id: impl Into<String>,
        factory: impl Fn() -> Result<Arc<dyn Resource>> + Send + Sync + 'static,
    ) {
        let id = id.into();
        let mut state = state().lock().expect("resource manager poisoned");
        state.factories.insert(id, Box::new(factory));
    }

    /// Fetch a resource, loading it on first use within the open scope.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ResourceUnavailable`] when no scope is open or
    /// no factory is registered for the identifier.
    pub fn get(id: &str) -> Result<Arc<dyn Resource>> {
        let mut state = state().lock().expect("resource manager poisoned");
        if state.open_count == 0 {
            return Err(CoreError::ResourceUnavailable(id.to_string()));
        }
        if let Some(resource) = state.loaded.get(id) {
            return Ok(Arc::clone(resource));
        }
        let factory = state
            .factories
            .get(id)
            .ok_or_else(|| CoreError::ResourceUnavailable(id.to_string()))?;
        let resource = factory()?;
        info!(resource = id, "loaded resource");
        state.loaded.insert(id.to_string(), Arc::clone(&resource));
        Ok(resource)
    }

    fn close_scope() {
        let mut state = state().lock().expect("resource manager poisoned");
        state.open_count = state.open_count.saturating_sub(1);
        if state.open_count == 0 {
            for (id, resource) in state.loaded.drain() {
                debug!(resource = %id, "unloading resource");
                resource.unload();
            }
            info!("closed last resource scope, all resources unloaded");
        }
    }
}

/// RAII guard for an open resource scope. Dropping it closes the scope on
/// every exit path, including unwinds.
pub struct ResourceScope {
    _private: (),
}

impl ResourceScope {
    /// Close the scope explicitly. Equivalent to dropping the guard.
    pub fn close(self) {}
}

impl Drop for ResourceScope {
    fn drop(&mut self) {
        ResourceManager::close_scope();
    }
}

/// English stopword list, shared by label normalization and display code.
pub struct StopwordsResource {
    words: HashSet<&'static str>,
}

const EN_STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "been", "by", "for", "from", "in", "is", "it",
    "its", "of", "on", "or", "that", "the", "this", "to", "was", "were", "with",
];

impl StopwordsResource {
    /// Identifier the stopword list is registered under.
    pub const IDENTIFIER: &'static str = "stopwords-en";

    /// Register the stopword factory with the resource manager.
    pub fn register() {
        ResourceManager::register(Self::IDENTIFIER, || {
            Ok(Arc::new(StopwordsResource { words: EN_STOPWORDS.iter().copied().collect() }))
        });
    }

    /// Whether a word is a stopword (case-insensitive).
    pub fn contains(&self, word: &str) -> bool {
        self.words.contains(word.to_ascii_lowercase().as_str())
    }
}

impl Resource for StopwordsResource {
    fn identifier(&self) -> &str {
        Self::IDENTIFIER
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
