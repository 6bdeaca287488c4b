use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use crate::storage::models::HistoryItem;

pub type AppendHook = Arc<dyn Fn(&HistoryItem) + Send + Sync>;

/// Optional hook fired after each persisted item so a view can append it
/// without re-querying. Without a hook, notifying does nothing.
#[derive(Default)]
pub struct UiNotifier {
    hook: RwLock<Option<AppendHook>>,
}

impl fmt::Debug for UiNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UiNotifier")
            .field("attached", &self.is_attached())
            .finish()
    }
}

impl UiNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, hook: impl Fn(&HistoryItem) + Send + Sync + 'static) {
        *self.hook.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(hook));
    }

    pub fn detach(&self) {
        *self.hook.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn is_attached(&self) -> bool {
        self.hook
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn notify(&self, item: &HistoryItem) {
        // Clone out so the hook may attach/detach without deadlocking.
        let hook = self
            .hook
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hook) = hook {
            hook(item);
        }
    }
}
