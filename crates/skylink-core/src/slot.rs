use std::sync::{Arc, PoisonError, RwLock};

/// The current vehicle connection, if any.
///
/// Written only by the bridge loop on (re)connect and on loss. Readers get a
/// cloned `Arc` of a fully built link or `None`, never a link mid-construction.
pub struct LinkSlot<L> {
    inner: RwLock<Option<Arc<L>>>,
}

impl<L> LinkSlot<L> {
    pub fn new() -> Self {
        Self { inner: RwLock::new(None) }
    }

    pub fn install(&self, link: Arc<L>) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Some(link);
    }

    pub fn clear(&self) -> Option<Arc<L>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner).take()
    }

    pub fn current(&self) -> Option<Arc<L>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).is_some()
    }
}

impl<L> Default for LinkSlot<L> {
    fn default() -> Self {
        Self::new()
    }
}
