//! Handler slots shared between the facade and the reader threads.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Receives decoded text from stdout, stderr or the console.
pub type TextHandler = Box<dyn FnMut(&str) + Send + 'static>;

/// Receives the exit code when the emulator is reaped.
pub type ExitHandler = Box<dyn FnMut(i32) + Send + 'static>;

/// A single replaceable handler.
pub(crate) struct Slot<T> {
    inner: Arc<Mutex<Option<T>>>,
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(None)),
        }
    }
}

impl<T> Slot<T> {
    /// Install `handler`, dropping whatever was registered before.
    ///
    /// May be called from inside a running handler; the new handler takes
    /// over from the next invocation.
    pub(crate) fn replace(&self, handler: T) {
        *self.lock() = Some(handler);
    }

    #[cfg(test)]
    pub(crate) fn is_set(&self) -> bool {
        self.lock().is_some()
    }

    /// Run `f` on the registered handler, if any. Returns whether one ran.
    ///
    /// The handler is taken out of the slot for the call, so the slot is not
    /// locked while user code runs.
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let handler = self.lock().take()?;
        let mut lent = Lent {
            slot: self,
            handler: Some(handler),
        };
        lent.handler.as_mut().map(f)
    }

    // A panic elsewhere while locked leaves the slot usable.
    fn lock(&self) -> MutexGuard<'_, Option<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Puts a handler back when its call returns or unwinds.
struct Lent<'a, T> {
    slot: &'a Slot<T>,
    handler: Option<T>,
}

impl<T> Drop for Lent<'_, T> {
    fn drop(&mut self) {
        let mut current = self.slot.lock();
        // One registered during the call wins.
        if current.is_none() {
            *current = self.handler.take();
        }
    }
}

/// The four callback slots of a launcher.
#[derive(Clone, Default)]
pub(crate) struct CallbackRegistry {
    pub(crate) stdout: Slot<TextHandler>,
    pub(crate) stderr: Slot<TextHandler>,
    pub(crate) console: Slot<TextHandler>,
    pub(crate) exit: Slot<ExitHandler>,
}

impl CallbackRegistry {
    pub(crate) fn notify_exit(&self, code: i32) {
        self.exit.with(|handler| handler(code));
    }
}
