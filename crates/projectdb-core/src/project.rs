//! The document side of a connection.
//!
//! A [`Project`] owns a type-keyed registry of attached components (one slot
//! per component type, created on first access) and a queue of deferred calls
//! that its owning thread drains with [`Project::dispatch_pending`]. Background
//! threads never call into the project directly; they post with
//! [`Project::call_after`] and the owning thread runs the call later.

use std::any::{Any, TypeId};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, ThreadId};

type Deferred = Box<dyn FnOnce() + Send>;
type Slot = Arc<dyn Any + Send + Sync>;

/// A component that lives in one of a project's attachment slots.
pub trait Attachment: Any + Send + Sync {
    /// Build the component the first time the slot is requested.
    fn attach(project: &Arc<Project>) -> Self
    where
        Self: Sized;
}

/// An open document.
pub struct Project {
    name: String,
    owner: ThreadId,
    attachments: Mutex<HashMap<TypeId, Slot>>,
    deferred: Mutex<VecDeque<Deferred>>,
}

impl Project {
    /// Create a project owned by the calling thread.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            owner: thread::current().id(),
            attachments: Mutex::new(HashMap::new()),
            deferred: Mutex::new(VecDeque::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The thread that created the project and drains its deferred calls.
    pub fn owner_thread(&self) -> ThreadId {
        self.owner
    }

    /// Queue `f` to run on the owning thread at its next dispatch.
    pub fn call_after(&self, f: impl FnOnce() + Send + 'static) {
        self.deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Box::new(f));
    }

    /// Number of deferred calls waiting for dispatch.
    pub fn pending_calls(&self) -> usize {
        self.deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Run the calls queued so far on the current thread; returns how many ran.
    ///
    /// Calls queued while dispatching wait for the next dispatch.
    pub fn dispatch_pending(&self) -> usize {
        if thread::current().id() != self.owner {
            tracing::warn!(project = %self.name, "deferred calls dispatched off the owning thread");
        }
        let batch: Vec<Deferred> = self
            .deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let count = batch.len();
        for call in batch {
            call();
        }
        count
    }

    /// The `T` slot of this project, created on first access.
    pub fn attachment<T: Attachment>(self: &Arc<Self>) -> Arc<T> {
        if let Some(existing) = self.lookup::<T>() {
            return existing;
        }
        // Built without the registry lock so `attach` may reach other slots.
        let created: Slot = Arc::new(T::attach(self));
        let slot = Arc::clone(
            self.attachments
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(TypeId::of::<T>())
                .or_insert(created),
        );
        match slot.downcast::<T>() {
            Ok(typed) => typed,
            Err(_) => unreachable!("attachment slot keyed by TypeId holds another type"),
        }
    }

    /// The `T` slot if it was already created.
    pub fn lookup<T: Attachment>(&self) -> Option<Arc<T>> {
        let slot = self
            .attachments
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&TypeId::of::<T>())
            .cloned()?;
        slot.downcast::<T>().ok()
    }

    /// Remove the `T` slot, returning it if present.
    pub fn detach<T: Attachment>(&self) -> Option<Arc<T>> {
        let slot = self
            .attachments
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&TypeId::of::<T>())?;
        slot.downcast::<T>().ok()
    }
}

impl fmt::Debug for Project {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Project")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("pending_calls", &self.pending_calls())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        hits: AtomicUsize,
    }

    impl Attachment for Counter {
        fn attach(_project: &Arc<Project>) -> Self {
            Self {
                hits: AtomicUsize::new(0),
            }
        }
    }

    #[test]
    fn attachment_is_created_once() {
        let project = Project::new("song");
        assert!(project.lookup::<Counter>().is_none());

        let first = project.attachment::<Counter>();
        first.hits.fetch_add(1, Ordering::SeqCst);
        let second = project.attachment::<Counter>();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.hits.load(Ordering::SeqCst), 1);

        assert!(project.detach::<Counter>().is_some());
        assert!(project.lookup::<Counter>().is_none());
    }

    #[test]
    fn deferred_calls_run_on_dispatching_thread() {
        let project = Project::new("song");
        let ran_on = Arc::new(Mutex::new(None));

        let worker_project = Arc::clone(&project);
        let slot = Arc::clone(&ran_on);
        thread::spawn(move || {
            worker_project.call_after(move || {
                *slot.lock().unwrap() = Some(thread::current().id());
            });
        })
        .join()
        .unwrap();

        assert_eq!(project.pending_calls(), 1);
        assert!(ran_on.lock().unwrap().is_none());

        assert_eq!(project.dispatch_pending(), 1);
        assert_eq!(*ran_on.lock().unwrap(), Some(thread::current().id()));
        assert_eq!(project.dispatch_pending(), 0);
    }
}
