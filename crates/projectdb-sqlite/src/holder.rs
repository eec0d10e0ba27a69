//! The per-project connection slot.

use crate::connection::{Connection, OpenStatus};
use projectdb_core::{Attachment, ConnectionConfig, Project, Result};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Holds the connection of one project, plus an optional saved one.
///
/// Redirecting a project to another file is a slot assignment; the
/// connection being replaced is always closed before it is dropped.
pub struct ConnectionHolder {
    project: Weak<Project>,
    active: Mutex<Option<Connection>>,
    saved: Mutex<Option<Connection>>,
}

impl Attachment for ConnectionHolder {
    fn attach(project: &Arc<Project>) -> Self {
        Self {
            project: Arc::downgrade(project),
            active: Mutex::new(None),
            saved: Mutex::new(None),
        }
    }
}

impl ConnectionHolder {
    /// The holder attached to `project`, created on first use.
    pub fn get(project: &Arc<Project>) -> Arc<Self> {
        project.attachment::<Self>()
    }

    pub fn project(&self) -> Option<Arc<Project>> {
        self.project.upgrade()
    }

    /// Lock the active slot.
    pub fn connection(&self) -> MutexGuard<'_, Option<Connection>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` on the active connection, if there is one.
    pub fn with_connection<R>(&self, f: impl FnOnce(&mut Connection) -> R) -> Option<R> {
        self.connection().as_mut().map(f)
    }

    pub fn is_open(&self) -> bool {
        self.connection().as_ref().is_some_and(Connection::is_open)
    }

    /// Open `path` for this project and make it the active connection.
    pub fn open(
        &self,
        path: impl AsRef<Path>,
        config: ConnectionConfig,
        on_checkpoint_failure: impl Fn() + Send + Sync + 'static,
    ) -> Result<OpenStatus> {
        let mut conn = Connection::for_project(self.project.clone(), Some(Arc::new(on_checkpoint_failure)))
            .with_config(config);
        let status = conn.open(path)?;
        self.replace(Some(conn));
        Ok(status)
    }

    /// Put `next` in the slot, closing whatever was there.
    ///
    /// Returns whether the previous connection closed cleanly (true when the
    /// slot was empty).
    pub fn replace(&self, next: Option<Connection>) -> bool {
        let previous = std::mem::replace(&mut *self.connection(), next);
        close_out(previous)
    }

    /// Remove the active connection without closing it.
    pub fn take(&self) -> Option<Connection> {
        self.connection().take()
    }

    /// Close and clear the active connection.
    pub fn close(&self) -> bool {
        self.replace(None)
    }

    /// Set the active connection aside, leaving the slot empty.
    ///
    /// A connection already saved is closed first.
    pub fn save_connection(&self) -> bool {
        let current = self.take();
        let displaced = std::mem::replace(&mut *self.lock_saved(), current);
        close_out(displaced)
    }

    /// Bring back the saved connection, closing the active one.
    ///
    /// Returns false, changing nothing, when nothing was saved.
    pub fn restore_connection(&self) -> bool {
        let Some(saved) = self.lock_saved().take() else {
            return false;
        };
        self.replace(Some(saved));
        true
    }

    /// Close the saved connection, if any.
    pub fn discard_saved(&self) -> bool {
        let saved = self.lock_saved().take();
        close_out(saved)
    }

    pub fn has_saved(&self) -> bool {
        self.lock_saved().is_some()
    }

    fn lock_saved(&self) -> MutexGuard<'_, Option<Connection>> {
        self.saved.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Close a connection that has left its slot; no lock is held here, so a
/// slow checkpoint drain does not block the holder.
fn close_out(conn: Option<Connection>) -> bool {
    match conn {
        Some(mut conn) => {
            let clean = conn.close();
            if !clean {
                tracing::warn!("replaced connection did not close cleanly");
            }
            clean
        }
        None => true,
    }
}

impl std::fmt::Debug for ConnectionHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHolder")
            .field("open", &self.is_open())
            .field("saved", &self.has_saved())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_the_same_holder() {
        let project = Project::new("doc");
        let a = ConnectionHolder::get(&project);
        let b = ConnectionHolder::get(&project);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!a.is_open());
        assert!(Arc::ptr_eq(&a.project().unwrap(), &project));
    }

    #[test]
    fn open_fills_the_slot() {
        let dir = tempfile::tempdir().unwrap();
        let project = Project::new("doc");
        let holder = ConnectionHolder::get(&project);
        let status = holder
            .open(dir.path().join("doc.db"), ConnectionConfig::default(), || {})
            .unwrap();
        assert_eq!(status, OpenStatus::Created);
        assert!(holder.is_open());
        let path = holder.with_connection(|c| c.path().map(Path::to_path_buf));
        assert!(path.flatten().unwrap().ends_with("doc.db"));
    }

    #[test]
    fn failed_open_keeps_previous_connection() {
        let dir = tempfile::tempdir().unwrap();
        let project = Project::new("doc");
        let holder = ConnectionHolder::get(&project);
        holder
            .open(dir.path().join("doc.db"), ConnectionConfig::default(), || {})
            .unwrap();
        assert!(holder
            .open(dir.path().join("no").join("such.db"), ConnectionConfig::default(), || {})
            .is_err());
        assert!(holder.is_open());
    }

    #[test]
    fn replace_closes_previous() {
        let dir = tempfile::tempdir().unwrap();
        let project = Project::new("doc");
        let holder = ConnectionHolder::get(&project);
        holder
            .open(dir.path().join("a.db"), ConnectionConfig::default(), || {})
            .unwrap();
        let errors = holder.with_connection(|c| c.error_state()).unwrap();

        assert!(holder.replace(None));
        assert!(!holder.is_open());
        assert!(holder.take().is_none());
        // The error record survives the connection it came from.
        errors.set("after close", "", None, "");
        assert_eq!(errors.message(), "after close");
    }

    #[test]
    fn save_and_restore_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let project = Project::new("doc");
        let holder = ConnectionHolder::get(&project);
        holder
            .open(dir.path().join("main.db"), ConnectionConfig::default(), || {})
            .unwrap();

        assert!(holder.save_connection());
        assert!(holder.has_saved());
        assert!(!holder.is_open());

        holder
            .open(dir.path().join("backup.db"), ConnectionConfig::default(), || {})
            .unwrap();
        assert!(holder.restore_connection());
        assert!(!holder.has_saved());
        let path = holder.with_connection(|c| c.path().map(Path::to_path_buf)).flatten();
        assert!(path.unwrap().ends_with("main.db"));

        assert!(!holder.restore_connection());
        assert!(holder.is_open());
    }

    #[test]
    fn discard_saved_closes_it() {
        let dir = tempfile::tempdir().unwrap();
        let project = Project::new("doc");
        let holder = ConnectionHolder::get(&project);
        holder
            .open(dir.path().join("main.db"), ConnectionConfig::default(), || {})
            .unwrap();
        holder.save_connection();
        assert!(holder.discard_saved());
        assert!(!holder.has_saved());
        assert!(holder.discard_saved());
    }
}
