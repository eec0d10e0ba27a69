//! Savepoint-based transaction scopes.
//!
//! Scopes nest freely: each one opens a uniquely named savepoint, so an
//! inner scope can be released or rolled back without touching its parent.
//! A scope that is dropped without `commit` rolls back everything done since
//! it began, including work committed by inner scopes.
//!
//! Scopes finish innermost first. Committing a scope while one nested in it
//! is still open is refused, since releasing the outer savepoint would
//! silently fold the inner one into it.

use crate::connection::Connection;
use projectdb_core::{Error, Result, TransactionError, TransactionErrorKind, is_identifier};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeState {
    Open,
    Committed,
    RolledBack,
}

/// A nested transaction on a connection.
#[must_use = "dropping a scope without commit rolls it back"]
pub struct TransactionScope<'conn> {
    conn: &'conn Connection,
    /// `None` when the connection was in bypass mode at `begin`
    savepoint: Option<String>,
    /// Open scopes on the connection, this one included, at `begin`
    depth: usize,
    state: ScopeState,
}

impl<'conn> TransactionScope<'conn> {
    /// Open a savepoint named after `label`.
    ///
    /// With bypass on, no savepoint is issued and commit and rollback do
    /// nothing; statements run in whatever transaction the caller manages.
    #[tracing::instrument(level = "debug", skip(conn))]
    pub fn begin(conn: &'conn Connection, label: &str) -> Result<Self> {
        if !is_identifier(label) {
            return Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::InvalidName,
                savepoint: Some(label.to_string()),
                message: format!("invalid transaction name '{label}'"),
                engine_code: None,
            }));
        }
        if conn.should_bypass() {
            tracing::trace!(label, "bypass on; savepoint skipped");
            return Ok(Self {
                conn,
                savepoint: None,
                depth: 0,
                state: ScopeState::Open,
            });
        }

        let name = conn.next_savepoint(label);
        conn.execute_batch(&format!("SAVEPOINT {name};"))
            .map_err(|e| transaction_error(TransactionErrorKind::Start, &name, &e))?;
        let depth = conn.enter_scope();
        tracing::debug!(savepoint = %name, depth, "savepoint started");
        Ok(Self {
            conn,
            savepoint: Some(name),
            depth,
            state: ScopeState::Open,
        })
    }

    /// Savepoint name, or `None` for a bypassed scope.
    pub fn name(&self) -> Option<&str> {
        self.savepoint.as_deref()
    }

    pub fn is_bypassed(&self) -> bool {
        self.savepoint.is_none()
    }

    pub fn is_committed(&self) -> bool {
        self.state == ScopeState::Committed
    }

    /// Release the savepoint, keeping its changes.
    ///
    /// Committing twice is an error that touches nothing, as is committing
    /// while a nested scope is still open. If the release fails the scope
    /// stays open and will roll back when dropped.
    pub fn commit(&mut self) -> Result<()> {
        if self.state == ScopeState::Committed {
            return Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::AlreadyCommitted,
                savepoint: self.savepoint.clone(),
                message: "transaction already committed".to_string(),
                engine_code: None,
            }));
        }
        if let Some(name) = &self.savepoint {
            let open = self.conn.scope_depth();
            if open > self.depth {
                return Err(Error::Transaction(TransactionError {
                    kind: TransactionErrorKind::InnerScopeOpen,
                    savepoint: Some(name.clone()),
                    message: format!("{} nested transaction(s) still open", open - self.depth),
                    engine_code: None,
                }));
            }
            self.conn
                .execute_batch(&format!("RELEASE {name};"))
                .map_err(|e| transaction_error(TransactionErrorKind::Commit, name, &e))?;
            self.conn.leave_scope();
            tracing::debug!(savepoint = %name, "savepoint released");
        }
        self.state = ScopeState::Committed;
        Ok(())
    }

    /// Undo everything since `begin` and end the scope.
    pub fn rollback(mut self) -> Result<()> {
        let result = self.roll_back();
        self.state = ScopeState::RolledBack;
        result
    }

    fn roll_back(&self) -> Result<()> {
        let Some(name) = &self.savepoint else {
            return Ok(());
        };
        self.conn.leave_scope();
        self.conn
            .execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name};"))
            .map_err(|e| transaction_error(TransactionErrorKind::Rollback, name, &e))?;
        tracing::debug!(savepoint = %name, "savepoint rolled back");
        Ok(())
    }
}

impl Drop for TransactionScope<'_> {
    fn drop(&mut self) {
        if self.state != ScopeState::Open {
            return;
        }
        if let Err(e) = self.roll_back() {
            // Already recorded on the connection's error state.
            tracing::error!(savepoint = ?self.savepoint, error = %e, "rollback on drop failed");
        }
        self.state = ScopeState::RolledBack;
    }
}

impl std::fmt::Debug for TransactionScope<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionScope")
            .field("savepoint", &self.savepoint)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

fn transaction_error(kind: TransactionErrorKind, savepoint: &str, cause: &Error) -> Error {
    let verb = match kind {
        TransactionErrorKind::Start => "start",
        TransactionErrorKind::Commit => "release",
        _ => "roll back",
    };
    Error::Transaction(TransactionError {
        kind,
        savepoint: Some(savepoint.to_string()),
        message: format!("Failed to {verb} savepoint: {cause}"),
        engine_code: cause.engine_code(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use projectdb_core::Value;

    fn setup() -> (tempfile::TempDir, Connection) {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = Connection::detached();
        conn.open(dir.path().join("t.db")).unwrap();
        conn.execute_batch("CREATE TABLE items (v INTEGER);").unwrap();
        (dir, conn)
    }

    fn count(conn: &Connection) -> i64 {
        conn.query("SELECT count(*) FROM items;", &[]).unwrap()[0]
            .get_as::<i64>(0)
            .unwrap()
    }

    fn insert(conn: &Connection, v: i64) {
        conn.execute("INSERT INTO items VALUES (?1);", &[Value::BigInt(v)])
            .unwrap();
    }

    #[test]
    fn commit_keeps_changes() {
        let (_dir, conn) = setup();
        let mut scope = TransactionScope::begin(&conn, "edit").unwrap();
        insert(&conn, 1);
        scope.commit().unwrap();
        assert!(scope.is_committed());
        drop(scope);
        assert_eq!(count(&conn), 1);
    }

    #[test]
    fn drop_without_commit_rolls_back() {
        let (_dir, conn) = setup();
        {
            let _scope = TransactionScope::begin(&conn, "edit").unwrap();
            insert(&conn, 1);
        }
        assert_eq!(count(&conn), 0);
    }

    #[test]
    fn explicit_rollback_discards_changes() {
        let (_dir, conn) = setup();
        let scope = TransactionScope::begin(&conn, "edit").unwrap();
        insert(&conn, 1);
        scope.rollback().unwrap();
        assert_eq!(count(&conn), 0);
    }

    #[test]
    fn second_commit_is_rejected_without_side_effects() {
        let (_dir, conn) = setup();
        let mut scope = TransactionScope::begin(&conn, "edit").unwrap();
        insert(&conn, 1);
        scope.commit().unwrap();
        let err = scope.commit().unwrap_err();
        assert!(matches!(
            err,
            Error::Transaction(TransactionError {
                kind: TransactionErrorKind::AlreadyCommitted,
                ..
            })
        ));
        drop(scope);
        assert_eq!(count(&conn), 1);
    }

    #[test]
    fn savepoint_names_are_unique_per_scope() {
        let (_dir, conn) = setup();
        let outer = TransactionScope::begin(&conn, "same").unwrap();
        let inner = TransactionScope::begin(&conn, "same").unwrap();
        assert_ne!(outer.name(), inner.name());
    }

    #[test]
    fn outer_commit_waits_for_inner_scope() {
        let (_dir, conn) = setup();
        let mut outer = TransactionScope::begin(&conn, "outer").unwrap();
        insert(&conn, 1);
        let mut inner = TransactionScope::begin(&conn, "inner").unwrap();
        insert(&conn, 2);
        assert_eq!(conn.scope_depth(), 2);

        let err = outer.commit().unwrap_err();
        assert!(matches!(
            err,
            Error::Transaction(TransactionError {
                kind: TransactionErrorKind::InnerScopeOpen,
                ..
            })
        ));
        assert!(!outer.is_committed());
        assert!(conn.last_error().is_empty());

        inner.commit().unwrap();
        outer.commit().unwrap();
        drop(inner);
        drop(outer);
        assert_eq!(conn.scope_depth(), 0);
        assert_eq!(count(&conn), 2);
        assert!(conn.last_error().is_empty());
    }

    #[test]
    fn scope_depth_tracks_every_exit() {
        let (_dir, conn) = setup();
        {
            let _dropped = TransactionScope::begin(&conn, "a").unwrap();
            assert_eq!(conn.scope_depth(), 1);
        }
        TransactionScope::begin(&conn, "b").unwrap().rollback().unwrap();
        let mut kept = TransactionScope::begin(&conn, "c").unwrap();
        kept.commit().unwrap();
        assert_eq!(conn.scope_depth(), 0);

        conn.set_bypass(true);
        let _bypassed = TransactionScope::begin(&conn, "d").unwrap();
        assert_eq!(conn.scope_depth(), 0);
    }

    #[test]
    fn invalid_label_is_rejected() {
        let (_dir, conn) = setup();
        let err = TransactionScope::begin(&conn, "x; COMMIT").unwrap_err();
        assert!(matches!(
            err,
            Error::Transaction(TransactionError {
                kind: TransactionErrorKind::InvalidName,
                ..
            })
        ));
    }

    #[test]
    fn bypassed_scope_issues_nothing() {
        let (_dir, conn) = setup();
        conn.set_bypass(true);
        {
            let scope = TransactionScope::begin(&conn, "bulk").unwrap();
            assert!(scope.is_bypassed());
            insert(&conn, 1);
        }
        // No savepoint to roll back to, so the insert stands.
        assert_eq!(count(&conn), 1);
        conn.set_bypass(false);
        assert!(!TransactionScope::begin(&conn, "normal").unwrap().is_bypassed());
    }

    #[test]
    fn begin_on_closed_connection_fails() {
        let conn = Connection::detached();
        let err = TransactionScope::begin(&conn, "edit").unwrap_err();
        assert!(matches!(
            err,
            Error::Transaction(TransactionError {
                kind: TransactionErrorKind::Start,
                ..
            })
        ));
    }
}
