//! Backend seam for the connection pool.

use async_trait::async_trait;

use crate::config::SessionGuards;
use crate::error::DbResult;

/// Opens, prepares and validates raw backend connections.
///
/// The pool owns all bookkeeping; a manager only knows how to talk to one
/// kind of backend.
#[async_trait]
pub trait ConnectionManager: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Establish a new connection.
    async fn connect(&self) -> DbResult<Self::Connection>;

    /// Apply the per-session server timeouts. Called exactly once per new
    /// connection, before it is handed out.
    async fn apply_session_guards(
        &self,
        conn: &mut Self::Connection,
        guards: &SessionGuards,
    ) -> DbResult<()>;

    /// Issue a trivial round trip.
    async fn ping(&self, conn: &mut Self::Connection) -> DbResult<()>;

    /// Cheap synchronous check for a connection the transport already knows
    /// is dead.
    fn is_broken(&self, conn: &Self::Connection) -> bool;
}
