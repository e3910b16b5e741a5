//! PostgreSQL connection manager over `tokio-postgres`.

use async_trait::async_trait;
use tokio_postgres::{Client, NoTls};

use super::manager::ConnectionManager;
use crate::config::{DbConfig, PoolConfig, SessionGuards};
use crate::error::{DbError, DbResult};

/// A live PostgreSQL session. The protocol driver runs on its own task and
/// ends when the client is dropped.
pub struct PgConnection {
    client: Client,
}

impl PgConnection {
    pub fn client(&self) -> &Client {
        &self.client
    }
}

/// Opens guarded PostgreSQL sessions.
#[derive(Debug, Clone)]
pub struct PgManager {
    pg_config: tokio_postgres::Config,
}

impl PgManager {
    pub fn new(pg_config: tokio_postgres::Config) -> Self {
        Self { pg_config }
    }

    /// Build from the service configuration. Does not connect.
    pub fn from_config(db: &DbConfig, pool: &PoolConfig) -> DbResult<Self> {
        Ok(Self::new(db.pg_config(pool.connection_timeout)?))
    }
}

#[async_trait]
impl ConnectionManager for PgManager {
    type Connection = PgConnection;

    async fn connect(&self) -> DbResult<PgConnection> {
        let (client, connection) = self
            .pg_config
            .connect(NoTls)
            .await
            .map_err(|e| DbError::connection(format!("Failed to connect: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(error = %e, "PostgreSQL connection error");
            }
        });

        Ok(PgConnection { client })
    }

    async fn apply_session_guards(
        &self,
        conn: &mut PgConnection,
        guards: &SessionGuards,
    ) -> DbResult<()> {
        conn.client
            .batch_execute(&guards.to_sql())
            .await
            .map_err(|e| DbError::from_pg("apply_session_guards", e))
    }

    async fn ping(&self, conn: &mut PgConnection) -> DbResult<()> {
        conn.client
            .simple_query("SELECT 1")
            .await
            .map(|_| ())
            .map_err(|e| DbError::from_pg("ping", e))
    }

    fn is_broken(&self, conn: &PgConnection) -> bool {
        conn.client.is_closed()
    }
}
