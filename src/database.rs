//! Database bootstrap and drift probes.
//!
//! The embedded database starts as a bare postgres image; the operator owns
//! creating the application roles and databases. The same schema
//! initialization runs in two places: once during instance creation, and
//! again by the health monitor when it detects that an ephemeral database
//! lost its contents across a pod restart.

use async_trait::async_trait;
use sqlx::postgres::PgConnectOptions;
use sqlx::{Connection, Executor, PgConnection};
use tracing::{debug, info};

use crate::error::Result;

/// Application database owned by the admin role.
pub const HUB_DATABASE: &str = "hub";
/// Reporting database, same ownership.
pub const REPORT_DATABASE: &str = "hub_report";
/// Role owning the schemas.
pub const ADMIN_USER: &str = "hub_admin";
/// Role the application connects as.
pub const APP_USER: &str = "hub_user";

/// Connection coordinates for one instance's database.
#[derive(Debug, Clone)]
pub struct DbTarget {
    pub host: String,
    pub port: u16,
    /// Superuser password, used for bootstrap and probing.
    pub postgres_password: String,
}

/// Role passwords applied during schema initialization.
#[derive(Debug, Clone)]
pub struct DbCredentials {
    pub admin_password: String,
    pub user_password: String,
}

/// What a probe learned about a database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Reachable and the application database exists.
    Healthy,
    /// TCP/auth failure. The pod is restarting or the service is gone;
    /// not a drift signal on its own.
    ConnectionFailed,
    /// Reachable but the application database is missing: the pod restarted
    /// on an empty volume and must be re-initialized.
    SchemaMissing,
}

#[async_trait]
pub trait DatabaseAdmin: Send + Sync {
    /// Check reachability and whether the application schema survived.
    async fn probe(&self, target: &DbTarget) -> Result<ProbeOutcome>;

    /// Create the application roles and databases. Idempotent; safe to run
    /// against a half-initialized database.
    async fn init_schema(&self, target: &DbTarget, creds: &DbCredentials) -> Result<()>;
}

/// Live implementation speaking to postgres over sqlx.
#[derive(Debug, Default, Clone)]
pub struct PostgresAdmin;

impl PostgresAdmin {
    async fn connect(target: &DbTarget) -> sqlx::Result<PgConnection> {
        let options = PgConnectOptions::new()
            .host(&target.host)
            .port(target.port)
            .username("postgres")
            .password(&target.postgres_password)
            .database("postgres");
        PgConnection::connect_with(&options).await
    }

    /// Run a statement, tolerating "already exists" (42710 duplicate object,
    /// 42P04 duplicate database).
    async fn execute_idempotent(conn: &mut PgConnection, sql: &str) -> sqlx::Result<()> {
        match conn.execute(sql).await {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err))
                if matches!(db_err.code().as_deref(), Some("42710") | Some("42P04")) =>
            {
                debug!(sql, "object already exists");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

/// Postgres string literals escape a quote by doubling it.
fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[async_trait]
impl DatabaseAdmin for PostgresAdmin {
    async fn probe(&self, target: &DbTarget) -> Result<ProbeOutcome> {
        let mut conn = match Self::connect(target).await {
            Ok(conn) => conn,
            Err(err) => {
                debug!(host = %target.host, error = %err, "database unreachable");
                return Ok(ProbeOutcome::ConnectionFailed);
            }
        };
        let row: Option<(i32,)> =
            sqlx::query_as("SELECT 1 FROM pg_database WHERE datname = $1")
                .bind(HUB_DATABASE)
                .fetch_optional(&mut conn)
                .await?;
        conn.close().await.ok();
        Ok(if row.is_some() {
            ProbeOutcome::Healthy
        } else {
            ProbeOutcome::SchemaMissing
        })
    }

    async fn init_schema(&self, target: &DbTarget, creds: &DbCredentials) -> Result<()> {
        let mut conn = Self::connect(target).await?;

        // Roles cannot be created conditionally without a DO block, so create
        // first and tolerate the duplicate, then set the password.
        Self::execute_idempotent(&mut conn, &format!("CREATE USER {ADMIN_USER}")).await?;
        Self::execute_idempotent(&mut conn, &format!("CREATE USER {APP_USER}")).await?;
        conn.execute(
            format!(
                "ALTER USER {ADMIN_USER} WITH PASSWORD {}",
                quote_literal(&creds.admin_password)
            )
            .as_str(),
        )
        .await?;
        conn.execute(
            format!(
                "ALTER USER {APP_USER} WITH PASSWORD {}",
                quote_literal(&creds.user_password)
            )
            .as_str(),
        )
        .await?;

        Self::execute_idempotent(
            &mut conn,
            &format!("CREATE DATABASE {HUB_DATABASE} OWNER {ADMIN_USER}"),
        )
        .await?;
        Self::execute_idempotent(
            &mut conn,
            &format!("CREATE DATABASE {REPORT_DATABASE} OWNER {ADMIN_USER}"),
        )
        .await?;

        conn.execute(
            format!("GRANT ALL PRIVILEGES ON DATABASE {HUB_DATABASE} TO {APP_USER}").as_str(),
        )
        .await?;
        conn.execute(
            format!("GRANT SELECT ON ALL TABLES IN SCHEMA public TO {APP_USER}").as_str(),
        )
        .await?;
        conn.close().await.ok();

        info!(host = %target.host, "database schema initialized");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literals_are_quoted() {
        assert_eq!(quote_literal("plain"), "'plain'");
        assert_eq!(quote_literal("o'brien"), "'o''brien'");
    }
}
