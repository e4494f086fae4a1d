use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{Connection, Executor};
use tracing::{debug, info, warn};

use crate::error::{PlatformError, Result};
use crate::models::{DatabaseKind, DatabaseServer};

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").unwrap());

/// System schemas and logins that tenants may never claim.
const RESERVED_NAMES: &[&str] = &[
    "mysql",
    "sys",
    "information_schema",
    "performance_schema",
    "postgres",
    "template0",
    "template1",
    "root",
];

/// Database and login to create on a server.
#[derive(Clone)]
pub struct ScopedGrant {
    pub database_name: String,
    pub db_user: String,
    pub db_password: String,
}

impl std::fmt::Debug for ScopedGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedGrant")
            .field("database_name", &self.database_name)
            .field("db_user", &self.db_user)
            .finish_non_exhaustive()
    }
}

/// Administrative operations against a managed database server.
#[async_trait]
pub trait DatabaseAdmin: Send + Sync {
    async fn test_connection(&self, server: &DatabaseServer) -> Result<()>;

    /// Create a database and a login that can reach only that database.
    async fn create_scoped(&self, server: &DatabaseServer, grant: &ScopedGrant) -> Result<()>;

    /// Drop a database and its login.
    async fn drop_scoped(&self, server: &DatabaseServer, database_name: &str, db_user: &str) -> Result<()>;
}

pub fn validate_identifier(label: &str, value: &str) -> Result<()> {
    if IDENTIFIER.is_match(value) {
        Ok(())
    } else {
        Err(PlatformError::Validation(format!(
            "{label} must start with a letter or underscore and contain only letters, digits and underscores (max 63)"
        )))
    }
}

/// Reject database and login names that collide with server-owned objects.
pub fn validate_scoped_names(server: &DatabaseServer, database_name: &str, db_user: &str) -> Result<()> {
    for (label, value) in [("database name", database_name), ("database user", db_user)] {
        let lowered = value.to_ascii_lowercase();
        if RESERVED_NAMES.contains(&lowered.as_str())
            || lowered.starts_with("pg_")
            || lowered == server.root_user.to_ascii_lowercase()
        {
            return Err(PlatformError::Validation(format!("{label} '{value}' is reserved")));
        }
    }
    Ok(())
}

pub fn validate_password(value: &str) -> Result<()> {
    if value.is_empty() || value.contains('\0') {
        return Err(PlatformError::Validation(
            "database password must be non-empty and contain no NUL bytes".into(),
        ));
    }
    Ok(())
}

/// Quote `value` as a SQL string literal for the given engine.
pub fn string_literal(kind: DatabaseKind, value: &str) -> String {
    let escaped = match kind {
        DatabaseKind::Mysql => value.replace('\\', "\\\\").replace('\'', "''"),
        DatabaseKind::Postgresql => value.replace('\'', "''"),
    };
    format!("'{escaped}'")
}

/// Statements that create a scoped MySQL database and login.
pub fn mysql_create_statements(grant: &ScopedGrant) -> Vec<String> {
    let db = &grant.database_name;
    let user = &grant.db_user;
    vec![
        format!("CREATE DATABASE `{db}`"),
        format!(
            "CREATE USER '{user}'@'%' IDENTIFIED BY {}",
            string_literal(DatabaseKind::Mysql, &grant.db_password)
        ),
        format!("GRANT ALL PRIVILEGES ON `{db}`.* TO '{user}'@'%'"),
        "FLUSH PRIVILEGES".to_string(),
    ]
}

pub fn mysql_drop_statements(database_name: &str, db_user: &str) -> Vec<String> {
    vec![
        format!("DROP DATABASE IF EXISTS `{database_name}`"),
        format!("DROP USER IF EXISTS '{db_user}'@'%'"),
    ]
}

/// Statements run on the `postgres` maintenance database.
pub fn postgres_server_statements(grant: &ScopedGrant) -> Vec<String> {
    let db = &grant.database_name;
    let user = &grant.db_user;
    vec![
        format!("CREATE DATABASE \"{db}\""),
        format!(
            "CREATE USER \"{user}\" WITH PASSWORD {}",
            string_literal(DatabaseKind::Postgresql, &grant.db_password)
        ),
        format!("GRANT CONNECT ON DATABASE \"{db}\" TO \"{user}\""),
        format!("REVOKE CONNECT ON DATABASE \"{db}\" FROM PUBLIC"),
    ]
}

/// Statements run inside the new database once it exists.
pub fn postgres_schema_statements(grant: &ScopedGrant) -> Vec<String> {
    let user = &grant.db_user;
    vec![
        format!("GRANT ALL PRIVILEGES ON SCHEMA public TO \"{user}\""),
        format!("GRANT ALL PRIVILEGES ON ALL TABLES IN SCHEMA public TO \"{user}\""),
        format!("GRANT ALL PRIVILEGES ON ALL SEQUENCES IN SCHEMA public TO \"{user}\""),
        format!("ALTER DEFAULT PRIVILEGES IN SCHEMA public GRANT ALL ON TABLES TO \"{user}\""),
        format!("ALTER DEFAULT PRIVILEGES IN SCHEMA public GRANT ALL ON SEQUENCES TO \"{user}\""),
        format!("REVOKE ALL ON DATABASE postgres FROM \"{user}\""),
        format!("REVOKE ALL ON DATABASE template1 FROM \"{user}\""),
    ]
}

const MYSQL_SCHEMA_EXISTS: &str =
    "SELECT COUNT(*) FROM information_schema.SCHEMATA WHERE SCHEMA_NAME = ?";
const MYSQL_USER_EXISTS: &str = "SELECT COUNT(*) FROM mysql.user WHERE User = ?";
const PG_DATABASE_EXISTS: &str = "SELECT COUNT(*) FROM pg_database WHERE datname = $1";
const PG_ROLE_EXISTS: &str = "SELECT COUNT(*) FROM pg_roles WHERE rolname = $1";

const PG_TERMINATE_BACKENDS: &str = "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
     WHERE datname = $1 AND pid <> pg_backend_pid()";

pub fn postgres_drop_statements(database_name: &str, db_user: &str) -> Vec<String> {
    vec![
        format!("DROP DATABASE IF EXISTS \"{database_name}\""),
        format!("DROP USER IF EXISTS \"{db_user}\""),
    ]
}

/// [`DatabaseAdmin`] speaking the native protocols through sqlx.
pub struct SqlxAdmin {
    timeout: Duration,
}

impl SqlxAdmin {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn bounded<T>(
        &self,
        server: &DatabaseServer,
        work: impl Future<Output = std::result::Result<T, sqlx::Error>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.timeout, work).await {
            Ok(result) => result.map_err(|e| classify(server, e)),
            Err(_) => Err(PlatformError::Connectivity(format!(
                "database server {}:{} did not respond within {}s",
                server.host,
                server.port,
                self.timeout.as_secs()
            ))),
        }
    }
}

fn mysql_options(server: &DatabaseServer) -> MySqlConnectOptions {
    MySqlConnectOptions::new()
        .host(&server.host)
        .port(server.port)
        .username(&server.root_user)
        .password(&server.root_pass)
}

fn pg_options(server: &DatabaseServer, database: &str) -> PgConnectOptions {
    PgConnectOptions::new()
        .host(&server.host)
        .port(server.port)
        .username(&server.root_user)
        .password(&server.root_pass)
        .database(database)
}

async fn run_mysql(conn: &mut MySqlConnection, statements: &[String]) -> std::result::Result<(), sqlx::Error> {
    for statement in statements {
        debug!(statement = %redact(statement), "executing admin statement");
        conn.execute(statement.as_str()).await?;
    }
    Ok(())
}

async fn run_pg(conn: &mut PgConnection, statements: &[String]) -> std::result::Result<(), sqlx::Error> {
    for statement in statements {
        debug!(statement = %redact(statement), "executing admin statement");
        conn.execute(statement.as_str()).await?;
    }
    Ok(())
}

/// Name of the first requested object that is already present on the server.
async fn mysql_existing(
    conn: &mut MySqlConnection,
    grant: &ScopedGrant,
) -> std::result::Result<Option<String>, sqlx::Error> {
    for (query, name) in [(MYSQL_SCHEMA_EXISTS, &grant.database_name), (MYSQL_USER_EXISTS, &grant.db_user)] {
        let count: i64 = sqlx::query_scalar(query).bind(name).fetch_one(&mut *conn).await?;
        if count > 0 {
            return Ok(Some(name.clone()));
        }
    }
    Ok(None)
}

async fn pg_existing(
    conn: &mut PgConnection,
    grant: &ScopedGrant,
) -> std::result::Result<Option<String>, sqlx::Error> {
    for (query, name) in [(PG_DATABASE_EXISTS, &grant.database_name), (PG_ROLE_EXISTS, &grant.db_user)] {
        let count: i64 = sqlx::query_scalar(query).bind(name).fetch_one(&mut *conn).await?;
        if count > 0 {
            return Ok(Some(name.clone()));
        }
    }
    Ok(None)
}

/// Best-effort removal of objects a failed create left behind.
async fn mysql_rollback(conn: &mut MySqlConnection, grant: &ScopedGrant) {
    for statement in mysql_drop_statements(&grant.database_name, &grant.db_user) {
        if let Err(e) = conn.execute(statement.as_str()).await {
            warn!(database = %grant.database_name, error = %e, "rollback statement failed");
        }
    }
}

async fn pg_rollback(server: &DatabaseServer, grant: &ScopedGrant) {
    let mut conn = match PgConnection::connect_with(&pg_options(server, "postgres")).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!(database = %grant.database_name, error = %e, "rollback connection failed");
            return;
        }
    };
    for statement in postgres_drop_statements(&grant.database_name, &grant.db_user) {
        if let Err(e) = conn.execute(statement.as_str()).await {
            warn!(database = %grant.database_name, error = %e, "rollback statement failed");
        }
    }
    let _ = conn.close().await;
}

fn already_exists(server: &DatabaseServer, name: String) -> PlatformError {
    PlatformError::Conflict(format!("'{name}' already exists on server {}", server.name))
}

/// Drop the password literal from statements before logging them.
fn redact(statement: &str) -> String {
    match statement.find(" PASSWORD ").or_else(|| statement.find(" IDENTIFIED BY ")) {
        Some(idx) => format!("{} <redacted>", &statement[..idx]),
        None => statement.to_string(),
    }
}

fn classify(server: &DatabaseServer, err: sqlx::Error) -> PlatformError {
    let endpoint = format!("{}:{}", server.host, server.port);
    match &err {
        sqlx::Error::Io(e) => PlatformError::Connectivity(format!("{endpoint}: {e}")),
        sqlx::Error::Tls(e) => PlatformError::Connectivity(format!("{endpoint}: {e}")),
        sqlx::Error::PoolTimedOut => PlatformError::Connectivity(format!("{endpoint}: timed out")),
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("28000") | Some("28P01") => {
                PlatformError::Authentication(format!("{endpoint}: {}", db.message()))
            }
            _ => PlatformError::Provisioning(db.message().to_string()),
        },
        _ => PlatformError::Provisioning(err.to_string()),
    }
}

#[async_trait]
impl DatabaseAdmin for SqlxAdmin {
    async fn test_connection(&self, server: &DatabaseServer) -> Result<()> {
        match server.db_type {
            DatabaseKind::Mysql => {
                self.bounded(server, async {
                    let mut conn = MySqlConnection::connect_with(&mysql_options(server)).await?;
                    conn.ping().await?;
                    conn.close().await
                })
                .await
            }
            DatabaseKind::Postgresql => {
                self.bounded(server, async {
                    let mut conn = PgConnection::connect_with(&pg_options(server, "postgres")).await?;
                    conn.execute("SELECT 1").await?;
                    conn.close().await
                })
                .await
            }
        }
    }

    async fn create_scoped(&self, server: &DatabaseServer, grant: &ScopedGrant) -> Result<()> {
        validate_identifier("database name", &grant.database_name)?;
        validate_identifier("database user", &grant.db_user)?;
        validate_scoped_names(server, &grant.database_name, &grant.db_user)?;
        validate_password(&grant.db_password)?;

        // The pre-check runs under the caller's per-server lock, so anything
        // dropped on rollback was created by this call.
        let existing = match server.db_type {
            DatabaseKind::Mysql => {
                self.bounded(server, async {
                    let mut conn = MySqlConnection::connect_with(&mysql_options(server)).await?;
                    if let Some(name) = mysql_existing(&mut conn, grant).await? {
                        return Ok(Some(name));
                    }
                    if let Err(e) = run_mysql(&mut conn, &mysql_create_statements(grant)).await {
                        mysql_rollback(&mut conn, grant).await;
                        return Err(e);
                    }
                    conn.close().await?;
                    Ok(None)
                })
                .await?
            }
            DatabaseKind::Postgresql => {
                self.bounded(server, async {
                    let mut conn = PgConnection::connect_with(&pg_options(server, "postgres")).await?;
                    if let Some(name) = pg_existing(&mut conn, grant).await? {
                        return Ok(Some(name));
                    }
                    let created = async {
                        run_pg(&mut conn, &postgres_server_statements(grant)).await?;
                        conn.close().await?;
                        let mut conn =
                            PgConnection::connect_with(&pg_options(server, &grant.database_name)).await?;
                        run_pg(&mut conn, &postgres_schema_statements(grant)).await?;
                        conn.close().await
                    }
                    .await;
                    if let Err(e) = created {
                        pg_rollback(server, grant).await;
                        return Err(e);
                    }
                    Ok(None)
                })
                .await?
            }
        };
        if let Some(name) = existing {
            return Err(already_exists(server, name));
        }
        info!(
            server = %server.name,
            database = %grant.database_name,
            db_user = %grant.db_user,
            "scoped database created"
        );
        Ok(())
    }

    async fn drop_scoped(&self, server: &DatabaseServer, database_name: &str, db_user: &str) -> Result<()> {
        validate_identifier("database name", database_name)?;
        validate_identifier("database user", db_user)?;
        validate_scoped_names(server, database_name, db_user)?;

        match server.db_type {
            DatabaseKind::Mysql => {
                self.bounded(server, async {
                    let mut conn = MySqlConnection::connect_with(&mysql_options(server)).await?;
                    run_mysql(&mut conn, &mysql_drop_statements(database_name, db_user)).await?;
                    conn.close().await
                })
                .await?;
            }
            DatabaseKind::Postgresql => {
                self.bounded(server, async {
                    let mut conn = PgConnection::connect_with(&pg_options(server, "postgres")).await?;
                    sqlx::query(PG_TERMINATE_BACKENDS)
                        .bind(database_name)
                        .execute(&mut conn)
                        .await?;
                    run_pg(&mut conn, &postgres_drop_statements(database_name, db_user)).await?;
                    conn.close().await
                })
                .await?;
            }
        }
        info!(server = %server.name, database = database_name, "scoped database dropped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grant(password: &str) -> ScopedGrant {
        ScopedGrant {
            database_name: "shop".into(),
            db_user: "shop_rw".into(),
            db_password: password.into(),
        }
    }

    #[test]
    fn identifiers_are_restricted() {
        assert!(validate_identifier("database name", "shop_2024").is_ok());
        assert!(validate_identifier("database name", "_tmp").is_ok());
        assert!(validate_identifier("database name", "2shop").is_err());
        assert!(validate_identifier("database name", "shop`; DROP").is_err());
        assert!(validate_identifier("database name", &"a".repeat(64)).is_err());
        assert!(validate_identifier("database name", "").is_err());
    }

    #[test]
    fn mysql_grants_are_schema_scoped() {
        let statements = mysql_create_statements(&grant("p'w\\x"));
        assert_eq!(statements[0], "CREATE DATABASE `shop`");
        assert_eq!(statements[1], r"CREATE USER 'shop_rw'@'%' IDENTIFIED BY 'p''w\\x'");
        assert_eq!(statements[2], "GRANT ALL PRIVILEGES ON `shop`.* TO 'shop_rw'@'%'");
        assert_eq!(statements[3], "FLUSH PRIVILEGES");
    }

    #[test]
    fn create_never_adopts_existing_objects() {
        for statement in mysql_create_statements(&grant("pw")) {
            assert!(!statement.contains("IF NOT EXISTS"), "{statement}");
        }
    }

    #[test]
    fn system_names_are_reserved() {
        let server = DatabaseServer::new(
            "main".into(),
            "db".into(),
            None,
            DatabaseKind::Mysql,
            "admin".into(),
            "pw".into(),
        );
        for (db, user) in [
            ("mysql", "shop_rw"),
            ("shop", "root"),
            ("INFORMATION_SCHEMA", "shop_rw"),
            ("performance_schema", "shop_rw"),
            ("shop", "pg_monitor"),
            ("template1", "shop_rw"),
            ("shop", "Admin"),
        ] {
            assert!(
                matches!(validate_scoped_names(&server, db, user), Err(PlatformError::Validation(_))),
                "{db}/{user}"
            );
        }
        assert!(validate_scoped_names(&server, "shop", "shop_rw").is_ok());
    }

    #[test]
    fn postgres_revokes_lateral_access() {
        let server = postgres_server_statements(&grant("pw"));
        assert!(server.contains(&"REVOKE CONNECT ON DATABASE \"shop\" FROM PUBLIC".to_string()));
        let schema = postgres_schema_statements(&grant("pw"));
        assert!(schema.contains(&"REVOKE ALL ON DATABASE postgres FROM \"shop_rw\"".to_string()));
        assert!(schema.contains(&"REVOKE ALL ON DATABASE template1 FROM \"shop_rw\"".to_string()));
    }

    #[test]
    fn drop_order_is_database_then_user() {
        let mysql = mysql_drop_statements("shop", "shop_rw");
        assert!(mysql[0].starts_with("DROP DATABASE"));
        assert!(mysql[1].starts_with("DROP USER"));
        let pg = postgres_drop_statements("shop", "shop_rw");
        assert!(pg[0].starts_with("DROP DATABASE"));
    }

    #[test]
    fn redacts_passwords_in_logs() {
        let statements = postgres_server_statements(&grant("hunter2"));
        assert!(!redact(&statements[1]).contains("hunter2"));
        assert!(!redact(&mysql_create_statements(&grant("hunter2"))[1]).contains("hunter2"));
    }
}
