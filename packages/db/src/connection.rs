//! Database connection management.

use surrealdb::Surreal;
use surrealdb::engine::any::{Any, connect};
use surrealdb::opt::auth::Root;
use thiserror::Error;

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Connection endpoint: "mem://", "rocksdb://path" or a remote URL
    pub endpoint: String,
    /// Namespace to use
    pub namespace: String,
    /// Database name to use
    pub database: String,
    /// Optional root credentials for authentication
    pub credentials: Option<(String, String)>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            endpoint: "mem://".to_string(),
            namespace: "pipeline".to_string(),
            database: "main".to_string(),
            credentials: None,
        }
    }
}

impl DbConfig {
    /// Create a config for in-memory testing.
    pub fn memory() -> Self {
        Self::default()
    }

    /// Create a config for RocksDB persistence (requires rocksdb feature).
    pub fn rocksdb(path: impl Into<String>) -> Self {
        Self {
            endpoint: format!("rocksdb://{}", path.into()),
            ..Default::default()
        }
    }

    /// Create config from environment variables.
    ///
    /// `DB_ENDPOINT`, `DB_NAMESPACE`, `DB_DATABASE`, and `DB_USER`/`DB_PASSWORD`
    /// when both are present.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let credentials = match (std::env::var("DB_USER"), std::env::var("DB_PASSWORD")) {
            (Ok(user), Ok(password)) => Some((user, password)),
            _ => None,
        };
        Self {
            endpoint: std::env::var("DB_ENDPOINT").unwrap_or(defaults.endpoint),
            namespace: std::env::var("DB_NAMESPACE").unwrap_or(defaults.namespace),
            database: std::env::var("DB_DATABASE").unwrap_or(defaults.database),
            credentials,
        }
    }

    /// Set the namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the database name.
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Set root credentials for authentication.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }
}

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("Connection error: {0}")]
    Connection(surrealdb::Error),
    #[error("Record already exists: {0}")]
    AlreadyExists(String),
    #[error("Write conflict: {0}")]
    Conflict(String),
    #[error("Query error: {0}")]
    Query(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DbError {
    /// Lost an optimistic race against a concurrent writer.
    pub fn is_conflict(&self) -> bool {
        matches!(self, DbError::Conflict(_))
    }
}

impl From<surrealdb::Error> for DbError {
    fn from(err: surrealdb::Error) -> Self {
        let message = err.to_string();
        if message.contains("already exists") || message.contains("already contains") {
            DbError::AlreadyExists(message)
        } else if message.contains("conflict") || message.contains("can be retried") {
            DbError::Conflict(message)
        } else {
            DbError::Connection(err)
        }
    }
}

/// Handle to the coordination store.
///
/// Cheap to clone; every repository holds its own copy.
#[derive(Clone)]
pub struct Database {
    client: Surreal<Any>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Open a connection and select the namespace and database.
    pub async fn connect(config: &DbConfig) -> Result<Self, DbError> {
        tracing::info!(endpoint = %config.endpoint, "Connecting to database");

        let client = connect(config.endpoint.as_str()).await?;

        // Authenticate if credentials provided
        if let Some((username, password)) = &config.credentials {
            client
                .signin(Root {
                    username: username.as_str(),
                    password: password.as_str(),
                })
                .await?;
        }

        client
            .use_ns(config.namespace.as_str())
            .use_db(config.database.as_str())
            .await?;

        tracing::info!(
            namespace = %config.namespace,
            database = %config.database,
            "Connected to database"
        );

        Ok(Self { client })
    }

    /// Connect and make sure the schema exists.
    pub async fn init(config: DbConfig) -> Result<Self, DbError> {
        let db = Self::connect(&config).await?;
        crate::schema::init_schema(&db).await?;
        Ok(db)
    }

    /// A fresh in-memory store with the schema applied.
    pub async fn memory() -> Result<Self, DbError> {
        Self::init(DbConfig::memory()).await
    }

    /// The underlying SurrealDB client.
    pub fn client(&self) -> &Surreal<Any> {
        &self.client
    }
}
