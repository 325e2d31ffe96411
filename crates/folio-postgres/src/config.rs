//! Configuration for the PostgreSQL stores and their connection pool

use std::time::Duration;

use folio_core::{Result, ident};

/// Default name of the schema holding the admin tables
pub const DEFAULT_ADMIN_SCHEMA: &str = "folio_admin";

/// Configuration for the PostgreSQL connection pool and execution scopes
///
/// The pool settings control the underlying sqlx pool; `admin_schema` and
/// `statement_timeout` are applied to every scoped transaction.
///
/// # Example
/// ```
/// use folio_postgres::PostgresStoreConfig;
/// use std::time::Duration;
///
/// let config = PostgresStoreConfig::default()
///     .with_max_connections(50)
///     .with_statement_timeout(Duration::from_secs(10));
/// ```
#[derive(Debug, Clone)]
pub struct PostgresStoreConfig {
    /// Maximum number of connections in the pool
    pub max_connections: u32,

    /// Minimum number of connections to maintain
    pub min_connections: u32,

    /// Timeout for acquiring a connection from the pool
    pub acquire_timeout: Duration,

    /// How long a connection can remain idle before being closed
    pub idle_timeout: Duration,

    /// Maximum lifetime of a connection (to handle connection refresh)
    pub max_lifetime: Duration,

    /// Schema holding the tenant registry, schema repository and categories
    pub admin_schema: String,

    /// Transaction-local `statement_timeout`; `None` keeps the server default
    pub statement_timeout: Option<Duration>,
}

impl Default for PostgresStoreConfig {
    fn default() -> Self {
        Self {
            max_connections: 20,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600), // 10 minutes
            max_lifetime: Duration::from_secs(1800), // 30 minutes
            admin_schema: DEFAULT_ADMIN_SCHEMA.to_string(),
            statement_timeout: None,
        }
    }
}

impl PostgresStoreConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum number of connections
    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Set minimum number of connections
    pub fn with_min_connections(mut self, min_connections: u32) -> Self {
        self.min_connections = min_connections;
        self
    }

    /// Set acquire timeout
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set maximum lifetime
    pub fn with_max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    /// Set the admin schema name
    pub fn with_admin_schema(mut self, schema: impl Into<String>) -> Self {
        self.admin_schema = schema.into();
        self
    }

    /// Set the per-statement timeout applied inside scoped transactions
    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = Some(timeout);
        self
    }

    /// Check values that end up in SQL text or pool construction
    ///
    /// # Errors
    /// - `Error::Validation` for a malformed admin schema name or pool bounds
    pub fn validate(&self) -> Result<()> {
        ident::validate_db_name("admin schema", &self.admin_schema)?;
        if self.max_connections == 0 || self.min_connections > self.max_connections {
            return Err(folio_core::Error::Validation(format!(
                "Invalid pool bounds: min {} / max {}",
                self.min_connections, self.max_connections
            )));
        }
        Ok(())
    }
}
