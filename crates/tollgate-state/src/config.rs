//! Backend connection settings.

/// Where the SurrealDB store lives and how to authenticate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Connection URL: `mem://`, `surrealkv://path`, `ws://host:port`, `wss://...`
    pub endpoint: String,
    /// Credentials, required for remote endpoints only
    pub username: Option<String>,
    pub password: Option<String>,
    /// Namespace (default: "tollgate")
    pub namespace: String,
    /// Database name (default: "main")
    pub database: String,
    /// Sign in as root (true) or as a database user (false)
    pub is_root: bool,
}

/// Local persistence directory used when nothing is configured.
pub const DEFAULT_LOCAL_PATH: &str = ".tollgate/db";

impl StoreConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            username: None,
            password: None,
            namespace: "tollgate".to_string(),
            database: "main".to_string(),
            is_root: false,
        }
    }

    /// Ephemeral in-process database.
    pub fn in_memory() -> Self {
        Self::new("mem://")
    }

    /// Embedded on-disk database under [`DEFAULT_LOCAL_PATH`].
    pub fn local_default() -> Self {
        Self::new(format!("surrealkv://{DEFAULT_LOCAL_PATH}"))
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = ns.into();
        self
    }

    pub fn with_database(mut self, db: impl Into<String>) -> Self {
        self.database = db.into();
        self
    }

    pub fn with_root(mut self, is_root: bool) -> Self {
        self.is_root = is_root;
        self
    }

    /// Embedded endpoints need a local directory rather than credentials.
    pub fn local_path(&self) -> Option<&str> {
        self.endpoint.strip_prefix("surrealkv://")
    }

    /// Read settings from environment variables.
    ///
    /// Reads:
    /// - TOLLGATE_DB_URL (optional, default: `surrealkv://.tollgate/db`)
    /// - TOLLGATE_DB_USERNAME / TOLLGATE_DB_PASSWORD (optional, both or neither)
    /// - TOLLGATE_DB_NAMESPACE (optional, default: "tollgate")
    /// - TOLLGATE_DB_DATABASE (optional, default: "main")
    /// - TOLLGATE_DB_ROOT (optional, default: "false")
    pub fn from_env() -> std::result::Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`StoreConfig::from_env`] with an injectable lookup.
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> std::result::Result<Self, String> {
        let mut config = match lookup("TOLLGATE_DB_URL") {
            Some(url) if !url.trim().is_empty() => Self::new(url.trim()),
            _ => Self::local_default(),
        };

        match (lookup("TOLLGATE_DB_USERNAME"), lookup("TOLLGATE_DB_PASSWORD")) {
            (Some(u), Some(p)) => config = config.with_credentials(u, p),
            (None, None) => {}
            _ => {
                return Err(
                    "TOLLGATE_DB_USERNAME and TOLLGATE_DB_PASSWORD must be set together"
                        .to_string(),
                )
            }
        }

        if let Some(ns) = lookup("TOLLGATE_DB_NAMESPACE") {
            config.namespace = ns;
        }
        if let Some(db) = lookup("TOLLGATE_DB_DATABASE") {
            config.database = db;
        }
        if let Some(root) = lookup("TOLLGATE_DB_ROOT") {
            config.is_root = match root.to_lowercase().as_str() {
                "true" | "1" | "yes" => true,
                "false" | "0" | "no" | "" => false,
                other => return Err(format!("TOLLGATE_DB_ROOT: invalid boolean '{other}'")),
            };
        }
        Ok(config)
    }
}
