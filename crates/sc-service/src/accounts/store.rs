//! Account stores: where the directory loads its accounts from.
//!
//! Production deployments load from MySQL (accounts joined with plans, both
//! carrying JSON property documents). Development deployments with no
//! database run against a static single-token store instead. Dispatch is by
//! enum; the session and refresh paths only see [`AccountStore`].

use crate::accounts::directory::{Account, Plan};
use crate::errors::ScError;
use crate::observability::metrics;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::MySqlPool;
use std::time::{Duration, Instant};
use tracing::{instrument, warn};

/// Connection pool size for the account load path. The query runs on refresh
/// only, never per signaling operation.
const DEFAULT_POOL_MAX_CONNECTIONS: u32 = 5;

/// Ceiling on waiting for a pooled connection.
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Account name assigned to the development static token.
const STATIC_ACCOUNT_NAME: &str = "default";

/// Source of account records for the directory.
#[derive(Debug, Clone)]
pub enum AccountStore {
    MySql(MySqlAccountStore),
    Static(StaticAccountStore),
}

impl AccountStore {
    /// Load all accounts. The caller builds a fresh directory from the
    /// result and swaps it in wholesale.
    ///
    /// # Errors
    ///
    /// Returns `ScError::Database` when the backing query fails. A static
    /// store never fails.
    pub async fn load(&self) -> Result<Vec<Account>, ScError> {
        match self {
            Self::MySql(store) => store.load().await,
            Self::Static(store) => Ok(store.load()),
        }
    }

    /// Short label for logs and the status surface.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MySql(_) => "mysql",
            Self::Static(_) => "static",
        }
    }
}

/// MySQL-backed store: `accounts` joined with `plans`, properties stored as
/// JSON text columns.
#[derive(Debug, Clone)]
pub struct MySqlAccountStore {
    pool: MySqlPool,
}

impl MySqlAccountStore {
    /// Connect a pool against `database_url`.
    ///
    /// # Errors
    ///
    /// Returns `ScError::Database` when the pool cannot be established.
    pub async fn connect(database_url: &str) -> Result<Self, ScError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(DEFAULT_POOL_MAX_CONNECTIONS)
            .acquire_timeout(DEFAULT_ACQUIRE_TIMEOUT)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    #[must_use]
    pub fn from_pool(pool: MySqlPool) -> Self {
        Self { pool }
    }

    /// Load every account with its plan. Rows without a token are dropped;
    /// a malformed JSON document degrades that row to defaults rather than
    /// failing the whole load.
    #[instrument(skip_all)]
    async fn load(&self) -> Result<Vec<Account>, ScError> {
        let start = Instant::now();

        let query_result: Result<Vec<AccountRow>, sqlx::Error> = sqlx::query_as(
            r#"
            SELECT a.id, a.name, a.token, a.properties, p.properties AS plan
            FROM accounts a
            LEFT JOIN plans p ON a.planId = p.id
            "#,
        )
        .fetch_all(&self.pool)
        .await;

        let (status, rows) = match query_result {
            Ok(r) => ("success", Ok(r)),
            Err(e) => ("error", Err(e)),
        };
        metrics::record_db_query("load_accounts", status, start.elapsed());

        let accounts = rows?
            .into_iter()
            .filter(|row| row.token.as_deref().is_some_and(|t| !t.is_empty()))
            .map(AccountRow::into_account)
            .collect();

        Ok(accounts)
    }
}

/// Development store: one account, unlimited plan, credential from config.
#[derive(Debug, Clone)]
pub struct StaticAccountStore {
    token: String,
}

impl StaticAccountStore {
    #[must_use]
    pub fn new(token: &str) -> Self {
        Self {
            token: token.to_string(),
        }
    }

    fn load(&self) -> Vec<Account> {
        vec![Account {
            id: 0,
            name: STATIC_ACCOUNT_NAME.to_string(),
            token: self.token.clone(),
            properties: serde_json::Value::Object(serde_json::Map::new()),
            plan: Plan::default(),
        }]
    }
}

// ============================================================================
// Database Row Types
// ============================================================================

#[derive(sqlx::FromRow)]
struct AccountRow {
    id: i64,
    name: String,
    token: Option<String>,
    properties: Option<String>,
    plan: Option<String>,
}

impl AccountRow {
    fn into_account(self) -> Account {
        let properties = parse_document(self.properties.as_deref(), &self.name, "properties")
            .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new()));
        let plan = parse_document(self.plan.as_deref(), &self.name, "plan")
            .and_then(|value| match serde_json::from_value::<Plan>(value) {
                Ok(plan) => Some(plan),
                Err(e) => {
                    warn!(
                        target: "sc.accounts",
                        account = %self.name,
                        error = %e,
                        "Plan document has unexpected shape, using defaults"
                    );
                    None
                }
            })
            .unwrap_or_default();

        Account {
            id: self.id,
            name: self.name,
            token: self.token.unwrap_or_default(),
            properties,
            plan,
        }
    }
}

fn parse_document(raw: Option<&str>, account: &str, column: &str) -> Option<serde_json::Value> {
    let raw = raw?;
    if raw.is_empty() {
        return None;
    }
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(
                target: "sc.accounts",
                account = %account,
                column = %column,
                error = %e,
                "Malformed JSON document, using defaults"
            );
            None
        }
    }
}
