//! Account directory: token-keyed account lookup with a name index.
//!
//! The directory is immutable per refresh. Loading builds a complete new
//! directory and swaps it in wholesale behind [`DirectoryHandle`]; readers
//! always see a consistent snapshot via `Arc` cloning. No in-place mutation.

use crate::admission::NameRestriction;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Numeric plan limits. Absent or zero means unlimited for that dimension.
///
/// Plans are stored as JSON documents on the billing side; unknown keys are
/// ignored so plan rollouts don't have to coordinate with this service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Plan {
    pub max_connections: Option<u32>,
    pub total_bitrate: Option<u32>,
    pub bitrate: Option<u32>,
    pub audio_bitrate: Option<u32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<u32>,
    pub stream_players: Option<u32>,
}

/// One account as loaded from the store.
///
/// `properties` is a free-form JSON document owned by the billing side; this
/// service only reads the handful of keys exposed through the accessors
/// below. The token never serializes into status output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub name: String,
    #[serde(skip_serializing)]
    pub token: String,
    #[serde(default)]
    pub properties: serde_json::Value,
    #[serde(default)]
    pub plan: Plan,
}

impl Account {
    /// Whether the `suspended` property is set truthy.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        match self.properties.get("suspended") {
            Some(serde_json::Value::Bool(b)) => *b,
            Some(serde_json::Value::Number(n)) => n.as_i64().is_some_and(|v| v != 0),
            Some(serde_json::Value::String(s)) => !s.is_empty() && s != "0" && s != "false",
            _ => false,
        }
    }

    /// External credential-verification endpoint, when the account has one.
    #[must_use]
    pub fn login_url(&self) -> Option<&str> {
        self.properties
            .get("loginUrl")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }

    /// Channel-name restriction policy from the `restrictPublish` property.
    #[must_use]
    pub fn name_restriction(&self) -> NameRestriction {
        NameRestriction::from_property(
            self.properties.get("restrictPublish").and_then(|v| v.as_str()),
        )
    }
}

/// Token-keyed account map with a secondary name index.
#[derive(Debug, Default)]
pub struct AccountDirectory {
    by_token: HashMap<String, Arc<Account>>,
    by_name: HashMap<String, String>,
}

impl AccountDirectory {
    /// Build a directory from loaded accounts. Records without a token are
    /// dropped, matching the store contract.
    #[must_use]
    pub fn from_accounts(accounts: Vec<Account>) -> Self {
        let mut by_token = HashMap::with_capacity(accounts.len());
        let mut by_name = HashMap::with_capacity(accounts.len());
        for account in accounts {
            if account.token.is_empty() {
                continue;
            }
            by_name.insert(account.name.clone(), account.token.clone());
            by_token.insert(account.token.clone(), Arc::new(account));
        }
        Self { by_token, by_name }
    }

    #[must_use]
    pub fn by_token(&self, token: &str) -> Option<Arc<Account>> {
        self.by_token.get(token).cloned()
    }

    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<Arc<Account>> {
        self.by_name
            .get(name)
            .and_then(|token| self.by_token.get(token))
            .cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_token.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_token.is_empty()
    }
}

/// Shared handle over the current directory snapshot.
///
/// Readers take an `Arc` clone of the whole directory; refresh swaps the
/// snapshot atomically so no reader ever observes a partially loaded state.
#[derive(Debug, Clone)]
pub struct DirectoryHandle {
    inner: Arc<RwLock<Arc<AccountDirectory>>>,
}

impl DirectoryHandle {
    #[must_use]
    pub fn new(directory: AccountDirectory) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(directory))),
        }
    }

    /// Current snapshot.
    pub async fn snapshot(&self) -> Arc<AccountDirectory> {
        self.inner.read().await.clone()
    }

    /// Wholesale replacement. Returns the new account count.
    pub async fn replace(&self, directory: AccountDirectory) -> usize {
        let count = directory.len();
        *self.inner.write().await = Arc::new(directory);
        info!(
            target: "sc.accounts",
            accounts = count,
            "Account directory replaced"
        );
        count
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn account(name: &str, token: &str, properties: serde_json::Value) -> Account {
        Account {
            id: 1,
            name: name.to_string(),
            token: token.to_string(),
            properties,
            plan: Plan::default(),
        }
    }

    #[test]
    fn test_plan_deserializes_wire_names_and_ignores_unknown() {
        let plan: Plan = serde_json::from_value(json!({
            "maxConnections": 10,
            "totalBitrate": 5000,
            "audioBitrate": 256,
            "frameRate": 30,
            "streamPlayers": 100,
            "someFutureKnob": true
        }))
        .unwrap();

        assert_eq!(plan.max_connections, Some(10));
        assert_eq!(plan.total_bitrate, Some(5000));
        assert_eq!(plan.audio_bitrate, Some(256));
        assert_eq!(plan.frame_rate, Some(30));
        assert_eq!(plan.stream_players, Some(100));
        assert_eq!(plan.bitrate, None);
    }

    #[test]
    fn test_account_serialization_omits_token() {
        let value =
            serde_json::to_value(account("acme", "tok-secret", json!({}))).unwrap();
        assert!(value.get("token").is_none());
        assert_eq!(value["name"], "acme");
    }

    #[test]
    fn test_suspended_property_truthiness() {
        assert!(account("a", "t", json!({"suspended": true})).is_suspended());
        assert!(account("a", "t", json!({"suspended": 1})).is_suspended());
        assert!(account("a", "t", json!({"suspended": "yes"})).is_suspended());
        assert!(!account("a", "t", json!({"suspended": false})).is_suspended());
        assert!(!account("a", "t", json!({"suspended": 0})).is_suspended());
        assert!(!account("a", "t", json!({"suspended": "0"})).is_suspended());
        assert!(!account("a", "t", json!({"suspended": ""})).is_suspended());
        assert!(!account("a", "t", json!({})).is_suspended());
    }

    #[test]
    fn test_login_url_requires_non_empty_string() {
        assert_eq!(
            account("a", "t", json!({"loginUrl": "https://x/login"})).login_url(),
            Some("https://x/login")
        );
        assert_eq!(account("a", "t", json!({"loginUrl": ""})).login_url(), None);
        assert_eq!(account("a", "t", json!({})).login_url(), None);
    }

    #[test]
    fn test_name_restriction_from_properties() {
        assert_eq!(
            account("a", "t", json!({"restrictPublish": "prefix"})).name_restriction(),
            NameRestriction::Prefix
        );
        assert_eq!(
            account("a", "t", json!({})).name_restriction(),
            NameRestriction::None
        );
    }

    #[test]
    fn test_directory_lookup_by_token_and_name() {
        let directory = AccountDirectory::from_accounts(vec![
            account("acme", "tok-a", json!({})),
            account("globex", "tok-g", json!({})),
        ]);

        assert_eq!(directory.len(), 2);
        assert_eq!(directory.by_token("tok-a").unwrap().name, "acme");
        assert_eq!(directory.by_name("globex").unwrap().token, "tok-g");
        assert!(directory.by_token("tok-x").is_none());
        assert!(directory.by_name("nobody").is_none());
    }

    #[test]
    fn test_directory_drops_tokenless_accounts() {
        let directory = AccountDirectory::from_accounts(vec![
            account("acme", "tok-a", json!({})),
            account("untokened", "", json!({})),
        ]);

        assert_eq!(directory.len(), 1);
        assert!(directory.by_name("untokened").is_none());
    }

    #[tokio::test]
    async fn test_handle_replace_swaps_wholesale() {
        let handle = DirectoryHandle::new(AccountDirectory::from_accounts(vec![account(
            "acme",
            "tok-a",
            json!({}),
        )]));

        let before = handle.snapshot().await;
        assert!(before.by_token("tok-a").is_some());

        let count = handle
            .replace(AccountDirectory::from_accounts(vec![account(
                "globex",
                "tok-g",
                json!({}),
            )]))
            .await;
        assert_eq!(count, 1);

        let after = handle.snapshot().await;
        assert!(after.by_token("tok-a").is_none());
        assert!(after.by_token("tok-g").is_some());

        // A snapshot taken before the swap still resolves the old account.
        assert!(before.by_token("tok-a").is_some());
    }
}
