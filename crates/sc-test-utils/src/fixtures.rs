//! Account fixtures for signaling tests.

use sc_service::accounts::{Account, Plan};
use serde_json::json;

/// Account with an unlimited plan and empty properties.
pub fn account(name: &str, token: &str) -> Account {
    account_with_properties(name, token, json!({}))
}

/// Account with explicit plan limits.
pub fn account_with_plan(name: &str, token: &str, plan: Plan) -> Account {
    Account {
        plan,
        ..account(name, token)
    }
}

/// Account with a free-form properties document (`suspended`, `loginUrl`,
/// `restrictPublish`, ...).
pub fn account_with_properties(
    name: &str,
    token: &str,
    properties: serde_json::Value,
) -> Account {
    Account {
        id: 1,
        name: name.to_string(),
        token: token.to_string(),
        properties,
        plan: Plan::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_fixture_defaults() {
        let account = account("acme", "tok-a");
        assert_eq!(account.name, "acme");
        assert_eq!(account.token, "tok-a");
        assert_eq!(account.plan, Plan::default());
        assert!(!account.is_suspended());
    }

    #[test]
    fn test_account_with_plan_keeps_limits() {
        let account = account_with_plan(
            "acme",
            "tok-a",
            Plan {
                max_connections: Some(2),
                ..Plan::default()
            },
        );
        assert_eq!(account.plan.max_connections, Some(2));
    }

    #[test]
    fn test_account_with_properties_reads_through() {
        let account =
            account_with_properties("acme", "tok-a", json!({"suspended": true}));
        assert!(account.is_suspended());
    }
}
