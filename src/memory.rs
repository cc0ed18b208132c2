use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::errors::CoreError;
use crate::models::{
    ConversationTurn, PortfolioDelta, Position, TurnRole, UserContext, UserProfile,
};
use crate::vector::{field_str, FieldValue, VectorStore};

// ============================================================
// Contextual Memory Service
// ============================================================
//
// Per-user soft state: profile, preferences, portfolio, and a
// bounded conversation tail. This service is the only writer of
// user state; writes for the same user serialize on a per-user
// lock. Loss of the store is tolerated — load falls back to a
// default profile.
// ============================================================

pub const MEMORY_PREFIX: &str = "usermem:";

pub struct MemoryService {
    store: Arc<dyn VectorStore>,
    max_turns: usize,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl MemoryService {
    pub fn new(store: Arc<dyn VectorStore>, max_turns: usize) -> Self {
        Self {
            store,
            max_turns,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Profile + conversation tail. Unknown users get a fresh default
    /// profile; a broken store degrades the same way with a warning.
    pub async fn load(&self, user_id: &str) -> UserContext {
        let fields = match self.store.get(MEMORY_PREFIX, user_id).await {
            Ok(fields) => fields,
            Err(e) => {
                tracing::warn!("memory load degraded for {}: {}", user_id, e);
                None
            }
        };

        let (profile, recent_turns) = match fields {
            Some(fields) => {
                let profile = field_str(&fields, "profile")
                    .and_then(|raw| serde_json::from_str(&raw).ok())
                    .unwrap_or_else(|| UserProfile::new(user_id));
                let turns = field_str(&fields, "turns")
                    .and_then(|raw| serde_json::from_str(&raw).ok())
                    .unwrap_or_default();
                (profile, turns)
            }
            None => (UserProfile::new(user_id), Vec::new()),
        };

        UserContext {
            profile,
            recent_turns,
        }
    }

    /// Append one turn, evicting the oldest beyond the window.
    pub async fn append_turn(
        &self,
        user_id: &str,
        role: TurnRole,
        text: &str,
    ) -> Result<(), CoreError> {
        let lock = self.user_lock(user_id).await;
        let _guard = lock.lock().await;

        let mut context = self.load(user_id).await;
        context.recent_turns.push(ConversationTurn {
            timestamp: chrono::Utc::now(),
            role,
            text: text.to_string(),
        });
        if context.recent_turns.len() > self.max_turns {
            let excess = context.recent_turns.len() - self.max_turns;
            context.recent_turns.drain(..excess);
        }
        self.persist(user_id, &context).await
    }

    /// Top-level merge into preferences.
    pub async fn update_preferences(
        &self,
        user_id: &str,
        patch: HashMap<String, serde_json::Value>,
    ) -> Result<(), CoreError> {
        let lock = self.user_lock(user_id).await;
        let _guard = lock.lock().await;

        let mut context = self.load(user_id).await;
        for (key, value) in patch {
            context.profile.preferences.insert(key, value);
        }
        self.persist(user_id, &context).await
    }

    /// Apply buy/sell deltas. Selling below zero is rejected unless the
    /// user carries an explicit allow_short preference. Buys reprice the
    /// lot at the weighted average; sells keep the existing basis.
    pub async fn update_portfolio(
        &self,
        user_id: &str,
        diffs: Vec<PortfolioDelta>,
    ) -> Result<(), CoreError> {
        let lock = self.user_lock(user_id).await;
        let _guard = lock.lock().await;

        let mut context = self.load(user_id).await;
        let allow_short = context
            .profile
            .preferences
            .get("allow_short")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        for diff in diffs {
            if diff.delta_shares == 0.0 {
                continue;
            }
            let existing = context
                .profile
                .portfolio
                .iter_mut()
                .find(|p| p.ticker == diff.ticker);

            match existing {
                Some(position) => {
                    let new_shares = position.shares + diff.delta_shares;
                    if new_shares < 0.0 && !allow_short {
                        return Err(CoreError::InvalidRequest(format!(
                            "selling {} {} would short the position",
                            -diff.delta_shares, diff.ticker
                        )));
                    }
                    if diff.delta_shares > 0.0 {
                        if diff.price <= 0.0 {
                            return Err(CoreError::InvalidRequest(format!(
                                "buy of {} needs a positive price",
                                diff.ticker
                            )));
                        }
                        let total_cost =
                            position.shares * position.avg_cost + diff.delta_shares * diff.price;
                        position.avg_cost = total_cost / new_shares;
                    }
                    position.shares = new_shares;
                }
                None => {
                    if diff.delta_shares < 0.0 && !allow_short {
                        return Err(CoreError::InvalidRequest(format!(
                            "cannot sell {} with no position",
                            diff.ticker
                        )));
                    }
                    if diff.price <= 0.0 {
                        return Err(CoreError::InvalidRequest(format!(
                            "opening {} needs a positive price",
                            diff.ticker
                        )));
                    }
                    context.profile.portfolio.push(Position {
                        ticker: diff.ticker.clone(),
                        shares: diff.delta_shares,
                        avg_cost: diff.price,
                    });
                }
            }
        }

        // Drop fully closed positions.
        context.profile.portfolio.retain(|p| p.shares != 0.0);
        self.persist(user_id, &context).await
    }

    async fn persist(&self, user_id: &str, context: &UserContext) -> Result<(), CoreError> {
        let fields = vec![
            (
                "profile".to_string(),
                FieldValue::Text(serde_json::to_string(&context.profile)?),
            ),
            (
                "turns".to_string(),
                FieldValue::Text(serde_json::to_string(&context.recent_turns)?),
            ),
            (
                "updated_at".to_string(),
                FieldValue::Number(chrono::Utc::now().timestamp_millis() as f64),
            ),
        ];
        self.store.upsert(MEMORY_PREFIX, user_id, fields).await
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RiskTolerance;
    use crate::vector::MemoryVectorStore;

    fn service(max_turns: usize) -> MemoryService {
        MemoryService::new(Arc::new(MemoryVectorStore::new()), max_turns)
    }

    #[tokio::test]
    async fn unknown_user_gets_default_profile() {
        let memory = service(50);
        let context = memory.load("nobody").await;
        assert_eq!(context.profile.user_id, "nobody");
        assert_eq!(context.profile.risk_tolerance, RiskTolerance::Moderate);
        assert!(context.profile.portfolio.is_empty());
        assert!(context.recent_turns.is_empty());
    }

    #[tokio::test]
    async fn turns_append_and_trim_to_window() {
        let memory = service(3);
        for i in 0..5 {
            memory
                .append_turn("u1", TurnRole::User, &format!("message {}", i))
                .await
                .unwrap();
        }
        let context = memory.load("u1").await;
        assert_eq!(context.recent_turns.len(), 3);
        assert_eq!(context.recent_turns[0].text, "message 2");
        assert_eq!(context.recent_turns[2].text, "message 4");
    }

    #[tokio::test]
    async fn preferences_merge_at_top_level() {
        let memory = service(50);
        memory
            .update_preferences(
                "u1",
                HashMap::from([("style".to_string(), serde_json::json!("terse"))]),
            )
            .await
            .unwrap();
        memory
            .update_preferences(
                "u1",
                HashMap::from([
                    ("style".to_string(), serde_json::json!("verbose")),
                    ("currency".to_string(), serde_json::json!("USD")),
                ]),
            )
            .await
            .unwrap();

        let context = memory.load("u1").await;
        assert_eq!(
            context.profile.preferences.get("style"),
            Some(&serde_json::json!("verbose"))
        );
        assert_eq!(
            context.profile.preferences.get("currency"),
            Some(&serde_json::json!("USD"))
        );
    }

    #[tokio::test]
    async fn buys_reprice_at_weighted_average() {
        let memory = service(50);
        memory
            .update_portfolio(
                "u1",
                vec![PortfolioDelta {
                    ticker: "AAPL".to_string(),
                    delta_shares: 10.0,
                    price: 100.0,
                }],
            )
            .await
            .unwrap();
        memory
            .update_portfolio(
                "u1",
                vec![PortfolioDelta {
                    ticker: "AAPL".to_string(),
                    delta_shares: 10.0,
                    price: 200.0,
                }],
            )
            .await
            .unwrap();

        let context = memory.load("u1").await;
        let position = &context.profile.portfolio[0];
        assert_eq!(position.shares, 20.0);
        assert!((position.avg_cost - 150.0).abs() < 1e-9);
        assert!(context.profile.check_invariants().is_ok());
    }

    #[tokio::test]
    async fn sells_keep_basis_and_close_at_zero() {
        let memory = service(50);
        memory
            .update_portfolio(
                "u1",
                vec![PortfolioDelta {
                    ticker: "AAPL".to_string(),
                    delta_shares: 10.0,
                    price: 100.0,
                }],
            )
            .await
            .unwrap();
        memory
            .update_portfolio(
                "u1",
                vec![PortfolioDelta {
                    ticker: "AAPL".to_string(),
                    delta_shares: -10.0,
                    price: 120.0,
                }],
            )
            .await
            .unwrap();

        let context = memory.load("u1").await;
        assert!(context.profile.portfolio.is_empty());
    }

    #[tokio::test]
    async fn overselling_is_rejected_without_allow_short() {
        let memory = service(50);
        memory
            .update_portfolio(
                "u1",
                vec![PortfolioDelta {
                    ticker: "AAPL".to_string(),
                    delta_shares: 5.0,
                    price: 100.0,
                }],
            )
            .await
            .unwrap();

        let err = memory
            .update_portfolio(
                "u1",
                vec![PortfolioDelta {
                    ticker: "AAPL".to_string(),
                    delta_shares: -8.0,
                    price: 100.0,
                }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidRequest(_)));

        // Position untouched after the rejected write.
        let context = memory.load("u1").await;
        assert_eq!(context.profile.portfolio[0].shares, 5.0);
    }

    #[tokio::test]
    async fn allow_short_preference_permits_negative() {
        let memory = service(50);
        memory
            .update_preferences(
                "u1",
                HashMap::from([("allow_short".to_string(), serde_json::json!(true))]),
            )
            .await
            .unwrap();
        memory
            .update_portfolio(
                "u1",
                vec![PortfolioDelta {
                    ticker: "TSLA".to_string(),
                    delta_shares: 5.0,
                    price: 200.0,
                }],
            )
            .await
            .unwrap();
        memory
            .update_portfolio(
                "u1",
                vec![PortfolioDelta {
                    ticker: "TSLA".to_string(),
                    delta_shares: -8.0,
                    price: 210.0,
                }],
            )
            .await
            .unwrap();

        let context = memory.load("u1").await;
        assert_eq!(context.profile.portfolio[0].shares, -3.0);
    }

    #[tokio::test]
    async fn concurrent_appends_serialize_per_user() {
        let memory = Arc::new(service(50));
        let mut handles = Vec::new();
        for i in 0..10 {
            let memory = memory.clone();
            handles.push(tokio::spawn(async move {
                memory
                    .append_turn("u1", TurnRole::User, &format!("m{}", i))
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let context = memory.load("u1").await;
        assert_eq!(context.recent_turns.len(), 10);
    }
}
