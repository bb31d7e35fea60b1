//! Accounting precondition for authorizing transfers
//!
//! Before a token is issued the deal's collateral is tagged against the
//! provider's balances. Bookkeeping itself lives behind [`FundsGate`]; this
//! module only needs its insufficient-funds signal. [`ReservePool`] is a
//! small in-memory gate for local nodes and tests.

use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{info, warn};

use crate::auth::{generate_auth_token, AuthError, AuthTokenDb, AuthValue};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FundsError {
    #[error("insufficient funds: available {available} < required {required} for {purpose}")]
    InsufficientFunds {
        purpose: &'static str,
        available: u128,
        required: u128,
    },

    #[error("funds already tagged for deal {0}")]
    AlreadyTagged(String),

    #[error("no funds tagged for deal {0}")]
    NotTagged(String),
}

#[derive(Debug, thiserror::Error)]
pub enum AuthorizeError {
    #[error(transparent)]
    InsufficientFunds(FundsError),

    #[error("Funds error: {0}")]
    Funds(FundsError),

    #[error("Token store error: {0}")]
    Auth(#[from] AuthError),
}

impl From<FundsError> for AuthorizeError {
    fn from(e: FundsError) -> Self {
        match e {
            FundsError::InsufficientFunds { .. } => AuthorizeError::InsufficientFunds(e),
            other => AuthorizeError::Funds(other),
        }
    }
}

/// Amounts reserved for one deal
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaggedFunds {
    pub collateral: u128,
    pub publish_message: u128,
}

/// External accounting collaborator
pub trait FundsGate: Send + Sync {
    /// Reserve `collateral` (plus whatever the gate requires for publishing) for a deal
    fn tag(&self, deal_id: &str, collateral: u128) -> Result<TaggedFunds, FundsError>;

    /// Release everything reserved for a deal
    fn untag(&self, deal_id: &str) -> Result<TaggedFunds, FundsError>;
}

/// In-memory balances with per-deal reservations
///
/// Collateral available for a new deal is the collateral balance minus
/// everything already tagged. Each deal additionally reserves
/// `publish_min` from the publish-message balance.
pub struct ReservePool {
    collateral_balance: u128,
    publish_balance: u128,
    publish_min: u128,
    tagged: Mutex<HashMap<String, TaggedFunds>>,
}

impl ReservePool {
    pub fn new(collateral_balance: u128, publish_balance: u128, publish_min: u128) -> Self {
        Self {
            collateral_balance,
            publish_balance,
            publish_min,
            tagged: Mutex::new(HashMap::new()),
        }
    }

    /// Sum of everything currently tagged
    pub fn total_tagged(&self) -> TaggedFunds {
        self.tagged
            .lock()
            .values()
            .fold(TaggedFunds::default(), |acc, t| TaggedFunds {
                collateral: acc.collateral + t.collateral,
                publish_message: acc.publish_message + t.publish_message,
            })
    }
}

impl FundsGate for ReservePool {
    fn tag(&self, deal_id: &str, collateral: u128) -> Result<TaggedFunds, FundsError> {
        let mut tagged = self.tagged.lock();
        if tagged.contains_key(deal_id) {
            return Err(FundsError::AlreadyTagged(deal_id.to_string()));
        }

        let (tagged_collateral, tagged_publish) = tagged
            .values()
            .fold((0u128, 0u128), |(c, p), t| (c + t.collateral, p + t.publish_message));

        let available = self.collateral_balance.saturating_sub(tagged_collateral);
        if available < collateral {
            return Err(FundsError::InsufficientFunds {
                purpose: "deal collateral",
                available,
                required: collateral,
            });
        }

        let available = self.publish_balance.saturating_sub(tagged_publish);
        if available < self.publish_min {
            return Err(FundsError::InsufficientFunds {
                purpose: "publish message",
                available,
                required: self.publish_min,
            });
        }

        let funds = TaggedFunds {
            collateral,
            publish_message: self.publish_min,
        };
        tagged.insert(deal_id.to_string(), funds);
        info!(
            "Tagged funds for deal {}: collateral={}, publish={}",
            deal_id, funds.collateral, funds.publish_message
        );
        Ok(funds)
    }

    fn untag(&self, deal_id: &str) -> Result<TaggedFunds, FundsError> {
        let funds = self
            .tagged
            .lock()
            .remove(deal_id)
            .ok_or_else(|| FundsError::NotTagged(deal_id.to_string()))?;
        info!("Untagged funds for deal {}", deal_id);
        Ok(funds)
    }
}

/// Reserve funds for a deal and issue a token for its transfer
///
/// If the token cannot be stored the reservation is released again.
pub async fn authorize_transfer(
    gate: &dyn FundsGate,
    tokens: &AuthTokenDb,
    deal_id: &str,
    collateral: u128,
    value: AuthValue,
) -> Result<String, AuthorizeError> {
    gate.tag(deal_id, collateral)?;

    let token = generate_auth_token();
    if let Err(e) = tokens.put(&token, &value).await {
        if let Err(untag_err) = gate.untag(deal_id) {
            warn!("Failed to release funds for deal {}: {}", deal_id, untag_err);
        }
        return Err(e.into());
    }

    info!(
        "Authorized transfer of {} for {} (deal {})",
        value.payload_cid, value.id, deal_id
    );
    Ok(token)
}

/// Revoke a transfer's token and release its reservation
pub async fn conclude_transfer(
    gate: &dyn FundsGate,
    tokens: &AuthTokenDb,
    deal_id: &str,
    token: &str,
) -> Result<TaggedFunds, AuthorizeError> {
    tokens.delete(token).await?;
    Ok(gate.untag(deal_id)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_id::raw_cid;
    use tempfile::TempDir;

    fn value() -> AuthValue {
        let cid = raw_cid(b"payload").unwrap();
        AuthValue::new("client", cid, cid, 100)
    }

    #[test]
    fn test_tag_respects_collateral_balance() {
        let pool = ReservePool::new(100, 50, 10);

        pool.tag("deal-1", 60).unwrap();
        let err = pool.tag("deal-2", 60).unwrap_err();
        assert_eq!(
            err,
            FundsError::InsufficientFunds {
                purpose: "deal collateral",
                available: 40,
                required: 60,
            }
        );

        pool.tag("deal-2", 40).unwrap();
        assert_eq!(
            pool.total_tagged(),
            TaggedFunds {
                collateral: 100,
                publish_message: 20,
            }
        );
    }

    #[test]
    fn test_tag_reserves_publish_minimum() {
        let pool = ReservePool::new(1_000, 25, 10);
        pool.tag("a", 1).unwrap();
        pool.tag("b", 1).unwrap();
        assert!(matches!(
            pool.tag("c", 1),
            Err(FundsError::InsufficientFunds {
                purpose: "publish message",
                available: 5,
                ..
            })
        ));
    }

    #[test]
    fn test_untag_releases_and_rejects_unknown() {
        let pool = ReservePool::new(100, 100, 1);
        pool.tag("deal", 100).unwrap();
        assert!(matches!(pool.tag("deal", 1), Err(FundsError::AlreadyTagged(_))));

        let released = pool.untag("deal").unwrap();
        assert_eq!(released.collateral, 100);
        assert_eq!(pool.untag("deal"), Err(FundsError::NotTagged("deal".into())));
        pool.tag("other", 100).unwrap();
    }

    #[tokio::test]
    async fn test_authorize_and_conclude() {
        let dir = TempDir::new().unwrap();
        let tokens = AuthTokenDb::open(dir.path()).unwrap();
        let pool = ReservePool::new(100, 100, 1);

        let token = authorize_transfer(&pool, &tokens, "deal", 80, value())
            .await
            .unwrap();
        let stored = tokens.get(&token).await.unwrap().unwrap();
        assert_eq!(stored.id, "client");
        assert_eq!(stored.size, 100);

        let released = conclude_transfer(&pool, &tokens, "deal", &token)
            .await
            .unwrap();
        assert_eq!(released.collateral, 80);
        assert_eq!(tokens.get(&token).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_insufficient_funds_issues_no_token() {
        let dir = TempDir::new().unwrap();
        let tokens = AuthTokenDb::open(dir.path()).unwrap();
        let pool = ReservePool::new(10, 100, 1);

        let result = authorize_transfer(&pool, &tokens, "deal", 80, value()).await;
        assert!(matches!(result, Err(AuthorizeError::InsufficientFunds(_))));
        assert_eq!(pool.total_tagged(), TaggedFunds::default());
    }
}
