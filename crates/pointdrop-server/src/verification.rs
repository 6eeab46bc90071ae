//! One-time email verification tokens.
//!
//! The plaintext token is handed out once and never stored; lookups use its
//! SHA-256 hash.

use chrono::{DateTime, Duration, Utc};
use pointdrop_checkmac::sha256_hex;
use rand::RngCore;
use tracing::{debug, info};

use crate::models::{Consumed, IssuedToken};
use crate::store::{StoreResult, TokenStore};

/// Random bytes per token.
const TOKEN_BYTES: usize = 32;

/// Generates a random hex token.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Hash under which a token is stored.
pub fn hash_token(token: &str) -> String {
    sha256_hex(token.as_bytes())
}

/// Issues a token for `subject`, invalidating any earlier one.
pub async fn issue<T: TokenStore + ?Sized>(
    store: &T,
    subject: &str,
    ttl: Duration,
    now: DateTime<Utc>,
) -> StoreResult<IssuedToken> {
    let token = generate_token();
    let expires_at = now + ttl;

    store.issue_token(subject, &hash_token(&token), expires_at).await?;
    info!(subject = %subject, expires_at = %expires_at, "Verification token issued");

    Ok(IssuedToken { token, expires_at })
}

/// Consumes a token. The stored row is deleted whether it was live or expired.
pub async fn consume<T: TokenStore + ?Sized>(
    store: &T,
    token: &str,
    now: DateTime<Utc>,
) -> StoreResult<Consumed> {
    let token = token.trim();
    if token.is_empty() {
        return Ok(Consumed::Invalid);
    }

    let consumed = store.consume_token(&hash_token(token), now).await?;
    match &consumed {
        Consumed::Success(subject) => info!(subject = %subject, "Email verified"),
        other => debug!(status = other.status(), "Verification token rejected"),
    }
    Ok(consumed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Ledger, MemoryStore};

    #[test]
    fn test_tokens_are_random_hex() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), TOKEN_BYTES * 2);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
        assert_ne!(hash_token(&a), a);
    }

    #[tokio::test]
    async fn test_issue_and_consume() {
        let store = MemoryStore::new();
        store.open_account("acct_1").await.unwrap();
        let now = Utc::now();

        let issued = issue(&store, "acct_1", Duration::minutes(30), now).await.unwrap();
        assert_eq!(issued.expires_at, now + Duration::minutes(30));

        let consumed = consume(&store, &issued.token, now).await.unwrap();
        assert_eq!(consumed, Consumed::Success("acct_1".to_string()));
        assert_eq!(consume(&store, &issued.token, now).await.unwrap(), Consumed::Invalid);
    }

    #[tokio::test]
    async fn test_reissue_invalidates_previous_token() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let old = issue(&store, "acct_1", Duration::minutes(30), now).await.unwrap();
        let new = issue(&store, "acct_1", Duration::minutes(30), now).await.unwrap();

        assert_eq!(consume(&store, &old.token, now).await.unwrap(), Consumed::Invalid);
        assert!(matches!(
            consume(&store, &new.token, now).await.unwrap(),
            Consumed::Success(_)
        ));
    }

    #[tokio::test]
    async fn test_expired_token_is_consumed() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let issued = issue(&store, "acct_1", Duration::minutes(30), now).await.unwrap();

        let later = now + Duration::minutes(31);
        assert_eq!(consume(&store, &issued.token, later).await.unwrap(), Consumed::Expired);
        assert_eq!(consume(&store, &issued.token, later).await.unwrap(), Consumed::Invalid);
    }

    #[tokio::test]
    async fn test_blank_token_is_invalid() {
        let store = MemoryStore::new();
        assert_eq!(consume(&store, "  ", Utc::now()).await.unwrap(), Consumed::Invalid);
    }
}
