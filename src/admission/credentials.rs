use crate::models::Credential;
use chrono::{DateTime, Utc};

/// Pick the credential to spend next.
///
/// Expired credentials are skipped. Among the rest the one closest to expiry
/// wins, so long-lived tokens stay in reserve; credentials without an expiry
/// sort after every dated one. Ties keep the input order.
pub fn select_active_credential(credentials: &[Credential], now: DateTime<Utc>) -> Option<Credential> {
    credentials
        .iter()
        .filter(|credential| !credential.is_expired_at(now))
        .min_by_key(|credential| (credential.expires_at.is_none(), credential.expires_at))
        .cloned()
}
