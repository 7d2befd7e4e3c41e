use std::collections::BTreeSet;
use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use data_encoding::HEXLOWER;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{ElectionId, RecordId, VoterId};

/// Number of random bytes in a token id.
pub const TOKEN_BYTES: usize = 16;

/// Number of hex characters in a token id.
pub const LENGTH: usize = TOKEN_BYTES * 2;

/// The identifier handed to a voter after submission, used to fetch their
/// stored ballot through the verification channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TokenId {
    hex: String,
}

impl TokenId {
    /// Generate a random token id.
    pub fn random() -> Self {
        Self {
            hex: HEXLOWER.encode(&rand::random::<[u8; TOKEN_BYTES]>()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.hex
    }
}

impl Display for TokenId {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(&self.hex)
    }
}

impl FromStr for TokenId {
    type Err = ParseError;

    fn from_str(string: &str) -> Result<Self, Self::Err> {
        let len = string.len();
        if len != LENGTH {
            return Err(Self::Err::InvalidLength(len));
        }
        if let Some(c) = string.chars().find(|c| !matches!(c, '0'..='9' | 'a'..='f')) {
            return Err(Self::Err::InvalidChar(c));
        }
        Ok(Self {
            hex: string.to_string(),
        })
    }
}

impl TryFrom<String> for TokenId {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TokenId> for String {
    fn from(token: TokenId) -> Self {
        token.hex
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("token id must contain exactly {LENGTH} characters, found {0}")]
    InvalidLength(usize),
    #[error("token id must contain only lowercase hex digits, found {0:?}")]
    InvalidChar(char),
}

/// A live verification token. At most one exists per voter; it is bound to
/// the record it was issued for and the elections that record covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationToken {
    pub token_id: TokenId,
    pub voter_id: VoterId,
    pub record_id: RecordId,
    pub issued_at: DateTime<Utc>,
    pub remaining_uses: u32,
    pub bound_election_ids: BTreeSet<ElectionId>,
}

impl VerificationToken {
    /// Issue a fresh token for the given record.
    pub fn issue(
        voter_id: VoterId,
        record_id: RecordId,
        bound_election_ids: BTreeSet<ElectionId>,
        uses: u32,
    ) -> Self {
        Self {
            token_id: TokenId::random(),
            voter_id,
            record_id,
            issued_at: Utc::now(),
            remaining_uses: uses,
            bound_election_ids,
        }
    }

    /// Has more than `ttl` passed since issue?
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.issued_at > ttl
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining_uses == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ids_parse_back() {
        let token = TokenId::random();
        assert_eq!(token.as_str().len(), LENGTH);
        assert_eq!(token.as_str().parse::<TokenId>(), Ok(token.clone()));
        assert_ne!(token, TokenId::random());
    }

    #[test]
    fn malformed_ids_are_rejected() {
        assert_eq!(
            "abc".parse::<TokenId>(),
            Err(ParseError::InvalidLength(3))
        );
        let upper = "A".repeat(LENGTH);
        assert_eq!(upper.parse::<TokenId>(), Err(ParseError::InvalidChar('A')));
        let traversal = format!("../{}", "0".repeat(LENGTH - 3));
        assert_eq!(
            traversal.parse::<TokenId>(),
            Err(ParseError::InvalidChar('.'))
        );
    }

    #[test]
    fn expiry_and_exhaustion() {
        let mut token = VerificationToken::issue(
            "v1".parse().unwrap(),
            "r1".parse().unwrap(),
            BTreeSet::new(),
            1,
        );
        let ttl = Duration::minutes(30);
        assert!(!token.is_expired(token.issued_at + ttl, ttl));
        assert!(token.is_expired(token.issued_at + ttl + Duration::seconds(1), ttl));
        assert!(!token.is_exhausted());
        token.remaining_uses -= 1;
        assert!(token.is_exhausted());
    }
}
