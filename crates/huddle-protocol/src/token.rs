//! Pairing and room-join tokens.
//!
//! Tokens are what QR codes encode. Rendering them is someone else's job;
//! the server only issues and parses the text form.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const PAIRING_PREFIX: &str = "pairing:";
const ROOM_PREFIX: &str = "join_room:";

/// Token parse errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("Unknown token format")]
    UnknownFormat,

    #[error("Token carries an empty identifier")]
    EmptyIdentifier,
}

/// A parsed token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Token {
    /// Targets a specific user for a directed invite.
    Pairing(String),
    /// Lets the scanner join a room.
    Room(String),
}

impl Token {
    /// Pairing token for a user.
    #[must_use]
    pub fn pairing(user_id: impl Into<String>) -> Self {
        Token::Pairing(user_id.into())
    }

    /// Join token for a room.
    #[must_use]
    pub fn room(room_id: impl Into<String>) -> Self {
        Token::Room(room_id.into())
    }

    /// The user id of a pairing token.
    #[must_use]
    pub fn as_pairing(&self) -> Option<&str> {
        match self {
            Token::Pairing(id) => Some(id),
            Token::Room(_) => None,
        }
    }

    /// The room id of a join token.
    #[must_use]
    pub fn as_room(&self) -> Option<&str> {
        match self {
            Token::Room(id) => Some(id),
            Token::Pairing(_) => None,
        }
    }
}

impl FromStr for Token {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (token, id): (fn(String) -> Token, &str) =
            if let Some(id) = s.strip_prefix(PAIRING_PREFIX) {
                (Token::Pairing, id)
            } else if let Some(id) = s.strip_prefix(ROOM_PREFIX) {
                (Token::Room, id)
            } else {
                return Err(TokenError::UnknownFormat);
            };

        if id.is_empty() {
            return Err(TokenError::EmptyIdentifier);
        }
        Ok(token(id.to_string()))
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Pairing(id) => write!(f, "{PAIRING_PREFIX}{id}"),
            Token::Room(id) => write!(f, "{ROOM_PREFIX}{id}"),
        }
    }
}
