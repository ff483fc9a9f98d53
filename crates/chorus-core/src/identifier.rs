//! Protocol identifiers.
//!
//! Every address the chat protocol hands us (users, groups, broadcast lists)
//! arrives in one of several textual variants: with or without a device
//! suffix, on the legacy `c.us` server, or as a bare phone number typed by an
//! operator. [`Jid::parse`] folds all of them into a single canonical form so
//! that, once parsed, identifier equality is plain string equality.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{IdentifierError, IdentifierResult};

/// Shortest phone number accepted as a user identifier.
const MIN_NUMBER_LEN: usize = 5;
/// Longest phone number accepted as a user identifier.
const MAX_NUMBER_LEN: usize = 20;

// =============================================================================
// Server
// =============================================================================

/// The server half of an identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Server {
    /// Individual users (`s.whatsapp.net`; legacy `c.us` is folded here).
    User,
    /// Privacy-preserving local ids (`lid`).
    Lid,
    /// Group chats (`g.us`).
    Group,
    /// Broadcast lists and status (`broadcast`).
    Broadcast,
    /// Channels (`newsletter`).
    Newsletter,
}

impl Server {
    /// Returns the canonical server suffix.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "s.whatsapp.net",
            Self::Lid => "lid",
            Self::Group => "g.us",
            Self::Broadcast => "broadcast",
            Self::Newsletter => "newsletter",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "s.whatsapp.net" | "c.us" => Some(Self::User),
            "lid" => Some(Self::Lid),
            "g.us" => Some(Self::Group),
            "broadcast" => Some(Self::Broadcast),
            "newsletter" => Some(Self::Newsletter),
            _ => None,
        }
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Jid
// =============================================================================

/// A normalized protocol identifier (`<user>@<server>`).
///
/// Construct one with [`Jid::parse`]; the result never carries a device or
/// agent suffix, so two `Jid`s refer to the same endpoint exactly when they
/// compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Jid {
    user: String,
    server: Server,
}

impl Jid {
    /// Parses and normalizes any textual identifier variant.
    ///
    /// Accepted inputs:
    /// - `2348012345678@s.whatsapp.net`, `2348012345678:12@s.whatsapp.net`
    /// - `2348012345678@c.us` (rewritten to `s.whatsapp.net`)
    /// - `120363025246125486@g.us`, `1234567890-1612345678@g.us`
    /// - `+234 801-234-5678` (bare number, read as a user)
    /// - `status@broadcast`, `<digits>@lid`, `<digits>@newsletter`
    pub fn parse(input: &str) -> IdentifierResult<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(IdentifierError::invalid(input, "empty identifier"));
        }

        let Some((user, server)) = trimmed.rsplit_once('@') else {
            return Self::from_number(trimmed);
        };

        let server = Server::parse(server)
            .ok_or_else(|| IdentifierError::invalid(input, "unknown server"))?;
        let user = strip_suffixes(user);

        match server {
            Server::User => {
                check_number(user, input)?;
            }
            Server::Lid | Server::Newsletter => {
                if user.is_empty() || !user.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(IdentifierError::invalid(input, "expected digits"));
                }
            }
            Server::Group => {
                let valid = !user.is_empty()
                    && user.split('-').all(|part| {
                        !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit())
                    });
                if !valid {
                    return Err(IdentifierError::invalid(input, "malformed group id"));
                }
            }
            Server::Broadcast => {
                if user.is_empty() {
                    return Err(IdentifierError::invalid(input, "empty broadcast id"));
                }
            }
        }

        Ok(Self {
            user: user.to_string(),
            server,
        })
    }

    /// Builds a user identifier from a phone number written in any common
    /// human format (`+`, spaces, dashes and parentheses are ignored).
    pub fn from_number(number: &str) -> IdentifierResult<Self> {
        let digits: String = number
            .chars()
            .filter(|c| !matches!(c, '+' | ' ' | '-' | '(' | ')'))
            .collect();
        check_number(&digits, number)?;
        Ok(Self {
            user: digits,
            server: Server::User,
        })
    }

    /// Returns the user part.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Returns the server.
    pub fn server(&self) -> Server {
        self.server
    }

    /// The bare-number projection used for identity comparison.
    pub fn bare_number(&self) -> &str {
        &self.user
    }

    /// Returns `true` for group chats.
    pub fn is_group(&self) -> bool {
        self.server == Server::Group
    }

    /// Returns `true` for individual users (phone number or local id).
    pub fn is_user(&self) -> bool {
        matches!(self.server, Server::User | Server::Lid)
    }

    /// Returns `true` for the status broadcast pseudo-chat.
    pub fn is_status(&self) -> bool {
        self.server == Server::Broadcast && self.user == "status"
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.server)
    }
}

impl FromStr for Jid {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Jid {
    type Error = IdentifierError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Jid> for String {
    fn from(jid: Jid) -> Self {
        jid.to_string()
    }
}

// =============================================================================
// Free helpers
// =============================================================================

/// Normalizes any identifier variant to its canonical string form.
pub fn normalize(input: &str) -> IdentifierResult<String> {
    Jid::parse(input).map(|jid| jid.to_string())
}

/// Returns `true` when both inputs resolve to the same bare number.
///
/// Malformed input never matches anything.
pub fn same_user(a: &str, b: &str) -> bool {
    match (Jid::parse(a), Jid::parse(b)) {
        (Ok(a), Ok(b)) => a.bare_number() == b.bare_number(),
        _ => false,
    }
}

/// Drops the device (`:12`) and agent (`_1`) suffixes from a user part.
fn strip_suffixes(user: &str) -> &str {
    let user = user.split(':').next().unwrap_or(user);
    user.split('_').next().unwrap_or(user)
}

fn check_number(digits: &str, input: &str) -> IdentifierResult<()> {
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(IdentifierError::invalid(input, "expected a phone number"));
    }
    if !(MIN_NUMBER_LEN..=MAX_NUMBER_LEN).contains(&digits.len()) {
        return Err(IdentifierError::invalid(input, "phone number length out of range"));
    }
    Ok(())
}
