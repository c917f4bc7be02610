//! Membership model: roles, the membership report delivered to candidates,
//! and the consumer-facing [`Candidate`] trait.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BoxError;

/// Role of a participant within its cluster. `Dead` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    NotAMember,
    Follower,
    Leader,
    Dead,
}

impl Role {
    /// Stable byte representation, used by the participant to keep its role
    /// in an atomic.
    pub const fn as_u8(self) -> u8 {
        match self {
            Role::NotAMember => 0,
            Role::Follower => 1,
            Role::Leader => 2,
            Role::Dead => 3,
        }
    }

    pub const fn from_u8(value: u8) -> Role {
        match value {
            1 => Role::Follower,
            2 => Role::Leader,
            3 => Role::Dead,
            _ => Role::NotAMember,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::NotAMember => "not-a-member",
            Role::Follower => "follower",
            Role::Leader => "leader",
            Role::Dead => "dead",
        };
        f.write_str(name)
    }
}

/// Membership report delivered to a candidate on every role transition and
/// on every observed leader change while following.
///
/// `Leader` carries no endpoint: the candidate itself is the leader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Membership {
    NotAMember,
    Follower { leader: String },
    Leader,
}

impl Membership {
    pub fn role(&self) -> Role {
        match self {
            Membership::NotAMember => Role::NotAMember,
            Membership::Follower { .. } => Role::Follower,
            Membership::Leader => Role::Leader,
        }
    }

    /// Endpoint of the leader being followed; `None` unless following.
    pub fn leader(&self) -> Option<&str> {
        match self {
            Membership::Follower { leader } => Some(leader),
            _ => None,
        }
    }
}

impl fmt::Display for Membership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Membership::NotAMember => f.write_str("not-a-member"),
            Membership::Follower { leader } => write!(f, "follower of {leader}"),
            Membership::Leader => f.write_str("leader"),
        }
    }
}

/// Consumer-supplied callback object driven through role transitions.
///
/// `update_membership` may block and may fail; a failure is treated as the
/// candidate refusing the transition, which demotes the participant to
/// `NotAMember` (and surrenders the leader key if one was just granted).
/// The `Display` implementation is the candidate's stable logging
/// identifier.
#[async_trait]
pub trait Candidate: fmt::Display + Send + Sync {
    async fn update_membership(&self, membership: Membership) -> Result<(), BoxError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_byte_representation_round_trips() {
        for role in [Role::NotAMember, Role::Follower, Role::Leader, Role::Dead] {
            assert_eq!(Role::from_u8(role.as_u8()), role);
        }
        // Unknown bytes collapse to the initial state.
        assert_eq!(Role::from_u8(42), Role::NotAMember);
    }

    #[test]
    fn membership_accessors() {
        let m = Membership::Follower {
            leader: "a:6379".into(),
        };
        assert_eq!(m.role(), Role::Follower);
        assert_eq!(m.leader(), Some("a:6379"));
        assert_eq!(m.to_string(), "follower of a:6379");

        assert_eq!(Membership::Leader.role(), Role::Leader);
        assert_eq!(Membership::Leader.leader(), None);
        assert_eq!(Membership::NotAMember.leader(), None);
    }
}
