//! Auth models
//! Mission: Operator accounts and role claims for the admin surface

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role hierarchy: admin > analyst > viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    Analyst,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Analyst => "analyst",
            Role::Admin => "admin",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "viewer" => Some(Role::Viewer),
            "analyst" => Some(Role::Analyst),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Role::Viewer => 1,
            Role::Analyst => 2,
            Role::Admin => 3,
        }
    }

    /// True when this role grants at least `required`'s privileges.
    pub fn at_least(&self, required: Role) -> bool {
        self.rank() >= required.rank()
    }
}

/// An operator account (seeded or created by an admin).
#[derive(Debug, Clone)]
pub struct Operator {
    pub id: Uuid,
    pub username: String,
    pub password_hash: String,
    pub role: Role,
    pub org_id: String,
    pub created_at: String,
}

/// JWT claims carried on every authenticated request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Operator id.
    pub sub: String,
    pub username: String,
    pub role: Role,
    pub org_id: String,
    pub exp: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_hierarchy() {
        assert!(Role::Admin.at_least(Role::Viewer));
        assert!(Role::Admin.at_least(Role::Admin));
        assert!(Role::Analyst.at_least(Role::Viewer));
        assert!(!Role::Analyst.at_least(Role::Admin));
        assert!(!Role::Viewer.at_least(Role::Analyst));
    }

    #[test]
    fn test_role_round_trip() {
        for role in [Role::Viewer, Role::Analyst, Role::Admin] {
            assert_eq!(Role::from_str(role.as_str()), Some(role));
        }
        assert_eq!(Role::from_str("root"), None);
    }
}
