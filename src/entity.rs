use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            other => anyhow::bail!("Unknown role: {}", other),
        }
    }
}

/// The shape handed over by the external identity provider on sign-in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub email: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub display_name: String,
    pub role: Role,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Map an identity seen for the first time to a local record.
    /// The distinguished admin email is the only way to get `Role::Admin` implicitly.
    pub fn from_identity(identity: &Identity, admin_email: &str) -> Self {
        let now = Utc::now();
        let role = if identity.email.eq_ignore_ascii_case(admin_email) {
            Role::Admin
        } else {
            Role::User
        };

        Self {
            id: identity.id.clone(),
            email: identity.email.clone(),
            display_name: identity
                .display_name
                .clone()
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| identity.email.clone()),
            role,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(email: &str, name: Option<&str>) -> Identity {
        Identity {
            id: "u-1".to_string(),
            email: email.to_string(),
            display_name: name.map(str::to_string),
        }
    }

    #[test]
    fn admin_email_gets_admin_role() {
        let user = User::from_identity(&identity("Admin@Example.com", None), "admin@example.com");
        assert_eq!(user.role, Role::Admin);
        assert!(user.is_active);
    }

    #[test]
    fn other_emails_get_user_role_and_fallback_name() {
        let user = User::from_identity(&identity("someone@example.com", Some("  ")), "admin@example.com");
        assert_eq!(user.role, Role::User);
        assert_eq!(user.display_name, "someone@example.com");
    }

    #[test]
    fn role_parses_from_wire_value() {
        assert_eq!("admin".parse::<Role>().unwrap(), Role::Admin);
        assert!("root".parse::<Role>().is_err());
    }
}
