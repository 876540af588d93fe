//! Caller identity and role permissions
//!
//! Authentication happens outside the crate; callers hand in an [`Actor`]
//! and mutations check its role against the table below.

use super::error::{Error, Result};
use serde::{Deserialize, Serialize};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Role {
    Admin,
    Operator,
    Viewer,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
pub enum Permission {
    #[strum(serialize = "firewall:read")]
    #[serde(rename = "firewall:read")]
    FirewallRead,
    #[strum(serialize = "firewall:write")]
    #[serde(rename = "firewall:write")]
    FirewallWrite,
    #[strum(serialize = "routes:read")]
    #[serde(rename = "routes:read")]
    RoutesRead,
    #[strum(serialize = "routes:write")]
    #[serde(rename = "routes:write")]
    RoutesWrite,
    #[strum(serialize = "ports:read")]
    #[serde(rename = "ports:read")]
    PortsRead,
    #[strum(serialize = "docker:read")]
    #[serde(rename = "docker:read")]
    DockerRead,
    #[strum(serialize = "docker:write")]
    #[serde(rename = "docker:write")]
    DockerWrite,
    #[strum(serialize = "audit:read")]
    #[serde(rename = "audit:read")]
    AuditRead,
}

impl Role {
    pub fn permissions(self) -> &'static [Permission] {
        use Permission as P;
        match self {
            Role::Admin => &[
                P::FirewallRead,
                P::FirewallWrite,
                P::RoutesRead,
                P::RoutesWrite,
                P::PortsRead,
                P::DockerRead,
                P::DockerWrite,
                P::AuditRead,
            ],
            Role::Operator => &[
                P::FirewallRead,
                P::FirewallWrite,
                P::RoutesRead,
                P::RoutesWrite,
                P::PortsRead,
                P::DockerRead,
            ],
            Role::Viewer => &[P::FirewallRead, P::RoutesRead, P::PortsRead, P::DockerRead],
        }
    }

    pub fn allows(self, permission: Permission) -> bool {
        self.permissions().contains(&permission)
    }
}

/// Identity of whoever requested an operation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    pub name: String,
    pub role: Role,
}

impl Actor {
    pub fn new(name: impl Into<String>, role: Role) -> Self {
        Self {
            name: name.into(),
            role,
        }
    }

    /// Local operator running the CLI as an administrator
    pub fn local_admin() -> Self {
        let name = std::env::var("SUDO_USER")
            .or_else(|_| std::env::var("USER"))
            .unwrap_or_else(|_| "root".to_string());
        Self::new(name, Role::Admin)
    }

    pub fn can(&self, permission: Permission) -> bool {
        self.role.allows(permission)
    }

    /// # Errors
    ///
    /// `Forbidden` when the role lacks `permission`.
    pub fn require(&self, permission: Permission) -> Result<()> {
        if self.can(permission) {
            Ok(())
        } else {
            Err(self.forbidden(permission))
        }
    }

    pub(crate) fn forbidden(&self, permission: Permission) -> Error {
        Error::Forbidden {
            actor: self.name.clone(),
            permission: permission.to_string(),
        }
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_permission_strings() {
        assert_eq!(Permission::FirewallWrite.to_string(), "firewall:write");
        assert_eq!("docker:write".parse::<Permission>().unwrap(), Permission::DockerWrite);
        assert_eq!(
            serde_json::to_string(&Permission::RoutesRead).unwrap(),
            "\"routes:read\""
        );
    }

    #[test]
    fn test_role_table() {
        assert!(Role::Admin.allows(Permission::AuditRead));
        assert!(Role::Operator.allows(Permission::FirewallWrite));
        assert!(!Role::Operator.allows(Permission::DockerWrite));
        assert!(!Role::Operator.allows(Permission::AuditRead));
        for p in Permission::iter() {
            let read_only = p.as_ref().ends_with(":read") && p != Permission::AuditRead;
            assert_eq!(Role::Viewer.allows(p), read_only, "{p}");
            assert!(Role::Admin.allows(p));
        }
    }

    #[test]
    fn test_require() {
        let viewer = Actor::new("victor", Role::Viewer);
        assert!(viewer.require(Permission::FirewallRead).is_ok());
        let err = viewer.require(Permission::RoutesWrite).unwrap_err();
        assert_eq!(err.to_string(), "victor lacks permission 'routes:write'");
    }
}
