//! Roles and the static permission table
//!
//! The table is compile-time: every (role, permission) pair is a `match`
//! arm, so adding a permission without deciding who holds it fails to
//! build. Room scoping is layered on top for the `user` role and for
//! panels; admin and owner bypass it entirely.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Four-tier principal roles; panels are a separate principal kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
    Owner,
}

impl Role {
    pub const fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
            Role::Owner => "owner",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            "owner" => Ok(Role::Owner),
            other => Err(Error::Validation(format!("unknown role: {}", other))),
        }
    }
}

/// Everything a principal can be allowed to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    DeviceRead,
    DeviceOperate,
    DeviceConfigure,
    SceneExecute,
    /// Room-scoped for the `user` role
    SceneManage,
    LocationManage,
    CommissionManage,
    UserManage,
    UserManageAll,
    SystemAdmin,
    SystemDangerous,
}

impl Permission {
    pub const fn as_str(self) -> &'static str {
        match self {
            Permission::DeviceRead => "device:read",
            Permission::DeviceOperate => "device:operate",
            Permission::DeviceConfigure => "device:configure",
            Permission::SceneExecute => "scene:execute",
            Permission::SceneManage => "scene:manage",
            Permission::LocationManage => "location:manage",
            Permission::CommissionManage => "commission:manage",
            Permission::UserManage => "user:manage",
            Permission::UserManageAll => "user:manage:all",
            Permission::SystemAdmin => "system:admin",
            Permission::SystemDangerous => "system:dangerous",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The static role-permission table
pub fn role_has_permission(role: Role, permission: Permission) -> bool {
    use Permission::*;
    use Role::*;

    match (role, permission) {
        (_, DeviceRead) => true,
        (_, DeviceOperate) => true,
        (Admin | Owner, DeviceConfigure) => true,
        (User, DeviceConfigure) => false,
        (_, SceneExecute) => true,
        // Room-scoped for the user role; the scope resolver narrows it
        (_, SceneManage) => true,
        (Admin | Owner, LocationManage) => true,
        (User, LocationManage) => false,
        (Admin | Owner, CommissionManage) => true,
        (User, CommissionManage) => false,
        (Admin | Owner, UserManage) => true,
        (User, UserManage) => false,
        (Owner, UserManageAll) => true,
        (User | Admin, UserManageAll) => false,
        (Admin | Owner, SystemAdmin) => true,
        (User, SystemAdmin) => false,
        (Owner, SystemDangerous) => true,
        (User | Admin, SystemDangerous) => false,
    }
}

/// Permissions granted to an authenticated panel
pub fn panel_has_permission(permission: Permission) -> bool {
    use Permission::*;
    matches!(permission, DeviceRead | DeviceOperate | SceneExecute)
}

#[cfg(test)]
mod tests {
    use super::*;
    use Permission::*;

    #[test]
    fn test_user_permissions() {
        assert!(role_has_permission(Role::User, DeviceRead));
        assert!(role_has_permission(Role::User, DeviceOperate));
        assert!(role_has_permission(Role::User, SceneExecute));
        assert!(role_has_permission(Role::User, SceneManage));
        assert!(!role_has_permission(Role::User, DeviceConfigure));
        assert!(!role_has_permission(Role::User, LocationManage));
        assert!(!role_has_permission(Role::User, CommissionManage));
        assert!(!role_has_permission(Role::User, UserManage));
        assert!(!role_has_permission(Role::User, UserManageAll));
        assert!(!role_has_permission(Role::User, SystemAdmin));
        assert!(!role_has_permission(Role::User, SystemDangerous));
    }

    #[test]
    fn test_admin_permissions() {
        assert!(role_has_permission(Role::Admin, DeviceConfigure));
        assert!(role_has_permission(Role::Admin, LocationManage));
        assert!(role_has_permission(Role::Admin, CommissionManage));
        assert!(role_has_permission(Role::Admin, UserManage));
        assert!(role_has_permission(Role::Admin, SystemAdmin));
        assert!(!role_has_permission(Role::Admin, UserManageAll));
        assert!(!role_has_permission(Role::Admin, SystemDangerous));
    }

    #[test]
    fn test_owner_has_everything() {
        for permission in [
            DeviceRead,
            DeviceOperate,
            DeviceConfigure,
            SceneExecute,
            SceneManage,
            LocationManage,
            CommissionManage,
            UserManage,
            UserManageAll,
            SystemAdmin,
            SystemDangerous,
        ] {
            assert!(role_has_permission(Role::Owner, permission), "{permission}");
        }
    }

    #[test]
    fn test_panel_permissions() {
        assert!(panel_has_permission(DeviceRead));
        assert!(panel_has_permission(DeviceOperate));
        assert!(panel_has_permission(SceneExecute));
        assert!(!panel_has_permission(SceneManage));
        assert!(!panel_has_permission(DeviceConfigure));
        assert!(!panel_has_permission(SystemAdmin));
        assert!(!panel_has_permission(SystemDangerous));
    }

    #[test]
    fn test_role_round_trip() {
        for role in [Role::User, Role::Admin, Role::Owner] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!("panel".parse::<Role>().is_err());
        assert!("root".parse::<Role>().is_err());
    }
}
