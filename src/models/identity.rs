use crate::error::{AppError, Result};

/// Caller role
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserRole {
    Admin,
    User,
}

impl UserRole {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "admin" => UserRole::Admin,
            _ => UserRole::User,
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, UserRole::Admin)
    }
}

/// Verified caller identity, supplied by the external authentication boundary
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub role: UserRole,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.role.is_admin()
    }
}

/// Capability check: the caller must own the resource, or be an admin.
pub fn ensure_owner(identity: &Identity, owner_id: &str) -> Result<()> {
    if identity.is_admin() || identity.user_id == owner_id {
        Ok(())
    } else {
        Err(AppError::Forbidden("Access denied".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident(id: &str, role: UserRole) -> Identity {
        Identity {
            user_id: id.to_string(),
            role,
        }
    }

    #[test]
    fn owner_passes_capability_check() {
        assert!(ensure_owner(&ident("u1", UserRole::User), "u1").is_ok());
    }

    #[test]
    fn non_owner_is_forbidden() {
        let err = ensure_owner(&ident("u2", UserRole::User), "u1").unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[test]
    fn admin_passes_for_any_owner() {
        assert!(ensure_owner(&ident("u2", UserRole::Admin), "u1").is_ok());
    }
}
