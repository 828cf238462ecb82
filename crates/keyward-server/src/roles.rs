//! Role records assigned at registration

use std::sync::Arc;

use keyward_core::{
    messages, IdentityError, Result, Role, RoleStore, StoreError, ROLE_ADMIN, ROLE_GUEST,
    ROLE_MEMBER,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::audit::{audit_log, AuditEvent};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRoleRequest {
    pub name: String,
    #[serde(default)]
    pub permissions: String,
}

pub struct RoleService {
    roles: Arc<dyn RoleStore>,
}

impl RoleService {
    pub fn new(roles: Arc<dyn RoleStore>) -> Self {
        Self { roles }
    }

    pub async fn create_role(&self, request: CreateRoleRequest) -> Result<Role> {
        let name = request.name.trim();
        if name.is_empty() {
            return Err(IdentityError::bad_request(messages::INVALID_ROLE_NAME));
        }

        let role = Role::new(name, request.permissions);
        match self.roles.create_role(&role).await {
            Ok(()) => {}
            Err(StoreError::UniqueViolation(_)) => {
                return Err(IdentityError::conflict(messages::ROLE_NAME_CONFLICT));
            }
            Err(e) => return Err(e.into()),
        }

        audit_log(&AuditEvent::RoleCreated {
            name: role.name.clone(),
        });
        Ok(role)
    }

    pub async fn list_roles(&self) -> Result<Vec<Role>> {
        Ok(self.roles.list_roles().await?)
    }

    /// Make sure the built-in roles exist. Safe to run on every start.
    pub async fn seed_defaults(&self) -> Result<()> {
        for (name, permissions) in [
            (ROLE_ADMIN, "admin"),
            (ROLE_MEMBER, "member"),
            (ROLE_GUEST, "guest"),
        ] {
            match self.roles.create_role(&Role::new(name, permissions)).await {
                Ok(()) => info!(role = name, "Seeded role"),
                Err(StoreError::UniqueViolation(_)) => debug!(role = name, "Role already present"),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
