//! Effective grant computation and access checks.

use std::collections::BTreeSet;

use super::{is_global_only, resource_id, Authz, RoleService, GLOBAL_SCOPE};
use crate::Result;

#[derive(Clone)]
pub struct RbacService {
    roles: RoleService,
}

impl RbacService {
    #[must_use]
    pub fn new(roles: RoleService) -> Self {
        Self { roles }
    }

    /// Fold the credentials' role assignments into a grant map.
    ///
    /// `*` holds the union of global roles. Every tenant in `tenants` gets its
    /// own roles plus the global resources, minus global-only resources.
    /// `exclude` is removed from every set last, so nothing can re-grant it.
    ///
    /// # Errors
    /// Returns an error if storage fails.
    pub async fn compute_authorization(
        &self,
        credentials_id: &str,
        tenants: &BTreeSet<String>,
        exclude: &[&str],
    ) -> Result<Authz> {
        let global_roles = self
            .roles
            .get_assigned(credentials_id, Some(GLOBAL_SCOPE))
            .await?;
        let global = self.roles.resources_of(&global_roles).await?;

        let mut authz = Authz::new();
        for tenant in tenants {
            if tenant == GLOBAL_SCOPE {
                continue;
            }
            let tenant_roles = self
                .roles
                .get_assigned(credentials_id, Some(tenant))
                .await?;
            let mut resources = self.roles.resources_of(&tenant_roles).await?;
            resources.extend(global.iter().cloned());
            resources.retain(|r| !is_global_only(r));
            authz.insert(tenant.clone(), resources);
        }
        authz.insert(GLOBAL_SCOPE.to_string(), global);

        for resources in authz.values_mut() {
            resources.retain(|r| !exclude.contains(&r.as_str()));
        }
        Ok(authz)
    }
}

#[must_use]
pub fn is_superuser(authz: &Authz) -> bool {
    authz
        .get(GLOBAL_SCOPE)
        .is_some_and(|global| global.contains(resource_id::SUPERUSER))
}

/// Whether `authz` grants every `required` resource in `tenant` (or globally
/// when `tenant` is `None`). Superusers pass unconditionally; a tenant absent
/// from the map never passes.
#[must_use]
pub fn has_resource_access(authz: &Authz, tenant: Option<&str>, required: &[&str]) -> bool {
    if is_superuser(authz) {
        return true;
    }
    let empty = BTreeSet::new();
    let global = authz.get(GLOBAL_SCOPE).unwrap_or(&empty);
    match tenant {
        None | Some(GLOBAL_SCOPE) => required.iter().all(|r| global.contains(*r)),
        Some(tenant) => match authz.get(tenant) {
            None => false,
            Some(granted) => required
                .iter()
                .all(|r| granted.contains(*r) || global.contains(*r)),
        },
    }
}
