//! Roles and role assignments.
//!
//! Role ids are `<tenant>/<name>` for tenant roles and `*/<name>` for global
//! roles. A tenant role can only be assigned to credentials that are members
//! of its tenant and can never carry a global-only resource.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, fmt, sync::Arc};
use tracing::info;

use super::{is_global_only, Resource, GLOBAL_SCOPE};
use crate::{
    storage::{collections, encode, fetch, find_all, modify, DocumentStore, Filter, StorageError},
    Error, Result,
};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RoleId {
    tenant: Option<String>,
    name: String,
}

impl RoleId {
    /// # Errors
    /// Returns `Validation` if `id` is not `<tenant|*>/<name>`.
    pub fn parse(id: &str) -> Result<Self> {
        let (scope, name) = id
            .split_once('/')
            .ok_or_else(|| Error::validation(format!("invalid role id {id:?}")))?;
        if !Regex::new(r"^[a-zA-Z][a-zA-Z0-9_.-]{0,63}$").is_ok_and(|re| re.is_match(name)) {
            return Err(Error::validation(format!("invalid role name {name:?}")));
        }
        let tenant = match scope {
            GLOBAL_SCOPE => None,
            "" => return Err(Error::validation(format!("invalid role id {id:?}"))),
            tenant => Some(tenant.to_string()),
        };
        Ok(Self {
            tenant,
            name: name.to_string(),
        })
    }

    #[must_use]
    pub fn tenant(&self) -> Option<&str> {
        self.tenant.as_deref()
    }

    #[must_use]
    pub fn is_global(&self) -> bool {
        self.tenant.is_none()
    }
}

impl fmt::Display for RoleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}",
            self.tenant.as_deref().unwrap_or(GLOBAL_SCOPE),
            self.name
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: String,
    #[serde(default)]
    pub tenant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub resources: BTreeSet<String>,
    #[serde(default)]
    pub managed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct RoleAssignment {
    cid: String,
    role: String,
    tenant: Option<String>,
}

fn assignment_id(credentials_id: &str, role_id: &str) -> String {
    format!("{credentials_id} {role_id}")
}

pub(super) fn tenant_assignment_id(credentials_id: &str, tenant: &str) -> String {
    format!("{credentials_id} {tenant}")
}

fn role_not_found(id: &str) -> impl FnOnce(Error) -> Error + '_ {
    move |err| match err {
        Error::Storage(StorageError::NotFound { .. }) => Error::not_found(format!("role {id}")),
        other => other,
    }
}

#[derive(Clone)]
pub struct RoleService {
    store: Arc<dyn DocumentStore>,
}

impl RoleService {
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    async fn check_resources(&self, role: &RoleId, resources: &[String]) -> Result<()> {
        for resource_id in resources {
            if !role.is_global() && is_global_only(resource_id) {
                return Err(Error::validation(format!(
                    "resource {resource_id} can only be granted by global roles"
                )));
            }
            let resource =
                fetch::<Resource>(self.store.as_ref(), collections::RESOURCES, resource_id)
                    .await
                    .map_err(|_| Error::not_found(format!("resource {resource_id}")))?;
            if resource.value.deleted {
                return Err(Error::not_found(format!("resource {resource_id}")));
            }
        }
        Ok(())
    }

    /// # Errors
    /// `Validation` for a malformed id or a global-only resource on a tenant
    /// role, `NotFound` for a missing tenant or resource, `Conflict` if taken.
    pub async fn create(
        &self,
        role_id: &str,
        description: Option<&str>,
        resources: &[String],
    ) -> Result<Role> {
        let id = RoleId::parse(role_id)?;
        if let Some(tenant) = id.tenant() {
            self.store
                .get(collections::TENANTS, tenant)
                .await
                .map_err(|_| Error::TenantNotFound(tenant.to_string()))?;
        }
        self.check_resources(&id, resources).await?;

        let role = Role {
            id: id.to_string(),
            tenant: id.tenant().map(ToString::to_string),
            description: description.map(ToString::to_string),
            resources: resources.iter().cloned().collect(),
            managed: false,
        };
        self.store
            .insert(collections::ROLES, &role.id, encode(&role)?, None)
            .await?;
        info!(role = %role.id, "role created");
        Ok(role)
    }

    /// # Errors
    /// Returns `NotFound` if the role does not exist.
    pub async fn get(&self, role_id: &str) -> Result<Role> {
        match fetch::<Role>(self.store.as_ref(), collections::ROLES, role_id).await {
            Ok(doc) => Ok(doc.value),
            Err(StorageError::NotFound { .. }) => Err(Error::not_found(format!("role {role_id}"))),
            Err(err) => Err(err.into()),
        }
    }

    /// Roles visible in `tenant` (its own roles plus global ones) or only
    /// global roles when `tenant` is `None`; optionally only those holding
    /// `resource`.
    ///
    /// # Errors
    /// Returns an error if storage fails.
    pub async fn list(&self, tenant: Option<&str>, resource: Option<&str>) -> Result<Vec<Role>> {
        let filter = match resource {
            Some(resource) => Filter::all().contains("/resources", resource),
            None => Filter::all(),
        };
        Ok(
            find_all::<Role>(self.store.as_ref(), collections::ROLES, &filter)
                .await?
                .into_iter()
                .map(|doc| doc.value)
                .filter(|role| role.tenant.is_none() || role.tenant.as_deref() == tenant)
                .collect(),
        )
    }

    /// Add and remove resources, optionally replacing the description.
    ///
    /// # Errors
    /// `NotFound`, `NotEditable` for managed roles, `Validation` as in [`Self::create`].
    pub async fn update(
        &self,
        role_id: &str,
        description: Option<&str>,
        add: &[String],
        remove: &[String],
    ) -> Result<Role> {
        let id = RoleId::parse(role_id)?;
        if self.get(role_id).await?.managed {
            return Err(Error::NotEditable(format!("role {role_id}")));
        }
        self.check_resources(&id, add).await?;

        let doc = modify::<Role, _>(self.store.as_ref(), collections::ROLES, role_id, |role| {
            if let Some(description) = description {
                role.description = (!description.is_empty()).then(|| description.to_string());
            }
            for resource in remove {
                role.resources.remove(resource);
            }
            role.resources.extend(add.iter().cloned());
            Ok(())
        })
        .await
        .map_err(role_not_found(role_id))?;
        info!(role = %role_id, added = add.len(), removed = remove.len(), "role updated");
        Ok(doc.value)
    }

    /// Unassign the role from everyone, then delete it.
    ///
    /// # Errors
    /// `NotFound`, or `NotEditable` for managed roles.
    pub async fn delete(&self, role_id: &str) -> Result<()> {
        if self.get(role_id).await?.managed {
            return Err(Error::NotEditable(format!("role {role_id}")));
        }
        let assignments = self
            .store
            .find(
                collections::ROLE_ASSIGNMENTS,
                &Filter::all().eq("/role", role_id),
            )
            .await?;
        for assignment in &assignments {
            self.store
                .delete(collections::ROLE_ASSIGNMENTS, &assignment.id)
                .await?;
        }
        self.store.delete(collections::ROLES, role_id).await?;
        info!(role = %role_id, unassigned = assignments.len(), "role deleted");
        Ok(())
    }

    /// Replace (or with `None` drop) a resource in every role holding it.
    /// Returns how many roles changed.
    pub(super) async fn replace_resource(&self, old: &str, new: Option<&str>) -> Result<usize> {
        let roles = self.list_all_with_resource(old).await?;
        for role in &roles {
            modify::<Role, _>(self.store.as_ref(), collections::ROLES, &role.id, |role| {
                role.resources.remove(old);
                if let Some(new) = new {
                    role.resources.insert(new.to_string());
                }
                Ok(())
            })
            .await?;
        }
        Ok(roles.len())
    }

    async fn list_all_with_resource(&self, resource: &str) -> Result<Vec<Role>> {
        Ok(find_all::<Role>(
            self.store.as_ref(),
            collections::ROLES,
            &Filter::all().contains("/resources", resource),
        )
        .await?
        .into_iter()
        .map(|doc| doc.value)
        .collect())
    }

    /// # Errors
    /// `NotFound` for an unknown role, `TenantAccessDenied` when the
    /// credentials are not members of the role's tenant, `Conflict` if
    /// already assigned.
    pub async fn assign(&self, credentials_id: &str, role_id: &str) -> Result<()> {
        let role = self.get(role_id).await?;
        if let Some(tenant) = role.tenant.as_deref() {
            self.store
                .get(
                    collections::TENANT_ASSIGNMENTS,
                    &tenant_assignment_id(credentials_id, tenant),
                )
                .await
                .map_err(|_| Error::TenantAccessDenied {
                    subject: credentials_id.to_string(),
                    tenant: tenant.to_string(),
                })?;
        }
        let assignment = RoleAssignment {
            cid: credentials_id.to_string(),
            role: role.id.clone(),
            tenant: role.tenant.clone(),
        };
        self.store
            .insert(
                collections::ROLE_ASSIGNMENTS,
                &assignment_id(credentials_id, &role.id),
                encode(&assignment)?,
                None,
            )
            .await?;
        info!(cid = %credentials_id, role = %role.id, "role assigned");
        Ok(())
    }

    /// Idempotent.
    ///
    /// # Errors
    /// Returns an error if storage fails.
    pub async fn unassign(&self, credentials_id: &str, role_id: &str) -> Result<()> {
        if self
            .store
            .delete(
                collections::ROLE_ASSIGNMENTS,
                &assignment_id(credentials_id, role_id),
            )
            .await?
        {
            info!(cid = %credentials_id, role = %role_id, "role unassigned");
        }
        Ok(())
    }

    /// Role ids assigned to the credentials; `Some(tenant)` limits the result
    /// to that tenant's roles, `Some("*")` to global roles.
    ///
    /// # Errors
    /// Returns an error if storage fails.
    pub async fn get_assigned(
        &self,
        credentials_id: &str,
        tenant: Option<&str>,
    ) -> Result<Vec<String>> {
        let mut filter = Filter::all().eq("/cid", credentials_id);
        match tenant {
            Some(GLOBAL_SCOPE) => filter = filter.eq("/tenant", serde_json::Value::Null),
            Some(tenant) => filter = filter.eq("/tenant", tenant),
            None => {}
        }
        Ok(
            find_all::<RoleAssignment>(self.store.as_ref(), collections::ROLE_ASSIGNMENTS, &filter)
                .await?
                .into_iter()
                .map(|doc| doc.value.role)
                .collect(),
        )
    }

    /// Make `roles` exactly the credentials' roles within `tenant` (`*` for
    /// global roles). Roles from other scopes are rejected.
    ///
    /// # Errors
    /// `Validation` for a role outside the scope, otherwise as [`Self::assign`].
    pub async fn set_roles(&self, credentials_id: &str, tenant: &str, roles: &[String]) -> Result<()> {
        let wanted: BTreeSet<&str> = roles.iter().map(String::as_str).collect();
        for role_id in &wanted {
            let id = RoleId::parse(role_id)?;
            if id.tenant().unwrap_or(GLOBAL_SCOPE) != tenant {
                return Err(Error::validation(format!(
                    "role {role_id} does not belong to scope {tenant}"
                )));
            }
        }

        let current = self.get_assigned(credentials_id, Some(tenant)).await?;
        for role_id in current.iter().filter(|r| !wanted.contains(r.as_str())) {
            self.unassign(credentials_id, role_id).await?;
        }
        for role_id in wanted
            .iter()
            .filter(|r| !current.iter().any(|c| c == **r))
        {
            self.assign(credentials_id, role_id).await?;
        }
        Ok(())
    }

    /// Union of resources held by the given roles; missing roles are skipped.
    ///
    /// # Errors
    /// Returns an error if storage fails.
    pub async fn resources_of(&self, role_ids: &[String]) -> Result<BTreeSet<String>> {
        let mut resources = BTreeSet::new();
        for role_id in role_ids {
            match self.get(role_id).await {
                Ok(role) => resources.extend(role.resources),
                Err(Error::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(resources)
    }

    /// Delete every role scoped to `tenant` together with its assignments.
    pub(super) async fn delete_tenant_roles(&self, tenant: &str) -> Result<usize> {
        let roles = find_all::<Role>(
            self.store.as_ref(),
            collections::ROLES,
            &Filter::all().eq("/tenant", tenant),
        )
        .await?;
        for role in &roles {
            let assignments = self
                .store
                .find(
                    collections::ROLE_ASSIGNMENTS,
                    &Filter::all().eq("/role", role.value.id.as_str()),
                )
                .await?;
            for assignment in assignments {
                self.store
                    .delete(collections::ROLE_ASSIGNMENTS, &assignment.id)
                    .await?;
            }
            self.store.delete(collections::ROLES, &role.id).await?;
        }
        Ok(roles.len())
    }
}
