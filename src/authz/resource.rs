//! Resource registry.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::RoleService;
use crate::{
    storage::{collections, encode, fetch, find_all, modify, DocumentStore, Filter, StorageError},
    Error, Result,
};

/// Well-known resource ids.
pub mod resource_id {
    pub const SUPERUSER: &str = "authz:superuser";
    pub const IMPERSONATE: &str = "authz:impersonate";
    pub const ACCESS_ALL_TENANTS: &str = "authz:tenant:access";
    pub const CREDENTIALS_ACCESS: &str = "iam:credentials:access";
    pub const CREDENTIALS_EDIT: &str = "iam:credentials:edit";
    pub const SESSION_ACCESS: &str = "iam:session:access";
    pub const SESSION_TERMINATE: &str = "iam:session:terminate";
    pub const RESOURCE_ACCESS: &str = "iam:resource:access";
    pub const RESOURCE_EDIT: &str = "iam:resource:edit";
    pub const CLIENT_ACCESS: &str = "iam:client:access";
    pub const CLIENT_EDIT: &str = "iam:client:edit";
    pub const TENANT_ACCESS: &str = "iam:tenant:access";
    pub const TENANT_CREATE: &str = "iam:tenant:create";
    pub const TENANT_EDIT: &str = "iam:tenant:edit";
    pub const TENANT_DELETE: &str = "iam:tenant:delete";
    pub const TENANT_ASSIGN: &str = "iam:tenant:assign";
    pub const ROLE_ACCESS: &str = "iam:role:access";
    pub const ROLE_EDIT: &str = "iam:role:edit";
    pub const ROLE_ASSIGN: &str = "iam:role:assign";
}

/// Resources that can only be granted through global roles.
pub const GLOBAL_ONLY_RESOURCES: &[&str] = &[
    resource_id::SUPERUSER,
    resource_id::IMPERSONATE,
    resource_id::ACCESS_ALL_TENANTS,
    resource_id::SESSION_ACCESS,
    resource_id::SESSION_TERMINATE,
    resource_id::RESOURCE_ACCESS,
    resource_id::RESOURCE_EDIT,
    resource_id::CLIENT_ACCESS,
    resource_id::CLIENT_EDIT,
    resource_id::TENANT_CREATE,
];

#[must_use]
pub fn is_global_only(resource: &str) -> bool {
    GLOBAL_ONLY_RESOURCES.contains(&resource)
}

/// Built-in resources and their descriptions.
#[must_use]
pub fn builtin_resources() -> Vec<(&'static str, &'static str)> {
    use resource_id::*;
    vec![
        (SUPERUSER, "Grants superuser access, including the access to all tenants."),
        (IMPERSONATE, "Open a session as a different user."),
        (ACCESS_ALL_TENANTS, "Grants non-superuser access to all tenants."),
        (CREDENTIALS_ACCESS, "List credentials and view credentials details."),
        (CREDENTIALS_EDIT, "Edit and suspend credentials."),
        (SESSION_ACCESS, "List sessions and view session details."),
        (SESSION_TERMINATE, "Terminate sessions."),
        (RESOURCE_ACCESS, "List resources and view resource details."),
        (RESOURCE_EDIT, "Edit and delete resources."),
        (CLIENT_ACCESS, "List clients and view client details."),
        (CLIENT_EDIT, "Edit and delete clients."),
        (TENANT_ACCESS, "List tenants, view tenant detail and see tenant members."),
        (TENANT_CREATE, "Create new tenants."),
        (TENANT_EDIT, "Edit tenant data."),
        (TENANT_DELETE, "Delete tenant."),
        (TENANT_ASSIGN, "Assign and unassign tenant members."),
        (ROLE_ACCESS, "Search tenant roles, view role detail and list role bearers."),
        (ROLE_EDIT, "Create, edit and delete tenant roles."),
        (ROLE_ASSIGN, "Assign and unassign tenant roles."),
    ]
}

/// Lowercase, colon-namespaced, 2 to 128 characters.
///
/// # Errors
/// Returns `Validation` when `id` does not match.
pub fn validate_resource_id(id: &str) -> Result<()> {
    if Regex::new(r"^[a-z][a-z0-9:._-]{0,126}[a-z0-9]$").is_ok_and(|re| re.is_match(id)) {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "invalid resource id {id:?}: use a-z, 0-9 and '.:_-', start with a letter, \
             end with a letter or digit, 2 to 128 characters"
        )))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Managed resources are provisioned by the server itself.
    #[serde(default)]
    pub managed: bool,
    #[serde(default)]
    pub deleted: bool,
}

impl Resource {
    #[must_use]
    pub fn read_only(&self) -> bool {
        self.managed
    }

    #[must_use]
    pub fn global_only(&self) -> bool {
        is_global_only(&self.id)
    }

    fn ensure_editable(&self) -> Result<()> {
        if self.read_only() {
            info!(resource = %self.id, "resource is not editable");
            return Err(Error::NotEditable(format!("resource {}", self.id)));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct ResourceService {
    store: Arc<dyn DocumentStore>,
    roles: RoleService,
}

impl ResourceService {
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, roles: RoleService) -> Self {
        Self { store, roles }
    }

    /// Create missing built-in resources and refresh stale descriptions.
    ///
    /// # Errors
    /// Returns an error if storage fails.
    pub async fn ensure_builtin(&self) -> Result<()> {
        for (id, description) in builtin_resources() {
            debug!(resource = id, "checking built-in resource");
            match self.get(id).await {
                Ok(existing) => {
                    if existing.managed && existing.description.as_deref() == Some(description) {
                        continue;
                    }
                    modify::<Resource, _>(self.store.as_ref(), collections::RESOURCES, id, |r| {
                        r.description = Some(description.to_string());
                        r.managed = true;
                        Ok(())
                    })
                    .await?;
                }
                Err(Error::NotFound(_)) => {
                    self.insert(id, Some(description), true).await?;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn insert(&self, id: &str, description: Option<&str>, managed: bool) -> Result<()> {
        let resource = Resource {
            id: id.to_string(),
            description: description.map(ToString::to_string),
            managed,
            deleted: false,
        };
        self.store
            .insert(collections::RESOURCES, id, encode(&resource)?, None)
            .await?;
        info!(resource = %id, "resource created");
        Ok(())
    }

    /// # Errors
    /// `Validation` for a malformed id, `Conflict` if it exists.
    pub async fn create(&self, id: &str, description: Option<&str>) -> Result<()> {
        validate_resource_id(id)?;
        self.insert(id, description, false).await
    }

    /// # Errors
    /// Returns `NotFound` if the resource does not exist.
    pub async fn get(&self, id: &str) -> Result<Resource> {
        match fetch::<Resource>(self.store.as_ref(), collections::RESOURCES, id).await {
            Ok(doc) => Ok(doc.value),
            Err(StorageError::NotFound { .. }) => Err(Error::not_found(format!("resource {id}"))),
            Err(err) => Err(err.into()),
        }
    }

    /// Resources sorted by id; soft-deleted ones only when asked.
    ///
    /// # Errors
    /// Returns an error if storage fails.
    pub async fn list(&self, include_deleted: bool) -> Result<Vec<Resource>> {
        let filter = if include_deleted {
            Filter::all()
        } else {
            Filter::all().eq("/deleted", false)
        };
        Ok(
            find_all::<Resource>(self.store.as_ref(), collections::RESOURCES, &filter)
                .await?
                .into_iter()
                .map(|doc| doc.value)
                .collect(),
        )
    }

    /// An empty description clears it.
    ///
    /// # Errors
    /// `NotFound`, or `NotEditable` for managed resources.
    pub async fn update(&self, id: &str, description: &str) -> Result<()> {
        self.get(id).await?.ensure_editable()?;
        modify::<Resource, _>(self.store.as_ref(), collections::RESOURCES, id, |r| {
            r.ensure_editable()?;
            r.description = (!description.is_empty()).then(|| description.to_string());
            Ok(())
        })
        .await?;
        info!(resource = %id, "resource updated");
        Ok(())
    }

    /// Remove the resource from every role, then soft- or hard-delete it.
    ///
    /// # Errors
    /// `NotFound`, or `NotEditable` for managed resources.
    pub async fn delete(&self, id: &str, hard_delete: bool) -> Result<()> {
        self.get(id).await?.ensure_editable()?;
        let roles = self.roles.replace_resource(id, None).await?;
        if roles > 0 {
            info!(resource = %id, n_roles = roles, "resource unassigned");
        }

        if hard_delete {
            self.store.delete(collections::RESOURCES, id).await?;
            warn!(resource = %id, "resource deleted");
        } else {
            modify::<Resource, _>(self.store.as_ref(), collections::RESOURCES, id, |r| {
                r.deleted = true;
                Ok(())
            })
            .await?;
            info!(resource = %id, "resource soft-deleted");
        }
        Ok(())
    }

    /// # Errors
    /// `NotFound`, or `Conflict` if the resource is not soft-deleted.
    pub async fn undelete(&self, id: &str) -> Result<()> {
        modify::<Resource, _>(self.store.as_ref(), collections::RESOURCES, id, |r| {
            if !r.deleted {
                return Err(Error::Conflict(format!(
                    "resource {} has not been soft-deleted",
                    r.id
                )));
            }
            r.deleted = false;
            Ok(())
        })
        .await
        .map_err(|err| match err {
            Error::Storage(StorageError::NotFound { .. }) => {
                Error::not_found(format!("resource {id}"))
            }
            other => other,
        })?;
        info!(resource = %id, "resource undeleted");
        Ok(())
    }

    /// Create `new_id` with the old description, move it into every role
    /// holding `id` and drop `id`. Not atomic; a failure midway leaves both.
    ///
    /// # Errors
    /// `NotFound`, `NotEditable`, `Validation` or `Conflict` for `new_id`.
    pub async fn rename(&self, id: &str, new_id: &str) -> Result<()> {
        let resource = self.get(id).await?;
        resource.ensure_editable()?;
        self.create(new_id, resource.description.as_deref()).await?;
        let roles = self.roles.replace_resource(id, Some(new_id)).await?;
        self.store.delete(collections::RESOURCES, id).await?;
        info!(old_resource = %id, new_resource = %new_id, n_roles = roles, "resource renamed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn service() -> ResourceService {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        ResourceService::new(store.clone(), RoleService::new(store))
    }

    #[test]
    fn resource_id_shape() {
        assert!(validate_resource_id("app:read").is_ok());
        assert!(validate_resource_id("ab").is_ok());
        assert!(validate_resource_id(&format!("a{}", "b".repeat(127))).is_ok());
        assert!(validate_resource_id(&format!("a{}", "b".repeat(128))).is_err());
        assert!(validate_resource_id("a").is_err());
        assert!(validate_resource_id("App:read").is_err());
        assert!(validate_resource_id("app:read:").is_err());
        assert!(validate_resource_id("1app").is_err());
    }

    #[test]
    fn global_only_set() {
        assert!(is_global_only(resource_id::SUPERUSER));
        assert!(is_global_only(resource_id::TENANT_CREATE));
        assert!(!is_global_only(resource_id::TENANT_EDIT));
        assert!(!is_global_only("app:read"));
    }

    #[tokio::test]
    async fn builtin_resources_are_managed() -> anyhow::Result<()> {
        let resources = service();
        resources.ensure_builtin().await?;
        resources.ensure_builtin().await?;

        let superuser = resources.get(resource_id::SUPERUSER).await?;
        assert!(superuser.read_only());
        assert!(superuser.global_only());
        assert!(matches!(
            resources.update(resource_id::SUPERUSER, "mine now").await,
            Err(Error::NotEditable(_))
        ));
        assert!(matches!(
            resources.delete(resource_id::SUPERUSER, true).await,
            Err(Error::NotEditable(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn soft_delete_and_undelete() -> anyhow::Result<()> {
        let resources = service();
        resources.create("app:read", Some("Read app data")).await?;
        assert!(matches!(
            resources.create("app:read", None).await,
            Err(Error::Conflict(_))
        ));

        resources.delete("app:read", false).await?;
        assert!(resources.list(false).await?.is_empty());
        assert_eq!(resources.list(true).await?.len(), 1);

        resources.undelete("app:read").await?;
        assert!(matches!(
            resources.undelete("app:read").await,
            Err(Error::Conflict(_))
        ));
        assert_eq!(resources.list(false).await?.len(), 1);

        resources.update("app:read", "").await?;
        assert_eq!(resources.get("app:read").await?.description, None);
        Ok(())
    }
}
