//! Tenants, tenant membership and tenant scope resolution.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::{collections::BTreeSet, sync::Arc};
use tracing::{debug, error, info, warn};

use super::role::tenant_assignment_id;
use super::{RoleService, GLOBAL_SCOPE};
use crate::{
    audit::{AuditCode, AuditService},
    session::SessionService,
    storage::{collections, encode, fetch, find_all, modify, DocumentStore, Filter, StorageError},
    Error, Result,
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Fields to change; `None` leaves a field as it is.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct TenantUpdate {
    pub label: Option<String>,
    pub description: Option<String>,
    pub data: Option<Map<String, Value>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TenantAssignment {
    cid: String,
    tenant: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LastActivity {
    #[serde(default)]
    last_authorized_tenants: Vec<String>,
}

#[derive(Clone)]
pub struct TenantService {
    store: Arc<dyn DocumentStore>,
    roles: RoleService,
    sessions: SessionService,
    audit: AuditService,
    extra_id_chars: String,
}

impl TenantService {
    #[must_use]
    pub fn new(
        store: Arc<dyn DocumentStore>,
        roles: RoleService,
        sessions: SessionService,
        audit: AuditService,
        extra_id_chars: &str,
    ) -> Self {
        Self {
            store,
            roles,
            sessions,
            audit,
            extra_id_chars: extra_id_chars.to_string(),
        }
    }

    /// Lowercase letter first, then 2 to 31 of `a-z0-9` plus configured extras.
    ///
    /// # Errors
    /// Returns `Validation` when `id` does not match.
    pub fn validate_tenant_id(&self, id: &str) -> Result<()> {
        let pattern = format!(
            "^[a-z][a-z0-9{}]{{2,31}}$",
            regex::escape(&self.extra_id_chars)
        );
        if Regex::new(&pattern).is_ok_and(|re| re.is_match(id)) {
            return Ok(());
        }
        let allowed = if self.extra_id_chars.is_empty() {
            "lowercase letters (a-z) and numbers (0-9)".to_string()
        } else {
            format!(
                "lowercase letters (a-z), numbers (0-9) and characters {:?}",
                self.extra_id_chars
            )
        };
        Err(Error::validation(format!(
            "invalid tenant id {id:?}: use {allowed}, start with a letter, 3 to 32 characters"
        )))
    }

    /// # Errors
    /// `Validation` for a malformed id, `Conflict` if it exists.
    pub async fn create(
        &self,
        id: &str,
        label: Option<&str>,
        description: Option<&str>,
        creator_id: Option<&str>,
    ) -> Result<Tenant> {
        self.validate_tenant_id(id)?;
        let tenant = Tenant {
            id: id.to_string(),
            label: label.map(ToString::to_string),
            description: description.map(ToString::to_string),
            data: Map::new(),
            created_by: creator_id.map(ToString::to_string),
            created_at: Utc::now(),
        };
        self.store
            .insert(collections::TENANTS, id, encode(&tenant)?, None)
            .await
            .map_err(|err| {
                if matches!(err, StorageError::Duplicate { .. }) {
                    error!(tenant = %id, "tenant with this id already exists");
                }
                Error::from(err)
            })?;
        info!(tenant = %id, "tenant created");
        Ok(tenant)
    }

    /// # Errors
    /// Returns `TenantNotFound` if it does not exist.
    pub async fn get(&self, id: &str) -> Result<Tenant> {
        match fetch::<Tenant>(self.store.as_ref(), collections::TENANTS, id).await {
            Ok(doc) => Ok(doc.value),
            Err(StorageError::NotFound { .. }) => Err(Error::TenantNotFound(id.to_string())),
            Err(err) => Err(err.into()),
        }
    }

    /// # Errors
    /// Returns an error if storage fails.
    pub async fn list(&self) -> Result<Vec<Tenant>> {
        Ok(
            find_all::<Tenant>(self.store.as_ref(), collections::TENANTS, &Filter::all())
                .await?
                .into_iter()
                .map(|doc| doc.value)
                .collect(),
        )
    }

    /// # Errors
    /// Returns `TenantNotFound` if it does not exist.
    pub async fn update(&self, id: &str, update: TenantUpdate) -> Result<Tenant> {
        let doc = modify::<Tenant, _>(self.store.as_ref(), collections::TENANTS, id, |tenant| {
            if let Some(label) = &update.label {
                tenant.label = (!label.is_empty()).then(|| label.clone());
            }
            if let Some(description) = &update.description {
                tenant.description = (!description.is_empty()).then(|| description.clone());
            }
            if let Some(data) = &update.data {
                tenant.data = data.clone();
            }
            Ok(())
        })
        .await
        .map_err(|err| match err {
            Error::Storage(StorageError::NotFound { .. }) => Error::TenantNotFound(id.to_string()),
            other => other,
        })?;
        info!(tenant = %id, "tenant updated");
        Ok(doc.value)
    }

    /// Delete the tenant's roles and memberships, the tenant itself and
    /// every session that has it in scope.
    ///
    /// # Errors
    /// Returns `TenantNotFound` if it does not exist.
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.get(id).await?;

        let roles = self.roles.delete_tenant_roles(id).await?;
        let assignments = self
            .store
            .find(
                collections::TENANT_ASSIGNMENTS,
                &Filter::all().eq("/tenant", id),
            )
            .await?;
        for assignment in &assignments {
            self.store
                .delete(collections::TENANT_ASSIGNMENTS, &assignment.id)
                .await?;
        }
        self.store.delete(collections::TENANTS, id).await?;
        let sessions = self.sessions.delete_sessions_by_tenant_in_scope(id).await?;
        warn!(
            tenant = %id,
            roles,
            members = assignments.len(),
            sessions,
            "tenant deleted"
        );
        self.audit
            .append(
                AuditCode::TenantDeleted,
                json!({
                    "tenant": id,
                    "roles": roles,
                    "members": assignments.len(),
                    "sessions": sessions,
                }),
            )
            .await;
        Ok(())
    }

    /// Tenants the credentials are members of, sorted by id.
    ///
    /// # Errors
    /// Returns an error if storage fails.
    pub async fn get_tenants(&self, credentials_id: &str) -> Result<Vec<String>> {
        let mut tenants: Vec<String> = find_all::<TenantAssignment>(
            self.store.as_ref(),
            collections::TENANT_ASSIGNMENTS,
            &Filter::all().eq("/cid", credentials_id),
        )
        .await?
        .into_iter()
        .map(|doc| doc.value.tenant)
        .collect();
        tenants.sort();
        Ok(tenants)
    }

    /// # Errors
    /// `TenantNotFound`, or `Conflict` if already a member.
    pub async fn assign(&self, credentials_id: &str, tenant: &str) -> Result<()> {
        if tenant == GLOBAL_SCOPE {
            return Err(Error::validation("cannot assign the global scope"));
        }
        self.get(tenant).await?;
        let assignment = TenantAssignment {
            cid: credentials_id.to_string(),
            tenant: tenant.to_string(),
        };
        self.store
            .insert(
                collections::TENANT_ASSIGNMENTS,
                &tenant_assignment_id(credentials_id, tenant),
                encode(&assignment)?,
                None,
            )
            .await?;
        info!(cid = %credentials_id, tenant = %tenant, "tenant assigned to credentials");
        Ok(())
    }

    /// Drop the membership together with the credentials' roles in the tenant.
    ///
    /// # Errors
    /// Returns an error if storage fails.
    pub async fn unassign(&self, credentials_id: &str, tenant: &str) -> Result<()> {
        if tenant == GLOBAL_SCOPE {
            return Err(Error::validation("cannot unassign the global scope"));
        }
        self.roles.set_roles(credentials_id, tenant, &[]).await?;
        self.store
            .delete(
                collections::TENANT_ASSIGNMENTS,
                &tenant_assignment_id(credentials_id, tenant),
            )
            .await?;
        info!(cid = %credentials_id, tenant = %tenant, "tenant unassigned from credentials");
        Ok(())
    }

    /// # Errors
    /// Returns an error if storage fails.
    pub async fn has_tenant_assigned(&self, credentials_id: &str, tenant: &str) -> Result<bool> {
        match self
            .store
            .get(
                collections::TENANT_ASSIGNMENTS,
                &tenant_assignment_id(credentials_id, tenant),
            )
            .await
        {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound { .. }) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Resolve the tenant part of an OAuth2 scope.
    ///
    /// - `tenant:<id>` asks for one tenant the credentials belong to (any
    ///   existing tenant when `has_access_to_all_tenants`).
    /// - `tenant:*` asks for all of the credentials' tenants.
    /// - bare `tenant` asks for at least one: the most recently authorized
    ///   tenant, else the first by id.
    ///
    /// # Errors
    /// `TenantNotFound`, `TenantAccessDenied` or `NoTenants`.
    pub async fn get_tenants_by_scope(
        &self,
        scope: &[String],
        credentials_id: &str,
        has_access_to_all_tenants: bool,
    ) -> Result<BTreeSet<String>> {
        let user_tenants = self.get_tenants(credentials_id).await?;
        let mut tenants = BTreeSet::new();

        for item in scope {
            let Some(tenant) = item.strip_prefix("tenant:") else {
                continue;
            };
            if tenant == GLOBAL_SCOPE {
                tenants.extend(user_tenants.iter().cloned());
            } else if user_tenants.iter().any(|t| t == tenant) {
                tenants.insert(tenant.to_string());
            } else if has_access_to_all_tenants {
                self.get(tenant).await?;
                tenants.insert(tenant.to_string());
            } else if user_tenants.is_empty() {
                return Err(Error::NoTenants(credentials_id.to_string()));
            } else {
                return Err(Error::TenantAccessDenied {
                    subject: credentials_id.to_string(),
                    tenant: tenant.to_string(),
                });
            }
        }

        if tenants.is_empty() && scope.iter().any(|s| s == "tenant") {
            let last = self.get_last_authorized_tenants(credentials_id).await?;
            let fallback = last
                .into_iter()
                .find(|t| user_tenants.contains(t))
                .or_else(|| user_tenants.first().cloned())
                .ok_or_else(|| Error::NoTenants(credentials_id.to_string()))?;
            debug!(cid = %credentials_id, tenant = %fallback, "bare tenant scope resolved");
            tenants.insert(fallback);
        }

        Ok(tenants)
    }

    /// # Errors
    /// Returns an error if storage fails.
    pub async fn get_last_authorized_tenants(&self, credentials_id: &str) -> Result<Vec<String>> {
        match fetch::<LastActivity>(self.store.as_ref(), collections::LAST_ACTIVITY, credentials_id)
            .await
        {
            Ok(doc) => Ok(doc.value.last_authorized_tenants),
            Err(StorageError::NotFound { .. }) => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    /// # Errors
    /// Returns an error if storage fails.
    pub async fn set_last_authorized_tenants(
        &self,
        credentials_id: &str,
        tenants: &BTreeSet<String>,
    ) -> Result<()> {
        if tenants.is_empty() {
            return Ok(());
        }
        let activity = LastActivity {
            last_authorized_tenants: tenants.iter().cloned().collect(),
        };
        self.store
            .upsert(
                collections::LAST_ACTIVITY,
                credentials_id,
                encode(&activity)?,
                None,
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        session::{OAuth2Data, SessionContribution, SessionCredentials, SessionType},
        storage::MemoryStore,
    };

    fn service(extra: &str) -> TenantService {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        TenantService::new(
            store.clone(),
            RoleService::new(store.clone()),
            SessionService::new(store.clone()),
            AuditService::new(store),
            extra,
        )
    }

    fn scope(items: &[&str]) -> Vec<String> {
        items.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn tenant_id_shape() {
        let tenants = service("");
        assert!(tenants.validate_tenant_id("acme").is_ok());
        assert!(tenants.validate_tenant_id("ac").is_err());
        assert!(tenants.validate_tenant_id("1acme").is_err());
        assert!(tenants.validate_tenant_id("ac-me").is_err());
        assert!(tenants.validate_tenant_id(&"a".repeat(33)).is_err());
        assert!(service("-").validate_tenant_id("ac-me").is_ok());
    }

    #[tokio::test]
    async fn scope_resolution() -> anyhow::Result<()> {
        let tenants = service("");
        tenants.create("acme", Some("Acme"), None, None).await?;
        tenants.create("beta", None, None, None).await?;
        tenants.create("gamma", None, None, None).await?;
        let cid = "memory:default:alice";
        tenants.assign(cid, "beta").await?;
        tenants.assign(cid, "acme").await?;

        assert_eq!(
            tenants
                .get_tenants_by_scope(&scope(&["openid", "tenant:beta"]), cid, false)
                .await?,
            BTreeSet::from(["beta".to_string()])
        );
        assert_eq!(
            tenants
                .get_tenants_by_scope(&scope(&["tenant:*"]), cid, false)
                .await?
                .len(),
            2
        );
        assert!(matches!(
            tenants
                .get_tenants_by_scope(&scope(&["tenant:gamma"]), cid, false)
                .await,
            Err(Error::TenantAccessDenied { .. })
        ));
        assert_eq!(
            tenants
                .get_tenants_by_scope(&scope(&["tenant:gamma"]), cid, true)
                .await?,
            BTreeSet::from(["gamma".to_string()])
        );
        assert!(matches!(
            tenants
                .get_tenants_by_scope(&scope(&["tenant:nope"]), cid, true)
                .await,
            Err(Error::TenantNotFound(_))
        ));

        // Bare `tenant`: alphabetical first, then the last authorized one.
        assert_eq!(
            tenants
                .get_tenants_by_scope(&scope(&["tenant"]), cid, false)
                .await?,
            BTreeSet::from(["acme".to_string()])
        );
        tenants
            .set_last_authorized_tenants(cid, &BTreeSet::from(["beta".to_string()]))
            .await?;
        assert_eq!(
            tenants
                .get_tenants_by_scope(&scope(&["tenant"]), cid, false)
                .await?,
            BTreeSet::from(["beta".to_string()])
        );
        Ok(())
    }

    #[tokio::test]
    async fn no_tenants() -> anyhow::Result<()> {
        let tenants = service("");
        tenants.create("acme", None, None, None).await?;
        let cid = "memory:default:loner";
        assert!(matches!(
            tenants.get_tenants_by_scope(&scope(&["tenant"]), cid, false).await,
            Err(Error::NoTenants(_))
        ));
        assert!(matches!(
            tenants
                .get_tenants_by_scope(&scope(&["tenant:acme"]), cid, false)
                .await,
            Err(Error::NoTenants(_))
        ));
        assert!(tenants
            .get_tenants_by_scope(&scope(&["openid"]), cid, false)
            .await?
            .is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn delete_removes_everything_in_scope() -> anyhow::Result<()> {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let roles = RoleService::new(store.clone());
        let sessions = SessionService::new(store.clone());
        let audit = AuditService::new(store.clone());
        let tenants = TenantService::new(
            store,
            roles.clone(),
            sessions.clone(),
            audit.clone(),
            "",
        );
        tenants.create("acme", None, None, None).await?;
        tenants.create("beta", None, None, None).await?;
        let cid = "memory:default:alice";
        tenants.assign(cid, "acme").await?;
        tenants.assign(cid, "beta").await?;
        roles.create("acme/member", None, &[]).await?;
        roles.assign(cid, "acme/member").await?;

        let authz = |scope: &[&str]| {
            SessionContribution::Authorization(
                scope
                    .iter()
                    .map(|tenant| ((*tenant).to_string(), BTreeSet::new()))
                    .collect(),
            )
        };
        let credentials = || {
            SessionContribution::Credentials(SessionCredentials {
                id: cid.to_string(),
                ..SessionCredentials::default()
            })
        };
        let oauth2 = || {
            SessionContribution::OAuth2(OAuth2Data {
                client_id: "app".to_string(),
                scope: vec!["openid".to_string()],
                ..OAuth2Data::default()
            })
        };
        let mut created = Vec::new();
        for (root_scope, child_scope) in [
            (&["acme", "beta"][..], &["acme"][..]),
            (&["acme"][..], &["beta"][..]),
            (&["beta"][..], &["beta"][..]),
        ] {
            let root = sessions
                .create_session(
                    SessionType::Root,
                    None,
                    None,
                    vec![credentials(), authz(root_scope)],
                )
                .await?;
            let child = sessions
                .create_session(
                    SessionType::Openidconnect,
                    Some(&root.id),
                    None,
                    vec![credentials(), authz(child_scope), oauth2()],
                )
                .await?;
            created.push((root.id, child.id));
        }

        tenants.delete("acme").await?;

        // Both sessions under an `acme` root go, a `beta`-only tree stays.
        for (root, child) in &created[..2] {
            assert!(sessions.get(root).await.is_err_and(|e| e.is_gone()));
            assert!(sessions.get(child).await.is_err_and(|e| e.is_gone()));
        }
        let (root, child) = &created[2];
        assert!(sessions.get(root).await.is_ok());
        assert!(sessions.get(child).await.is_ok());

        assert!(matches!(tenants.get("acme").await, Err(Error::TenantNotFound(_))));
        assert!(!tenants.has_tenant_assigned(cid, "acme").await?);
        assert!(tenants.has_tenant_assigned(cid, "beta").await?);
        assert!(roles.get_assigned(cid, Some("acme")).await?.is_empty());

        let records = audit.list(Some(AuditCode::TenantDeleted)).await?;
        assert_eq!(records.len(), 1);
        let details = &records[0].details;
        assert_eq!(details.get("tenant"), Some(&json!("acme")));
        assert_eq!(details.get("sessions").and_then(Value::as_u64), Some(4));
        assert_eq!(details.get("members").and_then(Value::as_u64), Some(1));

        assert!(matches!(tenants.delete("acme").await, Err(Error::TenantNotFound(_))));
        Ok(())
    }

    #[tokio::test]
    async fn unassign_drops_tenant_roles() -> anyhow::Result<()> {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let roles = RoleService::new(store.clone());
        let tenants = TenantService::new(
            store.clone(),
            roles.clone(),
            SessionService::new(store.clone()),
            AuditService::new(store),
            "",
        );
        tenants.create("acme", None, None, None).await?;
        let cid = "memory:default:alice";
        tenants.assign(cid, "acme").await?;
        roles.create("acme/member", None, &[]).await?;
        roles.assign(cid, "acme/member").await?;

        tenants.unassign(cid, "acme").await?;
        assert!(!tenants.has_tenant_assigned(cid, "acme").await?);
        assert!(roles.get_assigned(cid, Some("acme")).await?.is_empty());
        Ok(())
    }
}
