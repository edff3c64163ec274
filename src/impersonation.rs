//! Impersonation: an operator's root session spawns a root session for
//! another identity, keeping a back-reference for audit and for restoring
//! the operator on logout.

use serde_json::json;
use std::collections::BTreeSet;
use tracing::{error, info, warn};

use crate::{
    audit::{AuditCode, AuditService},
    authz::{has_resource_access, resource_id, RbacService},
    login::{AuthenticationService, FactorType, LoginDescriptor, RootSessionRequest},
    session::{Session, SessionContribution, SessionService, SessionType},
    Error, Result,
};

/// Never carried into an impersonated session, whatever the target holds.
pub const EXCLUDED_RESOURCES: &[&str] = &[resource_id::SUPERUSER, resource_id::IMPERSONATE];

#[derive(Clone)]
pub struct ImpersonationService {
    authn: AuthenticationService,
    sessions: SessionService,
    rbac: RbacService,
    audit: AuditService,
}

impl ImpersonationService {
    #[must_use]
    pub fn new(
        authn: AuthenticationService,
        sessions: SessionService,
        rbac: RbacService,
        audit: AuditService,
    ) -> Self {
        Self {
            authn,
            sessions,
            rbac,
            audit,
        }
    }

    /// Start impersonating `target_credentials_id` from `impersonator`.
    ///
    /// The impersonator's session and grants are re-read first, so access
    /// revoked since the session was issued is honoured. Any failure,
    /// expected or not, is reported as `AccessDenied`.
    ///
    /// # Errors
    /// `AccessDenied` only.
    pub async fn impersonate(
        &self,
        impersonator: &Session,
        target_credentials_id: &str,
    ) -> Result<Session> {
        let impersonator_cid = impersonator.credentials_id().to_string();
        match self.try_impersonate(impersonator, target_credentials_id).await {
            Ok(session) => {
                self.audit
                    .append(
                        AuditCode::ImpersonationSuccessful,
                        json!({
                            "impersonator_cid": impersonator_cid,
                            "impersonator_sid": impersonator.id,
                            "target_cid": target_credentials_id,
                            "sid": session.id,
                        }),
                    )
                    .await;
                info!(
                    impersonator = %impersonator_cid,
                    target = %target_credentials_id,
                    sid = %session.id,
                    "impersonation started"
                );
                Ok(session)
            }
            Err(err) => {
                if matches!(err, Error::AccessDenied { .. }) {
                    warn!(impersonator = %impersonator_cid, target = %target_credentials_id, "impersonation denied: {err}");
                } else {
                    error!(impersonator = %impersonator_cid, target = %target_credentials_id, "impersonation failed: {err}");
                }
                self.audit
                    .append(
                        AuditCode::ImpersonationFailed,
                        json!({
                            "impersonator_cid": impersonator_cid,
                            "impersonator_sid": impersonator.id,
                            "target_cid": target_credentials_id,
                        }),
                    )
                    .await;
                Err(Error::access_denied(impersonator_cid, resource_id::IMPERSONATE))
            }
        }
    }

    async fn try_impersonate(&self, impersonator: &Session, target: &str) -> Result<Session> {
        let current = self.sessions.get(&impersonator.id).await?;
        let cid = current.credentials_id();
        if current.session_type != SessionType::Root
            || current.authentication.is_anonymous
            || current.authentication.is_impersonated()
        {
            return Err(Error::access_denied(cid, resource_id::IMPERSONATE));
        }
        if cid == target {
            return Err(Error::validation("cannot impersonate oneself"));
        }

        let grants = self
            .rbac
            .compute_authorization(cid, &BTreeSet::new(), &[])
            .await?;
        if !has_resource_access(&grants, None, &[resource_id::IMPERSONATE]) {
            return Err(Error::access_denied(cid, resource_id::IMPERSONATE));
        }

        self.authn
            .create_root_session(RootSessionRequest {
                credentials_id: target,
                descriptor: LoginDescriptor::impersonation(),
                available_factors: vec![FactorType::Impersonation],
                expiration: None,
                track_id: current.track_id.clone(),
                exclude: EXCLUDED_RESOURCES,
                extra: vec![SessionContribution::Impersonation {
                    impersonator_session_id: current.id.clone(),
                    impersonator_credentials_id: cid.to_string(),
                }],
                cookie: true,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        authz::is_superuser,
        services::testing::{services, Harness},
    };

    async fn operator_session(h: &Harness, cid: &str) -> anyhow::Result<Session> {
        Ok(h.services
            .authn
            .create_root_session(RootSessionRequest {
                credentials_id: cid,
                descriptor: LoginDescriptor::m2m(),
                available_factors: Vec::new(),
                expiration: None,
                track_id: Some("track-1".to_string()),
                exclude: &[],
                extra: Vec::new(),
                cookie: true,
            })
            .await?)
    }

    #[tokio::test]
    async fn impersonated_session_drops_powers() -> anyhow::Result<()> {
        let h = services().await?;
        let boss = h.people.create("boss", None, None, None).await?;
        let alice = h.people.create("alice", None, None, None).await?;
        let roles = &h.services.roles;
        roles
            .create(
                "*/root",
                None,
                &[
                    resource_id::SUPERUSER.to_string(),
                    resource_id::IMPERSONATE.to_string(),
                ],
            )
            .await?;
        roles.assign(&boss, "*/root").await?;
        roles.assign(&alice, "*/root").await?;

        let operator = operator_session(&h, &boss).await?;
        let session = h.services.impersonation.impersonate(&operator, &alice).await?;
        assert_eq!(session.credentials_id(), alice);
        assert_eq!(
            session.authentication.impersonator_session_id.as_deref(),
            Some(operator.id.as_str())
        );
        assert_eq!(session.track_id.as_deref(), Some("track-1"));
        assert!(!is_superuser(&session.authorization.authz));
        assert!(!has_resource_access(
            &session.authorization.authz,
            None,
            &[resource_id::IMPERSONATE]
        ));

        // No chaining.
        assert!(matches!(
            h.services.impersonation.impersonate(&session, &boss).await,
            Err(Error::AccessDenied { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn revoked_operator_is_denied() -> anyhow::Result<()> {
        let h = services().await?;
        let boss = h.people.create("boss", None, None, None).await?;
        let alice = h.people.create("alice", None, None, None).await?;
        h.services
            .roles
            .create("*/ops", None, &[resource_id::IMPERSONATE.to_string()])
            .await?;
        h.services.roles.assign(&boss, "*/ops").await?;
        let operator = operator_session(&h, &boss).await?;

        h.services.roles.unassign(&boss, "*/ops").await?;
        assert!(matches!(
            h.services.impersonation.impersonate(&operator, &alice).await,
            Err(Error::AccessDenied { .. })
        ));
        assert_eq!(
            h.services
                .audit
                .list(Some(AuditCode::ImpersonationFailed))
                .await?
                .len(),
            1
        );

        h.services.roles.assign(&boss, "*/ops").await?;
        assert!(matches!(
            h.services.impersonation.impersonate(&operator, "memory:default:ghost").await,
            Err(Error::AccessDenied { .. })
        ));
        Ok(())
    }
}
