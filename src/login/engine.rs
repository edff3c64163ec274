//! Which factor sequences an identity may use, and whether an attempt
//! satisfies one of them.

use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use super::{FactorSpec, FactorType, FactorVerifier, LoginDescriptor, LoginSession, RequestContext};
use crate::Result;

#[derive(Clone)]
pub struct DescriptorEngine {
    templates: Vec<LoginDescriptor>,
    verifier: FactorVerifier,
}

impl DescriptorEngine {
    #[must_use]
    pub fn new(templates: Vec<LoginDescriptor>, verifier: FactorVerifier) -> Self {
        Self {
            templates,
            verifier,
        }
    }

    #[must_use]
    pub fn verifier(&self) -> &FactorVerifier {
        &self.verifier
    }

    /// Enabled templates the credential can complete, preferred ids first.
    ///
    /// An empty result means "use the decoy flow"; it never distinguishes
    /// unknown identities from identities without usable factors.
    /// Credentials with an activated TOTP are only offered descriptors that
    /// include a possession factor.
    ///
    /// # Errors
    /// Returns an error only for storage failures.
    pub async fn prepare_descriptors(
        &self,
        credentials_id: &str,
        ctx: &RequestContext,
        preferred_ids: &[String],
    ) -> Result<Vec<LoginDescriptor>> {
        let credentials = match self.verifier.credentials().get(credentials_id).await {
            Ok(credentials) => credentials,
            Err(err) if err.is_gone() => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        if credentials.suspended {
            debug!(cid = %credentials_id, "suspended credentials get no descriptors");
            return Ok(Vec::new());
        }

        let has_totp = self
            .verifier
            .is_eligible(&FactorSpec::new(FactorType::Totp), &credentials, ctx)
            .await;

        let mut descriptors = Vec::new();
        for template in &self.templates {
            if template.factors.is_empty() {
                continue;
            }
            if has_totp && !template.has_possession_factor() {
                continue;
            }
            let mut eligible = true;
            for factor in &template.factors {
                if !self.verifier.is_eligible(factor, &credentials, ctx).await {
                    eligible = false;
                    break;
                }
            }
            if eligible {
                descriptors.push(template.clone());
            }
        }

        Ok(reorder(descriptors, preferred_ids))
    }

    /// Descriptors handed to decoy sessions: what an ordinary
    /// password-only credential would get.
    #[must_use]
    pub fn fallback_descriptors(&self) -> Vec<LoginDescriptor> {
        self.templates
            .iter()
            .find(|d| {
                !d.factors.is_empty()
                    && d.factors
                        .iter()
                        .all(|f| f.factor_type == FactorType::Password)
            })
            .or_else(|| self.templates.first())
            .cloned()
            .into_iter()
            .collect()
    }

    /// Check an attempt against the descriptor it names, or against each
    /// descriptor in order when it names none. Every factor of a candidate
    /// is evaluated even after one fails so failures take the same path.
    ///
    /// Returns the descriptor that was satisfied.
    pub async fn validate_attempt(
        &self,
        login_session: &LoginSession,
        payload: &Value,
        ctx: &RequestContext,
    ) -> Option<LoginDescriptor> {
        let now = Utc::now();
        let candidates: Vec<&LoginDescriptor> =
            match payload.get("descriptor").and_then(Value::as_str) {
                Some(id) => login_session.descriptor(id).into_iter().collect(),
                None => login_session.login_descriptors.iter().collect(),
            };

        for descriptor in candidates {
            let mut passed = !descriptor.factors.is_empty();
            for factor in &descriptor.factors {
                let ok = self
                    .verifier
                    .authenticate(factor, login_session, payload, ctx, now)
                    .await;
                passed &= ok;
            }
            if passed {
                return Some(descriptor.clone());
            }
        }
        None
    }
}

/// Stable reorder: preferred ids first in preference order, rest unchanged.
/// Never adds descriptors.
fn reorder(mut descriptors: Vec<LoginDescriptor>, preferred_ids: &[String]) -> Vec<LoginDescriptor> {
    if preferred_ids.is_empty() {
        return descriptors;
    }
    descriptors.sort_by_key(|d| {
        preferred_ids
            .iter()
            .position(|p| *p == d.id)
            .unwrap_or(preferred_ids.len())
    });
    descriptors
}
