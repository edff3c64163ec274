//! Session assembly from typed contributions.
//!
//! Each flow contributes only the parts it owns; the assembler applies them
//! in a fixed order and rejects combinations that make no sense for the
//! session type.

use chrono::{DateTime, Utc};

use super::{
    Authentication, Authorization, CookieData, ExternalLoginRef, OAuth2Data, Session,
    SessionCredentials, SessionType,
};
use crate::{authz::Authz, login::LoginDescriptor, Error, Result};

#[derive(Clone, Debug)]
pub enum SessionContribution {
    Credentials(SessionCredentials),
    Authorization(Authz),
    Authentication {
        descriptor: LoginDescriptor,
        available_factors: Vec<crate::login::FactorType>,
    },
    Anonymous,
    Impersonation {
        impersonator_session_id: String,
        impersonator_credentials_id: String,
    },
    ExternalLogin(ExternalLoginRef),
    Cookie(CookieData),
    OAuth2(OAuth2Data),
    TrackId(String),
}

impl SessionContribution {
    const fn rank(&self) -> u8 {
        match self {
            Self::Credentials(_) => 0,
            Self::Authorization(_) => 1,
            Self::Authentication { .. } => 2,
            Self::Anonymous => 3,
            Self::Impersonation { .. } => 4,
            Self::ExternalLogin(_) => 5,
            Self::Cookie(_) => 6,
            Self::OAuth2(_) => 7,
            Self::TrackId(_) => 8,
        }
    }
}

/// Everything the store decides rather than the flows.
pub(super) struct Frame<'a> {
    pub id: String,
    pub session_type: SessionType,
    pub parent_session_id: Option<&'a str>,
    pub track_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

pub(super) fn assemble(frame: Frame<'_>, mut contributions: Vec<SessionContribution>) -> Result<Session> {
    contributions.sort_by_key(SessionContribution::rank);
    if contributions
        .windows(2)
        .any(|pair| pair[0].rank() == pair[1].rank())
    {
        return Err(Error::InvalidSessionComposition("duplicate contribution"));
    }

    let session_type = frame.session_type;
    if session_type.is_derived() != frame.parent_session_id.is_some() {
        return Err(Error::InvalidSessionComposition(
            "only cookie and openidconnect sessions have a parent",
        ));
    }

    let mut credentials = None;
    let mut authorization = Authorization::default();
    let mut authentication = Authentication::default();
    let mut cookie = None;
    let mut oauth2 = None;
    let mut track_id = frame.track_id;

    for contribution in contributions {
        match contribution {
            SessionContribution::Credentials(c) => credentials = Some(c),
            SessionContribution::Authorization(authz) => authorization.authz = authz,
            SessionContribution::Authentication {
                descriptor,
                available_factors,
            } => {
                authentication.login_factors = descriptor.factor_types();
                authentication.login_descriptor = Some(descriptor);
                authentication.available_factors = available_factors;
            }
            SessionContribution::Anonymous => {
                if session_type != SessionType::Root {
                    return Err(Error::InvalidSessionComposition(
                        "only root sessions can be anonymous",
                    ));
                }
                authentication.is_anonymous = true;
            }
            SessionContribution::Impersonation {
                impersonator_session_id,
                impersonator_credentials_id,
            } => {
                if session_type == SessionType::M2m {
                    return Err(Error::InvalidSessionComposition(
                        "m2m sessions cannot be impersonated",
                    ));
                }
                authentication.impersonator_session_id = Some(impersonator_session_id);
                authentication.impersonator_credentials_id = Some(impersonator_credentials_id);
            }
            SessionContribution::ExternalLogin(external) => {
                authentication.external_login = Some(external);
            }
            SessionContribution::Cookie(data) => {
                if !matches!(session_type, SessionType::Root | SessionType::Cookie) {
                    return Err(Error::InvalidSessionComposition(
                        "cookie data on a cookie-less session type",
                    ));
                }
                cookie = Some(data);
            }
            SessionContribution::OAuth2(data) => {
                if !session_type.is_derived() {
                    return Err(Error::InvalidSessionComposition(
                        "oauth2 data on a non-client session",
                    ));
                }
                oauth2 = Some(data);
            }
            SessionContribution::TrackId(id) => track_id = Some(id),
        }
    }

    let credentials = credentials.ok_or(Error::InvalidSessionComposition(
        "missing credentials contribution",
    ))?;
    if session_type.is_derived() && oauth2.is_none() {
        return Err(Error::InvalidSessionComposition(
            "client sessions need oauth2 data",
        ));
    }
    if session_type == SessionType::Cookie && cookie.is_none() {
        return Err(Error::InvalidSessionComposition(
            "cookie sessions need cookie data",
        ));
    }

    Ok(Session {
        id: frame.id,
        session_type,
        parent_session_id: frame.parent_session_id.map(ToString::to_string),
        credentials,
        authorization,
        authentication,
        cookie,
        oauth2,
        track_id,
        created_at: frame.created_at,
        expires_at: frame.expires_at,
        version: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(session_type: SessionType, parent: Option<&str>) -> Frame<'_> {
        Frame {
            id: "sid".to_string(),
            session_type,
            parent_session_id: parent,
            track_id: None,
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    fn creds() -> SessionContribution {
        SessionContribution::Credentials(SessionCredentials {
            id: "memory:default:alice".to_string(),
            ..SessionCredentials::default()
        })
    }

    #[test]
    fn contributions_apply_in_fixed_order() -> anyhow::Result<()> {
        let session = assemble(
            frame(SessionType::Root, None),
            vec![
                SessionContribution::TrackId("track".to_string()),
                SessionContribution::Authentication {
                    descriptor: LoginDescriptor::m2m(),
                    available_factors: vec![],
                },
                creds(),
            ],
        )?;
        assert_eq!(session.track_id.as_deref(), Some("track"));
        assert_eq!(
            session.authentication.login_factors,
            vec![crate::login::FactorType::M2mBasicAuth]
        );
        Ok(())
    }

    #[test]
    fn impossible_combinations_are_rejected() {
        let cases = vec![
            (frame(SessionType::Root, None), vec![]),
            (frame(SessionType::Root, None), vec![creds(), creds()]),
            (frame(SessionType::Cookie, None), vec![creds()]),
            (frame(SessionType::Root, Some("parent")), vec![creds()]),
            (
                frame(SessionType::Cookie, Some("parent")),
                vec![creds(), SessionContribution::OAuth2(OAuth2Data::default())],
            ),
            (
                frame(SessionType::M2m, None),
                vec![creds(), SessionContribution::Cookie(CookieData::generate(None))],
            ),
            (
                frame(SessionType::Openidconnect, Some("parent")),
                vec![
                    creds(),
                    SessionContribution::OAuth2(OAuth2Data::default()),
                    SessionContribution::Anonymous,
                ],
            ),
        ];
        for (frame, contributions) in cases {
            assert!(matches!(
                assemble(frame, contributions),
                Err(Error::InvalidSessionComposition(_))
            ));
        }
    }
}
