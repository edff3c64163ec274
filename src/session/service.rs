use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::builder::{assemble, Frame};
use super::{Session, SessionContribution, SessionType};
use crate::{
    storage::{collections, encode, fetch, find_all, DocumentStore, Filter, StorageError},
    Error, Result,
};

/// How a session is looked up other than by id.
#[derive(Clone, Debug)]
pub enum SessionMatcher<'a> {
    CookieId(&'a str),
    CredentialsId {
        credentials_id: &'a str,
        session_type: Option<SessionType>,
    },
}

#[derive(Clone)]
pub struct SessionService {
    store: Arc<dyn DocumentStore>,
}

impl SessionService {
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Assemble and persist a session.
    ///
    /// A derived session never outlives its parent: its expiry is the earlier
    /// of the requested one and the parent's, and it inherits the parent's
    /// expiry and track id when nothing else is given.
    ///
    /// # Errors
    /// `InvalidSessionComposition` for a contribution set the type does not
    /// allow, `NotFound`/`Expired` when the parent is gone, `Validation` when
    /// the parent is not a root session.
    pub async fn create_session(
        &self,
        session_type: SessionType,
        parent_session_id: Option<&str>,
        expiration: Option<Duration>,
        contributions: Vec<SessionContribution>,
    ) -> Result<Session> {
        let now = Utc::now();
        let mut expires_at = expiration.map(|ttl| now + ttl);
        let mut track_id = None;

        if let Some(parent_id) = parent_session_id {
            let parent = self.get(parent_id).await?;
            if parent.session_type != SessionType::Root {
                return Err(Error::validation(format!(
                    "parent session {parent_id} is not a root session"
                )));
            }
            expires_at = match (expires_at, parent.expires_at) {
                (Some(own), Some(parent)) => Some(own.min(parent)),
                (own, parent) => own.or(parent),
            };
            track_id = parent.track_id;
        }

        let mut session = assemble(
            Frame {
                id: ulid::Ulid::new().to_string(),
                session_type,
                parent_session_id,
                track_id,
                created_at: now,
                expires_at,
            },
            contributions,
        )?;
        session.version = self
            .store
            .insert(
                collections::SESSIONS,
                &session.id,
                encode(&session)?,
                session.expires_at,
            )
            .await?;
        info!(
            sid = %session.id,
            session_type = session.session_type.as_str(),
            cid = %session.credentials.id,
            parent = session.parent_session_id.as_deref().unwrap_or("-"),
            "session created"
        );
        Ok(session)
    }

    /// Fetch a live session. An expired one is deleted on the way out.
    ///
    /// # Errors
    /// `NotFound` or `Expired`.
    pub async fn get(&self, id: &str) -> Result<Session> {
        let doc = fetch::<Session>(self.store.as_ref(), collections::SESSIONS, id)
            .await
            .map_err(|err| match err {
                StorageError::NotFound { .. } => Error::not_found("session"),
                other => other.into(),
            })?;
        let mut session = doc.value;
        session.version = doc.version;
        if session.is_expired(Utc::now()) {
            debug!(sid = %id, "session expired on read");
            self.delete(id).await?;
            return Err(Error::Expired("session".to_string()));
        }
        Ok(session)
    }

    /// First live session matching, by id order.
    ///
    /// # Errors
    /// `NotFound` when nothing live matches.
    pub async fn get_by(&self, matcher: SessionMatcher<'_>) -> Result<Session> {
        let filter = match matcher {
            SessionMatcher::CookieId(cookie_id) => Filter::all().eq("/cookie/id", cookie_id),
            SessionMatcher::CredentialsId {
                credentials_id,
                session_type,
            } => {
                let filter = Filter::all().eq("/credentials/id", credentials_id);
                match session_type {
                    Some(t) => filter.eq("/type", t.as_str()),
                    None => filter,
                }
            }
        };
        let now = Utc::now();
        find_all::<Session>(self.store.as_ref(), collections::SESSIONS, &filter)
            .await?
            .into_iter()
            .map(|doc| {
                let mut session = doc.value;
                session.version = doc.version;
                session
            })
            .find(|session| !session.is_expired(now))
            .ok_or_else(|| Error::not_found("session"))
    }

    /// # Errors
    /// Returns an error if storage fails.
    pub async fn list(&self, filter: &Filter) -> Result<Vec<Session>> {
        let now = Utc::now();
        Ok(
            find_all::<Session>(self.store.as_ref(), collections::SESSIONS, filter)
                .await?
                .into_iter()
                .filter(|doc| !doc.value.is_expired(now))
                .map(|doc| {
                    let mut session = doc.value;
                    session.version = doc.version;
                    session
                })
                .collect(),
        )
    }

    /// # Errors
    /// Returns an error if storage fails.
    pub async fn list_children(&self, parent_id: &str) -> Result<Vec<Session>> {
        self.list(&Filter::all().eq("/parent_session_id", parent_id))
            .await
    }

    /// Extend the expiry of a session, never past its parent's.
    ///
    /// # Errors
    /// `NotFound` when the session is gone, `Storage` on a concurrent write.
    pub async fn touch(&self, id: &str, ttl: Duration) -> Result<Session> {
        let mut session = self.get(id).await?;
        let mut expires_at = Utc::now() + ttl;
        if let Some(parent_id) = &session.parent_session_id {
            if let Some(parent_expiry) = self.get(parent_id).await?.expires_at {
                expires_at = expires_at.min(parent_expiry);
            }
        }
        session.expires_at = Some(expires_at);
        session.version = self
            .store
            .update(
                collections::SESSIONS,
                id,
                session.version,
                encode(&session)?,
                Some(expires_at),
            )
            .await?;
        Ok(session)
    }

    /// Delete a session and everything derived from it. Idempotent.
    ///
    /// # Errors
    /// Returns an error if storage fails.
    pub async fn delete(&self, id: &str) -> Result<usize> {
        let mut pending = vec![id.to_string()];
        let mut deleted = 0;
        while let Some(current) = pending.pop() {
            let children = self
                .store
                .find(
                    collections::SESSIONS,
                    &Filter::all().eq("/parent_session_id", current.as_str()),
                )
                .await?;
            pending.extend(children.into_iter().map(|doc| doc.id));
            if self.store.delete(collections::SESSIONS, &current).await? {
                deleted += 1;
            }
        }
        if deleted > 0 {
            info!(sid = %id, deleted, "session deleted");
        }
        Ok(deleted)
    }

    /// # Errors
    /// Returns an error if storage fails.
    pub async fn delete_sessions_by_credentials_id(&self, credentials_id: &str) -> Result<usize> {
        self.delete_matching(&Filter::all().eq("/credentials/id", credentials_id))
            .await
    }

    /// Sessions authorized for `tenant` lose their grants with it.
    ///
    /// # Errors
    /// Returns an error if storage fails.
    pub async fn delete_sessions_by_tenant_in_scope(&self, tenant: &str) -> Result<usize> {
        self.delete_matching(&Filter::all().has_key("/authorization/authz", tenant))
            .await
    }

    /// # Errors
    /// Returns an error if storage fails.
    pub async fn delete_all(&self) -> Result<usize> {
        self.delete_matching(&Filter::all()).await
    }

    async fn delete_matching(&self, filter: &Filter) -> Result<usize> {
        let matching = self.store.find(collections::SESSIONS, filter).await?;
        let mut deleted = 0;
        for doc in matching {
            deleted += self.delete(&doc.id).await?;
        }
        Ok(deleted)
    }

    /// # Errors
    /// Returns an error if the backend fails.
    pub async fn delete_expired(&self) -> Result<u64> {
        let now = Utc::now();
        let count = self
            .store
            .delete_expired(collections::SESSIONS, now)
            .await?;
        // Children of a swept parent with no expiry of their own.
        let orphans = self
            .store
            .find(collections::SESSIONS, &Filter::all())
            .await?;
        let mut removed = count;
        for doc in orphans {
            let Some(parent) = doc.body.pointer("/parent_session_id").and_then(|v| v.as_str())
            else {
                continue;
            };
            if matches!(
                self.store.get(collections::SESSIONS, parent).await,
                Err(StorageError::NotFound { .. })
            ) {
                warn!(sid = %doc.id, parent, "removing orphaned session");
                removed += u64::try_from(self.delete(&doc.id).await?).unwrap_or(0);
            }
        }
        Ok(removed)
    }
}
