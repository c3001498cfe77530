//! Identity and session service.
//!
//! Authenticates connecting clients either by a previously issued bearer
//! token or by minting a fresh identity, and resolves the presence set to
//! full identity records. Presence itself is written by the connection
//! registry; this service only reads it.

use std::sync::Arc;
use std::time::Duration;

use chatline_proto::event::UserProfile;

use crate::error::ChatError;
use crate::keys;
use crate::store::{Fields, Store};
use crate::unix_now;

/// Default sliding lifetime of the token index entry (1 hour).
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(3600);

/// Prefix of generated identity ids.
const IDENTITY_ID_PREFIX: &str = "user_";

/// An authenticated user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Opaque, random, immutable id.
    pub id: String,
    /// Name shown to other users.
    pub display_name: String,
    /// Avatar reference shown to other users.
    pub avatar_ref: String,
    /// Bearer token, never shared with other users.
    pub auth_token: String,
    /// Creation time, unix seconds.
    pub created_at: i64,
}

impl Identity {
    /// Mints a new identity with a random id and token.
    fn mint(display_name: &str, avatar_ref: &str) -> Self {
        Self {
            id: format!(
                "{IDENTITY_ID_PREFIX}{}",
                hex::encode(rand::random::<[u8; 16]>())
            ),
            display_name: display_name.to_string(),
            avatar_ref: avatar_ref.to_string(),
            auth_token: hex::encode(rand::random::<[u8; 32]>()),
            created_at: unix_now(),
        }
    }

    /// Public fields, safe to broadcast.
    #[must_use]
    pub fn profile(&self) -> UserProfile {
        UserProfile {
            id: self.id.clone(),
            username: self.display_name.clone(),
            avatar_url: self.avatar_ref.clone(),
        }
    }

    fn to_fields(&self) -> Fields {
        Fields::from([
            ("username".to_string(), self.display_name.clone()),
            ("avatar_url".to_string(), self.avatar_ref.clone()),
            ("token".to_string(), self.auth_token.clone()),
            ("created_at".to_string(), self.created_at.to_string()),
        ])
    }

    /// Rebuilds an identity from its stored hash.
    ///
    /// Returns `None` for an absent or unusable record.
    fn from_fields(id: &str, fields: &Fields) -> Option<Self> {
        let display_name = fields.get("username").filter(|n| !n.is_empty())?;
        Some(Self {
            id: id.to_string(),
            display_name: display_name.clone(),
            avatar_ref: fields.get("avatar_url").cloned().unwrap_or_default(),
            auth_token: fields.get("token").cloned().unwrap_or_default(),
            created_at: fields
                .get("created_at")
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
        })
    }
}

/// Outcome of [`IdentityService::authenticate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticated {
    /// The authenticated identity.
    pub identity: Identity,
    /// Whether the identity was minted by this call.
    pub created: bool,
}

impl Authenticated {
    /// Identity id bound by this authentication.
    #[must_use]
    pub fn identity_id(&self) -> &str {
        &self.identity.id
    }

    /// Token the client should present next time.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.identity.auth_token
    }
}

/// Issues and validates tokens and reads online identities.
pub struct IdentityService<S> {
    store: Arc<S>,
    token_ttl: Duration,
}

impl<S> Clone for IdentityService<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            token_ttl: self.token_ttl,
        }
    }
}

impl<S: Store> IdentityService<S> {
    /// Creates a service persisting through `store`.
    #[must_use]
    pub const fn new(store: Arc<S>, token_ttl: Duration) -> Self {
        Self { store, token_ttl }
    }

    /// Authenticates by token, or registers a new identity.
    ///
    /// A token that resolves to an existing identity returns that identity
    /// unchanged and slides the token's TTL forward. Otherwise a new identity
    /// is minted, which requires a non-empty `display_name`.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Validation`] if a new identity is needed and
    /// `display_name` is empty, or [`ChatError::Store`] on storage failure.
    pub async fn authenticate(
        &self,
        display_name: &str,
        avatar_ref: &str,
        token: Option<&str>,
    ) -> Result<Authenticated, ChatError> {
        if let Some(token) = token
            && let Some(identity) = self.resolve_token(token).await?
        {
            self.store
                .expire(&keys::token(token), self.token_ttl)
                .await?;
            tracing::debug!(identity = %identity.id, "authenticated by token");
            return Ok(Authenticated {
                identity,
                created: false,
            });
        }

        let display_name = display_name.trim();
        if display_name.is_empty() {
            return Err(ChatError::Validation("Username is required".to_string()));
        }

        let identity = Identity::mint(display_name, avatar_ref);
        self.store
            .hash_set(&keys::identity(&identity.id), identity.to_fields())
            .await?;
        self.store
            .set_with_ttl(
                &keys::token(&identity.auth_token),
                identity.id.clone(),
                self.token_ttl,
            )
            .await?;
        tracing::info!(
            identity = %identity.id,
            name = %identity.display_name,
            "registered new identity"
        );

        Ok(Authenticated {
            identity,
            created: true,
        })
    }

    /// Resolves a token to its identity, if the token is live and the record exists.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Store`] on storage failure.
    pub async fn resolve_token(&self, token: &str) -> Result<Option<Identity>, ChatError> {
        let Some(id) = self.store.get(&keys::token(token)).await? else {
            return Ok(None);
        };
        self.get(&id).await
    }

    /// Loads an identity record.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Store`] on storage failure.
    pub async fn get(&self, id: &str) -> Result<Option<Identity>, ChatError> {
        let fields = self.store.hash_get_all(&keys::identity(id)).await?;
        Ok(Identity::from_fields(id, &fields))
    }

    /// Returns the identities currently online, ordered by id.
    ///
    /// Ids whose record is missing or unreadable are skipped; this never fails.
    pub async fn online_identities(&self) -> Vec<Identity> {
        let ids = match self.store.set_members(keys::ONLINE_IDENTITIES).await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::error!(error = %e, "failed to read presence set");
                return Vec::new();
            }
        };

        let mut online = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get(&id).await {
                Ok(Some(identity)) => online.push(identity),
                Ok(None) => tracing::debug!(identity = %id, "skipping online id without record"),
                Err(e) => {
                    tracing::warn!(identity = %id, error = %e, "skipping unreadable identity");
                }
            }
        }
        online
    }

    /// Returns when an identity last connected or disconnected, unix seconds.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Store`] on storage failure.
    pub async fn last_seen(&self, id: &str) -> Result<Option<i64>, ChatError> {
        let raw = self.store.get(&keys::last_seen(id)).await?;
        Ok(raw.and_then(|v| v.parse().ok()))
    }
}
