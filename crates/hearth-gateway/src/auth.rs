use std::collections::HashSet;

use async_trait::async_trait;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use parking_lot::RwLock;

use hearth_types::api::Claims;
use hearth_types::models::{Session, TeamMember};
use hearth_types::{new_id, now_millis};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid or expired session token")]
    Invalid,
    #[error("session {0} has been revoked")]
    Revoked(String),
    #[error("session lookup failed: {0}")]
    Internal(#[from] anyhow::Error),
}

impl SessionError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Invalid | Self::Revoked(_) => 401,
            Self::Internal(_) => 500,
        }
    }
}

/// Turns a bearer/cookie token into a session.
#[async_trait]
pub trait SessionGate: Send + Sync {
    async fn session(&self, token: &str) -> Result<Session, SessionError>;
}

/// HS256 session tokens with an in-process revocation list.
pub struct JwtSessionGate {
    encoding: EncodingKey,
    decoding: DecodingKey,
    revoked: RwLock<HashSet<String>>,
    lifetime: chrono::Duration,
}

/// What a new session should carry.
#[derive(Debug, Clone, Default)]
pub struct SessionGrant {
    pub user_id: String,
    pub roles: Vec<String>,
    pub team_ids: Vec<String>,
    pub guest: bool,
}

impl JwtSessionGate {
    pub fn new(secret: &str, lifetime: chrono::Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            revoked: RwLock::new(HashSet::new()),
            lifetime,
        }
    }

    /// Mint a token for `grant`. Returns the token and the session it encodes.
    pub fn issue(&self, grant: SessionGrant) -> Result<(String, Session), SessionError> {
        let claims = Claims {
            sub: grant.user_id,
            sid: new_id(),
            roles: grant.roles,
            teams: grant.team_ids,
            csrf: new_id(),
            guest: grant.guest,
            exp: (chrono::Utc::now() + self.lifetime).timestamp() as usize,
        };
        let token = encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| SessionError::Internal(e.into()))?;
        let session = session_from_claims(&token, claims);
        Ok((token, session))
    }

    /// Logout: every later lookup of this session id fails.
    pub fn revoke(&self, session_id: &str) {
        self.revoked.write().insert(session_id.to_string());
    }
}

#[async_trait]
impl SessionGate for JwtSessionGate {
    async fn session(&self, token: &str) -> Result<Session, SessionError> {
        let data = decode::<Claims>(token, &self.decoding, &Validation::default())
            .map_err(|_| SessionError::Invalid)?;

        if self.revoked.read().contains(&data.claims.sid) {
            return Err(SessionError::Revoked(data.claims.sid));
        }
        Ok(session_from_claims(token, data.claims))
    }
}

fn session_from_claims(token: &str, claims: Claims) -> Session {
    let team_members = claims
        .teams
        .iter()
        .map(|team_id| TeamMember {
            team_id: team_id.clone(),
            user_id: claims.sub.clone(),
            roles: "team_user".into(),
        })
        .collect();

    let mut session = Session {
        id: claims.sid,
        token: token.to_string(),
        user_id: claims.sub,
        create_at: now_millis(),
        expires_at: claims.exp as i64 * 1000,
        roles: claims.roles,
        team_members,
        csrf_token: claims.csrf,
        ..Default::default()
    };
    if claims.guest {
        session.props.insert("is_guest".into(), "true".into());
    }
    session
}
