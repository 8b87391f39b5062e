//! Access tokens for the real-time agent room.
//!
//! Tokens are HS256 JWTs carrying a video grant, signed with the configured
//! API secret.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::Sha256;
use tracing::{debug, error, info};

use crate::config::{non_empty, LivekitConfig};
use crate::error::{Result, ToolError};
use crate::settings::SessionSettings;

const TOKEN_TTL_HOURS: i64 = 6;
const RANDOM_SUFFIX_LEN: usize = 4;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Map<String, Value>>,
}

impl TokenRequest {
    /// Request built from persisted settings; blank fields are left to the
    /// server defaults.
    pub fn from_settings(settings: &SessionSettings) -> Self {
        let text = |value: &str| Some(value.to_string()).filter(|v| !v.trim().is_empty());
        let attributes = settings.attribute_map();
        Self {
            room_name: text(&settings.room_name),
            participant_name: text(&settings.participant_name),
            participant_id: text(&settings.participant_id),
            agent_name: settings.agent_name.as_deref().and_then(text),
            metadata: settings.metadata.as_deref().and_then(text),
            attributes: (!attributes.is_empty()).then_some(attributes),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub identity: String,
    pub access_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VideoGrant {
    pub room: String,
    pub room_join: bool,
    pub can_publish: bool,
    pub can_publish_data: bool,
    pub can_subscribe: bool,
    pub can_update_own_metadata: bool,
}

impl VideoGrant {
    fn join(room: &str) -> Self {
        Self {
            room: room.to_string(),
            room_join: true,
            can_publish: true,
            can_publish_data: true,
            can_subscribe: true,
            can_update_own_metadata: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    pub iss: String,
    pub sub: String,
    pub nbf: i64,
    pub exp: i64,
    pub name: String,
    pub video: VideoGrant,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Map<String, Value>>,
}

#[derive(Clone)]
pub struct TokenIssuer {
    api_key: String,
    api_secret: String,
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("api_key", &self.api_key)
            .finish_non_exhaustive()
    }
}

impl TokenIssuer {
    pub fn new(config: &LivekitConfig) -> Result<Self> {
        match (non_empty(&config.api_key), non_empty(&config.api_secret)) {
            (Some(api_key), Some(api_secret)) => Ok(Self {
                api_key: api_key.to_string(),
                api_secret: api_secret.to_string(),
            }),
            _ => {
                error!("LIVEKIT_API_KEY or LIVEKIT_API_SECRET is not configured");
                Err(ToolError::configuration(
                    "LiveKit server environment variables are not set up correctly",
                ))
            }
        }
    }

    pub fn issue(&self, request: &TokenRequest) -> Result<TokenResponse> {
        self.issue_at(request, Utc::now())
    }

    pub fn issue_at(&self, request: &TokenRequest, now: DateTime<Utc>) -> Result<TokenResponse> {
        let provided = |value: &Option<String>| non_empty(value).map(ToString::to_string);

        let room = provided(&request.room_name)
            .unwrap_or_else(|| format!("agent-room-{}", random_suffix()));
        let identity =
            provided(&request.participant_id).unwrap_or_else(|| format!("user-{}", random_suffix()));
        let name = provided(&request.participant_name).unwrap_or_else(|| identity.clone());
        if let Some(agent) = provided(&request.agent_name) {
            debug!(agent = %agent, "Agent requested for room");
        }

        let claims = Claims {
            iss: self.api_key.clone(),
            sub: identity.clone(),
            nbf: now.timestamp(),
            exp: (now + Duration::hours(TOKEN_TTL_HOURS)).timestamp(),
            name,
            video: VideoGrant::join(&room),
            metadata: request.metadata.clone(),
            attributes: request.attributes.clone(),
        };
        let access_token = sign_hs256(&self.api_secret, &claims)?;
        info!(identity = %identity, room = %room, "Issued real-time access token");

        Ok(TokenResponse {
            identity,
            access_token,
        })
    }
}

fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(RANDOM_SUFFIX_LEN)
        .map(char::from)
        .collect()
}

fn sign_hs256(secret: &str, claims: &Claims) -> Result<String> {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
    let signing_input = format!("{header}.{payload}");

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|err| ToolError::configuration(format!("invalid LiveKit API secret: {err}")))?;
    mac.update(signing_input.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    Ok(format!("{signing_input}.{signature}"))
}
