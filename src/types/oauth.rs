use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A stored OAuth token for a remote server.
///
/// A token without `expires_at` never expires. A token without
/// `refresh_token` cannot be refreshed: once expired the only recovery is
/// a full re-authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthToken {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OAuthToken {
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(at) => Utc::now() >= at,
            None => false,
        }
    }
}

/// What `start_flow` hands back: the URL to open in a browser plus the
/// `state` value the callback must echo.
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
}

/// Parameters delivered to the redirect URI by the authorization server.
#[derive(Debug, Clone, Deserialize)]
pub struct CallbackParams {
    pub state: String,
    pub code: String,
}
