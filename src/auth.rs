//! OAuth 2.1 authorization-code flow with PKCE (S256 only) for remote
//! servers that require bearer tokens.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::recorder::Recorder;
use crate::storage::{self, keys, Storage};
use crate::types::config::OAuthConfig;
use crate::types::oauth::{AuthorizationRequest, CallbackParams, OAuthToken};
use crate::types::telemetry::{LogCategory, LogEntry, LogLevel};

/// Abandoned authorization flows are purged after this long.
pub const FLOW_TTL: Duration = Duration::from_secs(600);

/// Bound on the token-endpoint round trip.
pub const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);

const VERIFIER_LEN: usize = 64;
const STATE_LEN: usize = 32;

/// Transient state for one in-progress authorization, keyed by `state`.
struct PendingFlow {
    server_id: String,
    verifier: String,
    config: OAuthConfig,
    created_at: DateTime<Utc>,
}

/// Token response shape shared by the code-exchange and refresh grants.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

pub struct Authenticator {
    http: reqwest::Client,
    flows: Mutex<HashMap<String, PendingFlow>>,
    tokens: RwLock<HashMap<String, OAuthToken>>,
    storage: Arc<dyn Storage>,
    recorder: Arc<Recorder>,
}

impl Authenticator {
    /// Load previously persisted tokens from storage; a corrupt value
    /// degrades to an empty token set.
    pub fn new(storage: Arc<dyn Storage>, recorder: Arc<Recorder>) -> Self {
        let tokens: HashMap<String, OAuthToken> = storage::load_or_default(&*storage, keys::TOKENS);
        Self {
            http: reqwest::Client::new(),
            flows: Mutex::new(HashMap::new()),
            tokens: RwLock::new(tokens),
            storage,
            recorder,
        }
    }

    /// Begin an authorization flow: generate the PKCE pair, remember the
    /// transient flow state, and hand back the URL to open.
    pub async fn start_flow(
        &self,
        server_id: &str,
        config: &OAuthConfig,
    ) -> Result<AuthorizationRequest> {
        let verifier = random_unreserved(VERIFIER_LEN);
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        let state = random_unreserved(STATE_LEN);

        let mut url = url::Url::parse(&config.authorize_url)
            .map_err(|e| Error::InvalidConfig(format!("bad authorize url: {e}")))?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &config.client_id)
            .append_pair("redirect_uri", &config.redirect_uri)
            .append_pair("state", &state)
            .append_pair("code_challenge", &challenge)
            .append_pair("code_challenge_method", "S256");
        if !config.scopes.is_empty() {
            url.query_pairs_mut()
                .append_pair("scope", &config.scopes.join(" "));
        }

        let mut flows = self.flows.lock().await;
        purge_expired(&mut flows);
        flows.insert(
            state.clone(),
            PendingFlow {
                server_id: server_id.to_string(),
                verifier,
                config: config.clone(),
                created_at: Utc::now(),
            },
        );

        self.recorder.log(
            LogEntry::new(LogLevel::Info, LogCategory::Connection, "OAuth flow started")
                .server(server_id),
        );

        Ok(AuthorizationRequest {
            url: url.to_string(),
            state,
        })
    }

    /// Finish the flow from the callback parameters: validate `state`,
    /// exchange the code plus verifier, store the token.
    pub async fn complete_flow(&self, params: CallbackParams) -> Result<OAuthToken> {
        let flow = {
            let mut flows = self.flows.lock().await;
            purge_expired(&mut flows);
            flows.remove(&params.state).ok_or(Error::AuthStateMismatch)?
        };

        let form = [
            ("grant_type", "authorization_code"),
            ("code", params.code.as_str()),
            ("redirect_uri", flow.config.redirect_uri.as_str()),
            ("client_id", flow.config.client_id.as_str()),
            ("code_verifier", flow.verifier.as_str()),
        ];
        let response = self.exchange(&flow.config.token_url, &form).await?;

        let now = Utc::now();
        let token = OAuthToken {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            token_type: response.token_type.unwrap_or_else(|| "Bearer".to_string()),
            expires_at: response
                .expires_in
                .map(|secs| now + chrono::Duration::seconds(secs as i64)),
            scope: response.scope,
            created_at: now,
            updated_at: now,
        };

        self.store_token(&flow.server_id, token.clone()).await;
        self.remember_endpoint(&flow.server_id, &flow.config.token_url)
            .await;
        self.recorder.log(
            LogEntry::new(LogLevel::Info, LogCategory::Connection, "OAuth flow completed")
                .server(&flow.server_id),
        );
        Ok(token)
    }

    /// The stored token for a server, if any.
    pub async fn token(&self, server_id: &str) -> Option<OAuthToken> {
        self.tokens.read().await.get(server_id).cloned()
    }

    /// A token usable for a transport handshake right now. Refreshes an
    /// expired token when possible; fails fast with
    /// [`Error::AuthenticationRequired`] when it is not.
    pub async fn valid_token(&self, server_id: &str) -> Result<OAuthToken> {
        let token = self
            .token(server_id)
            .await
            .ok_or_else(|| Error::AuthenticationRequired(server_id.to_string()))?;
        if !token.is_expired() {
            return Ok(token);
        }
        if token.refresh_token.is_none() {
            // No refresh token: expiry is non-recoverable.
            return Err(Error::AuthenticationRequired(server_id.to_string()));
        }
        self.refresh(server_id).await
    }

    /// Exchange the refresh token for a new access token. A response
    /// omitting `refresh_token` keeps the previous one.
    pub async fn refresh(&self, server_id: &str) -> Result<OAuthToken> {
        let current = self
            .token(server_id)
            .await
            .ok_or_else(|| Error::AuthenticationRequired(server_id.to_string()))?;
        let refresh_token = current
            .refresh_token
            .clone()
            .ok_or_else(|| Error::AuthenticationRequired(server_id.to_string()))?;

        let token_url = self
            .refresh_endpoint(server_id)
            .await
            .ok_or_else(|| Error::AuthenticationRequired(server_id.to_string()))?;

        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
        ];
        let response = self.exchange(&token_url, &form).await?;

        let now = Utc::now();
        let token = OAuthToken {
            access_token: response.access_token,
            refresh_token: response.refresh_token.or(Some(refresh_token)),
            token_type: response.token_type.unwrap_or(current.token_type),
            expires_at: response
                .expires_in
                .map(|secs| now + chrono::Duration::seconds(secs as i64)),
            scope: response.scope.or(current.scope),
            created_at: current.created_at,
            updated_at: now,
        };

        self.store_token(server_id, token.clone()).await;
        Ok(token)
    }

    /// Drop the stored token for a server (removal cascade / sign-out).
    pub async fn revoke(&self, server_id: &str) {
        let mut tokens = self.tokens.write().await;
        if tokens.remove(server_id).is_some() {
            storage::store(&*self.storage, keys::TOKENS, &*tokens);
        }
        // Abandoned flows for this server go too.
        drop(tokens);
        let mut flows = self.flows.lock().await;
        flows.retain(|_, flow| flow.server_id != server_id);
    }

    /// Pending flow count, after purging expired ones. Test/diagnostic
    /// hook.
    pub async fn pending_flows(&self) -> usize {
        let mut flows = self.flows.lock().await;
        purge_expired(&mut flows);
        flows.len()
    }

    async fn store_token(&self, server_id: &str, token: OAuthToken) {
        let mut tokens = self.tokens.write().await;
        tokens.insert(server_id.to_string(), token);
        storage::store(&*self.storage, keys::TOKENS, &*tokens);
    }

    /// The token endpoint is remembered per server so refresh works
    /// without re-supplying the OAuth config.
    async fn refresh_endpoint(&self, server_id: &str) -> Option<String> {
        let endpoints: HashMap<String, String> =
            storage::load_or_default(&*self.storage, keys::TOKEN_ENDPOINTS);
        endpoints.get(server_id).cloned()
    }

    async fn remember_endpoint(&self, server_id: &str, token_url: &str) {
        let mut endpoints: HashMap<String, String> =
            storage::load_or_default(&*self.storage, keys::TOKEN_ENDPOINTS);
        endpoints.insert(server_id.to_string(), token_url.to_string());
        storage::store(&*self.storage, keys::TOKEN_ENDPOINTS, &endpoints);
    }

    async fn exchange(&self, token_url: &str, form: &[(&str, &str)]) -> Result<TokenResponse> {
        let send = self.http.post(token_url).form(form).send();
        let response = tokio::time::timeout(EXCHANGE_TIMEOUT, send)
            .await
            .map_err(|_| Error::Timeout(EXCHANGE_TIMEOUT))?
            .map_err(|e| Error::AuthExchangeFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::AuthExchangeFailed(format!("{status}: {body}")));
        }
        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| Error::AuthExchangeFailed(format!("bad token response: {e}")))
    }
}

fn purge_expired(flows: &mut HashMap<String, PendingFlow>) {
    let cutoff = Utc::now()
        - chrono::Duration::from_std(FLOW_TTL).unwrap_or_else(|_| chrono::Duration::seconds(600));
    flows.retain(|_, flow| flow.created_at > cutoff);
}

/// Random string over the RFC 7636 unreserved character set.
fn random_unreserved(len: usize) -> String {
    use rand::Rng;
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._~";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| {
            let idx = rng.random_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}
