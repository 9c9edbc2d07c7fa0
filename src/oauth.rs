//! Token lifecycle shared by every integration: authorization-code
//! exchange, credential login, expiry-driven refresh and disconnect.

use base64::Engine;
use chrono::Utc;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    error::{AppError, Result},
    provider::{GrantKind, Integration, Provider},
    token_store::TokenStore,
    types::{ConnectionStatus, OAuthToken, PendingAuthorization},
};

const PENDING_AUTHORIZATION_TTL: Duration = Duration::from_secs(600);

// 64 random bytes, URL-safe base64 without padding
fn random_urlsafe() -> String {
    let random_bytes: Vec<u8> = (0..64).map(|_| rand::thread_rng().gen()).collect();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(random_bytes)
}

pub fn generate_code_verifier() -> String {
    random_urlsafe()
}

pub fn generate_code_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    let result = hasher.finalize();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(result)
}

pub fn generate_state() -> String {
    random_urlsafe()
}

pub struct TokenManager {
    providers: HashMap<Integration, Provider>,
    store: TokenStore,
    http_client: reqwest::Client,
    pending: RwLock<HashMap<String, PendingAuthorization>>,
    refresh_locks: HashMap<Integration, Mutex<()>>,
}

impl TokenManager {
    pub fn new(providers: Vec<Provider>, store: TokenStore, http_client: reqwest::Client) -> Self {
        Self {
            providers: providers
                .into_iter()
                .map(|provider| (provider.integration, provider))
                .collect(),
            store,
            http_client,
            pending: RwLock::new(HashMap::new()),
            refresh_locks: Integration::ALL
                .into_iter()
                .map(|integration| (integration, Mutex::new(())))
                .collect(),
        }
    }

    pub fn provider(&self, integration: Integration) -> Result<&Provider> {
        self.providers
            .get(&integration)
            .ok_or_else(|| AppError::NotConfigured(integration.display_name().to_string()))
    }

    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    /// Start an authorization-code flow and return the provider URL the user
    /// should be sent to.
    pub fn begin_authorization(&self, integration: Integration) -> Result<String> {
        let provider = self.provider(integration)?;
        if integration.grant_kind() != GrantKind::AuthorizationCode {
            return Err(AppError::BadRequest(format!(
                "{} signs in with account credentials, not a browser redirect",
                integration.display_name()
            )));
        }
        if !provider.is_configured() {
            return Err(AppError::NotConfigured(format!(
                "{} API credentials",
                integration.display_name()
            )));
        }

        let state = generate_state();
        let code_verifier = integration.uses_pkce().then(generate_code_verifier);
        let challenge = code_verifier.as_deref().map(generate_code_challenge);
        let auth_url = provider.authorization_url(&state, challenge.as_deref())?;

        let mut pending = self.pending.write().unwrap_or_else(PoisonError::into_inner);
        pending.retain(|_, p| p.created_at.elapsed() < PENDING_AUTHORIZATION_TTL);
        pending.insert(
            state,
            PendingAuthorization {
                integration,
                code_verifier,
                created_at: Instant::now(),
            },
        );

        info!("Starting {} authorization", integration.display_name());
        debug!("{} authorization URL: {}", integration, auth_url);
        Ok(auth_url)
    }

    /// Exchange the callback code for the first token set and persist it.
    pub async fn complete_authorization(
        &self,
        integration: Integration,
        code: String,
        state: &str,
    ) -> Result<OAuthToken> {
        let pending = self.take_pending(integration, state)?;
        let provider = self.provider(integration)?;

        let request = provider.code_exchange_request(code, pending.code_verifier);
        let response = provider.request_token(&self.http_client, &request).await?;

        let token = OAuthToken::from_response(response, None, Utc::now());
        self.store.save(integration, token.clone())?;

        info!("Stored {} tokens", integration.display_name());
        Ok(token)
    }

    fn take_pending(&self, integration: Integration, state: &str) -> Result<PendingAuthorization> {
        let mut pending = self.pending.write().unwrap_or_else(PoisonError::into_inner);
        match pending.remove(state) {
            Some(p)
                if p.integration == integration
                    && p.created_at.elapsed() < PENDING_AUTHORIZATION_TTL =>
            {
                Ok(p)
            }
            Some(p) => {
                warn!(
                    "Rejected stale or mismatched OAuth state for {} (issued for {})",
                    integration, p.integration
                );
                Err(AppError::InvalidState)
            }
            None => Err(AppError::InvalidState),
        }
    }

    /// Session-style sign-in with configured account credentials.
    pub async fn login(&self, integration: Integration) -> Result<OAuthToken> {
        let provider = self.provider(integration)?;
        let request = provider.login_request()?;
        let response = provider.request_token(&self.http_client, &request).await?;

        let token = OAuthToken::from_response(response, None, Utc::now());
        self.store.save(integration, token.clone())?;

        info!("Signed in to {}", integration.display_name());
        Ok(token)
    }

    /// Return an access token that is not within the provider's refresh
    /// margin of expiry, refreshing and persisting first when needed.
    pub async fn get_valid_token(&self, integration: Integration) -> Result<String> {
        let margin = integration.refresh_margin();

        let token = self.current(integration)?;
        if !token.needs_refresh(margin, Utc::now()) {
            return Ok(token.access_token);
        }

        let _guard = self.refresh_lock(integration).lock().await;

        // Someone else may have refreshed while we waited for the lock.
        let token = self.current(integration)?;
        if !token.needs_refresh(margin, Utc::now()) {
            return Ok(token.access_token);
        }

        info!("{} token expired or expiring, refreshing", integration.display_name());
        Ok(self.refresh_token(integration, token).await?.access_token)
    }

    /// Refresh regardless of expiry.
    pub async fn force_refresh(&self, integration: Integration) -> Result<OAuthToken> {
        let _guard = self.refresh_lock(integration).lock().await;
        let token = self.current(integration)?;
        self.refresh_token(integration, token).await
    }

    /// Called after the upstream rejected `rejected_access_token`. Refreshes
    /// once unless another caller already replaced that token.
    pub async fn refresh_after_rejection(
        &self,
        integration: Integration,
        rejected_access_token: &str,
    ) -> Result<OAuthToken> {
        let _guard = self.refresh_lock(integration).lock().await;
        let token = self.current(integration)?;
        if token.access_token != rejected_access_token {
            return Ok(token);
        }
        self.refresh_token(integration, token).await
    }

    pub fn can_refresh(&self, integration: Integration) -> bool {
        integration.grant_kind() == GrantKind::Credentials
            || self
                .store
                .get(integration)
                .is_some_and(|token| token.refresh_token.is_some())
    }

    fn current(&self, integration: Integration) -> Result<OAuthToken> {
        self.store.get(integration).ok_or_else(|| {
            AppError::Authentication(format!(
                "not connected to {}, authorize first",
                integration.display_name()
            ))
        })
    }

    fn refresh_lock(&self, integration: Integration) -> &Mutex<()> {
        // Every integration gets a lock in `new`.
        &self.refresh_locks[&integration]
    }

    // Callers hold the integration's refresh lock.
    async fn refresh_token(
        &self,
        integration: Integration,
        current: OAuthToken,
    ) -> Result<OAuthToken> {
        let provider = self.provider(integration)?;

        let Some(refresh_token) = current.refresh_token.clone() else {
            if integration.grant_kind() == GrantKind::Credentials {
                info!("{} session has no refresh token, signing in again", integration);
                return self.login(integration).await.map_err(|e| match e {
                    AppError::TokenExchange(message) => AppError::Refresh(message),
                    other => other,
                });
            }
            return Err(AppError::Refresh(format!(
                "no {} refresh token available, authorize again",
                integration.display_name()
            )));
        };

        let request = provider.refresh_request(refresh_token);
        let response = provider.request_token(&self.http_client, &request).await?;

        // A manual token or a disconnect may have replaced what we refreshed.
        match self.store.get(integration) {
            Some(stored) if stored.access_token == current.access_token => {}
            Some(stored) => {
                debug!("{} token replaced during refresh, keeping it", integration);
                return Ok(stored);
            }
            None => {
                return Err(AppError::Authentication(format!(
                    "{} was disconnected during refresh",
                    integration.display_name()
                )))
            }
        }

        let token = OAuthToken::from_response(response, current.refresh_token, Utc::now());
        self.store.save(integration, token.clone())?;

        info!(
            "Refreshed {} token, expires at {:?}",
            integration.display_name(),
            token.expires_at
        );
        Ok(token)
    }

    pub fn set_manual_token(&self, integration: Integration, access_token: String) -> Result<()> {
        let access_token = access_token.trim().to_string();
        if access_token.is_empty() {
            return Err(AppError::BadRequest("access_token must not be empty".into()));
        }
        self.store.save(integration, OAuthToken::manual(access_token))?;
        info!("Stored manual {} access token", integration.display_name());
        Ok(())
    }

    /// Waits for an in-flight refresh so it cannot write the token back.
    pub async fn disconnect(&self, integration: Integration) -> Result<()> {
        let _guard = self.refresh_lock(integration).lock().await;
        self.store.clear(integration)?;
        info!("Disconnected from {}", integration.display_name());
        Ok(())
    }

    pub fn status(&self, integration: Integration) -> ConnectionStatus {
        let token = self.store.get(integration);
        ConnectionStatus {
            integration,
            configured: self
                .providers
                .get(&integration)
                .is_some_and(Provider::is_configured),
            connected: token.is_some(),
            method: token.as_ref().map(OAuthToken::method),
            has_refresh_token: token
                .as_ref()
                .is_some_and(|t| t.refresh_token.is_some()),
            expires_at: token.and_then(|t| t.expires_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{manager_for, write_token_file};
    use serde_json::json;
    use std::sync::Arc;
    use url::Url;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockBuilder, MockServer, ResponseTemplate};

    fn token_endpoint() -> MockBuilder {
        Mock::given(method("POST")).and(path("/token"))
    }

    fn issued(body: serde_json::Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(body)
    }

    #[test]
    fn challenge_is_sha256_of_verifier() {
        // RFC 7636 appendix B
        let verifier = "dBjftJeZ4CVP-mJ92K9qbhRhwG7BnxuBjMbTuhEWeH0";
        assert_eq!(
            generate_code_challenge(verifier),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
        assert_ne!(generate_state(), generate_state());
    }

    #[tokio::test]
    async fn missing_token_is_an_authentication_error() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_for(&server.uri(), dir.path());

        let err = manager
            .get_valid_token(Integration::Monzo)
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Authentication(_)));
    }

    #[tokio::test]
    async fn expired_token_triggers_exactly_one_refresh() {
        let server = MockServer::start().await;
        token_endpoint()
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=Y"))
            .respond_with(issued(json!({"access_token": "Z", "expires_in": 3600})))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        write_token_file(dir.path(), "monzo", "X", Some("Y"), "2020-01-01T00:00:00Z");
        let manager = manager_for(&server.uri(), dir.path());

        assert_eq!(manager.get_valid_token(Integration::Monzo).await.unwrap(), "Z");
        assert_eq!(manager.get_valid_token(Integration::Monzo).await.unwrap(), "Z");
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let server = MockServer::start().await;
        token_endpoint()
            .respond_with(issued(json!({"access_token": "Z", "expires_in": 3600})))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        write_token_file(dir.path(), "spotify", "X", Some("Y"), "2020-01-01T00:00:00Z");
        let manager = Arc::new(manager_for(&server.uri(), dir.path()));

        let (a, b) = tokio::join!(
            manager.get_valid_token(Integration::Spotify),
            manager.get_valid_token(Integration::Spotify)
        );

        assert_eq!(a.unwrap(), "Z");
        assert_eq!(b.unwrap(), "Z");
    }

    #[tokio::test]
    async fn token_inside_margin_is_refreshed_and_fresh_one_is_not() {
        let server = MockServer::start().await;
        token_endpoint()
            .respond_with(issued(json!({"access_token": "Z", "expires_in": 3600})))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        // Spotify refreshes five minutes early.
        let soon = (Utc::now() + chrono::Duration::minutes(2)).to_rfc3339();
        let later = (Utc::now() + chrono::Duration::hours(1)).to_rfc3339();
        write_token_file(dir.path(), "spotify", "S", Some("Y"), &soon);
        write_token_file(dir.path(), "monzo", "M", Some("Y"), &later);
        let manager = manager_for(&server.uri(), dir.path());

        assert_eq!(manager.get_valid_token(Integration::Spotify).await.unwrap(), "Z");
        assert_eq!(manager.get_valid_token(Integration::Monzo).await.unwrap(), "M");
    }

    #[tokio::test]
    async fn forced_refresh_persists_new_token_and_future_expiry() {
        let server = MockServer::start().await;
        token_endpoint()
            .respond_with(issued(json!({"access_token": "Z", "expires_in": 3600})))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        write_token_file(dir.path(), "monzo", "X", Some("Y"), "2020-01-01T00:00:00Z");
        let manager = manager_for(&server.uri(), dir.path());

        manager.force_refresh(Integration::Monzo).await.unwrap();

        let on_disk: OAuthToken = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("monzo_tokens.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(on_disk.access_token, "Z");
        assert_eq!(on_disk.refresh_token.as_deref(), Some("Y"));
        assert!(on_disk.expires_at.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn oversized_expires_in_does_not_break_refresh() {
        let server = MockServer::start().await;
        token_endpoint()
            .respond_with(issued(json!({"access_token": "Z", "expires_in": i64::MAX})))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        write_token_file(dir.path(), "monzo", "X", Some("Y"), "2020-01-01T00:00:00Z");
        let manager = manager_for(&server.uri(), dir.path());

        assert_eq!(manager.get_valid_token(Integration::Monzo).await.unwrap(), "Z");
        assert!(manager.status(Integration::Monzo).expires_at.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid_grant"))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        write_token_file(dir.path(), "monzo", "X", Some("Y"), "2020-01-01T00:00:00Z");
        let manager = manager_for(&server.uri(), dir.path());

        let err = manager
            .get_valid_token(Integration::Monzo)
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Refresh(_)));
        let kept = manager.store().get(Integration::Monzo).unwrap();
        assert_eq!(kept.access_token, "X");
        assert_eq!(kept.refresh_token.as_deref(), Some("Y"));
    }

    #[tokio::test]
    async fn expired_token_without_refresh_token_is_not_returned() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        write_token_file(dir.path(), "google", "X", None, "2020-01-01T00:00:00Z");
        let manager = manager_for(&server.uri(), dir.path());

        let err = manager
            .get_valid_token(Integration::Google)
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Refresh(_)));
    }

    #[tokio::test]
    async fn failed_garmin_sign_in_during_refresh_is_a_refresh_error() {
        let server = MockServer::start().await;
        token_endpoint()
            .respond_with(ResponseTemplate::new(401).set_body_string("bad credentials"))
            .expect(2)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        write_token_file(dir.path(), "garmin", "session-1", None, "2020-01-01T00:00:00Z");
        let manager = manager_for(&server.uri(), dir.path());

        let err = manager
            .get_valid_token(Integration::Garmin)
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Refresh(_)));
        // An explicit sign-in keeps reporting exchange failures.
        assert!(matches!(
            manager.login(Integration::Garmin).await,
            Err(AppError::TokenExchange(_))
        ));
    }

    #[tokio::test]
    async fn garmin_signs_in_again_when_session_lapses() {
        let server = MockServer::start().await;
        token_endpoint()
            .and(body_string_contains("grant_type=password"))
            .and(body_string_contains("username=me%40example.com"))
            .respond_with(issued(json!({"access_token": "session-2", "expires_in": 3600})))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        write_token_file(dir.path(), "garmin", "session-1", None, "2020-01-01T00:00:00Z");
        let manager = manager_for(&server.uri(), dir.path());

        assert!(manager.can_refresh(Integration::Garmin));
        assert_eq!(
            manager.get_valid_token(Integration::Garmin).await.unwrap(),
            "session-2"
        );
    }

    #[tokio::test]
    async fn authorization_code_flow_populates_store() {
        let server = MockServer::start().await;
        token_endpoint()
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=the-code"))
            .and(body_string_contains("code_verifier="))
            .respond_with(issued(json!({
                "access_token": "A",
                "refresh_token": "R",
                "expires_in": 3600,
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let manager = manager_for(&server.uri(), dir.path());

        let auth_url = manager.begin_authorization(Integration::Spotify).unwrap();
        let state = Url::parse(&auth_url)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned())
            .unwrap();

        manager
            .complete_authorization(Integration::Spotify, "the-code".into(), &state)
            .await
            .unwrap();

        assert_eq!(manager.get_valid_token(Integration::Spotify).await.unwrap(), "A");
        assert_eq!(manager.status(Integration::Spotify).method, Some("oauth"));

        // The state is single-use.
        let replay = manager
            .complete_authorization(Integration::Spotify, "the-code".into(), &state)
            .await;
        assert!(matches!(replay, Err(AppError::InvalidState)));
    }

    #[tokio::test]
    async fn state_issued_for_another_integration_is_rejected() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_for(&server.uri(), dir.path());

        let auth_url = manager.begin_authorization(Integration::Monzo).unwrap();
        let state = Url::parse(&auth_url)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned())
            .unwrap();

        let err = manager
            .complete_authorization(Integration::Google, "code".into(), &state)
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::InvalidState));
        assert!(matches!(
            manager.begin_authorization(Integration::Garmin),
            Err(AppError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn disconnect_wins_over_refresh_in_flight() {
        let server = MockServer::start().await;
        token_endpoint()
            .respond_with(
                issued(json!({"access_token": "Z", "expires_in": 3600}))
                    .set_delay(std::time::Duration::from_millis(300)),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        write_token_file(dir.path(), "monzo", "X", Some("Y"), "2020-01-01T00:00:00Z");
        let manager = Arc::new(manager_for(&server.uri(), dir.path()));

        let refreshing = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.get_valid_token(Integration::Monzo).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        manager.disconnect(Integration::Monzo).await.unwrap();
        let _ = refreshing.await.unwrap();

        assert!(manager.store().get(Integration::Monzo).is_none());
        assert!(!dir.path().join("monzo_tokens.json").exists());
    }

    #[tokio::test]
    async fn refresh_does_not_overwrite_a_replacement_token() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        write_token_file(dir.path(), "monzo", "X", Some("Y"), "2020-01-01T00:00:00Z");
        let manager = manager_for(&server.uri(), dir.path());
        let stale = manager.store().get(Integration::Monzo).unwrap();
        token_endpoint()
            .respond_with(issued(json!({"access_token": "Z", "expires_in": 3600})))
            .mount(&server)
            .await;

        manager
            .set_manual_token(Integration::Monzo, "manual".into())
            .unwrap();
        let kept = manager
            .refresh_token(Integration::Monzo, stale.clone())
            .await
            .unwrap();
        assert_eq!(kept.access_token, "manual");

        manager.store().clear(Integration::Monzo).unwrap();
        let gone = manager.refresh_token(Integration::Monzo, stale).await;
        assert!(matches!(gone, Err(AppError::Authentication(_))));
        assert!(manager.store().get(Integration::Monzo).is_none());
    }

    #[tokio::test]
    async fn disconnect_twice_leaves_store_empty() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        write_token_file(dir.path(), "monzo", "X", Some("Y"), "2030-01-01T00:00:00Z");
        let manager = manager_for(&server.uri(), dir.path());
        assert!(manager.status(Integration::Monzo).connected);

        manager.disconnect(Integration::Monzo).await.unwrap();
        assert!(manager.store().get(Integration::Monzo).is_none());

        manager.disconnect(Integration::Monzo).await.unwrap();
        assert!(manager.store().get(Integration::Monzo).is_none());
        assert!(!manager.status(Integration::Monzo).connected);
    }

    #[tokio::test]
    async fn manual_tokens_are_returned_as_is() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_for(&server.uri(), dir.path());

        manager
            .set_manual_token(Integration::Monzo, " playground ".into())
            .unwrap();

        assert_eq!(
            manager.get_valid_token(Integration::Monzo).await.unwrap(),
            "playground"
        );
        assert!(!manager.can_refresh(Integration::Monzo));
        assert!(matches!(
            manager.set_manual_token(Integration::Monzo, "  ".into()),
            Err(AppError::BadRequest(_))
        ));
    }
}
