use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::ArmError;

pub const MANAGEMENT_SCOPE: &str = "https://management.azure.com/.default";
pub const DEFAULT_LOGIN_BASE: &str = "https://login.microsoftonline.com";

/// Credentials for the non-interactive identity the harness runs as.
/// Secrets come from the command line or environment, never from config files.
#[derive(Clone, Default)]
pub struct Credentials {
    pub tenant_id: String,
    pub subscription_id: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("tenant_id", &self.tenant_id)
            .field("subscription_id", &self.subscription_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// A bearer token and how long it stays valid.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_in: Duration,
}

// ── Token provider ────────────────────────────────────────────────────────────

/// Abstraction over token acquisition. Providers never cache; [`Session`] does.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    fn kind(&self) -> &'static str;
    async fn fetch(&self) -> Result<AccessToken, ArmError>;
}

// ── Service Principal ─────────────────────────────────────────────────────────

struct ServicePrincipalTokenProvider {
    tenant_id:     String,
    client_id:     String,
    client_secret: String,
    login_base:    String,
    client:        reqwest::Client,
}

#[async_trait]
impl TokenProvider for ServicePrincipalTokenProvider {
    fn kind(&self) -> &'static str {
        "service-principal"
    }

    async fn fetch(&self) -> Result<AccessToken, ArmError> {
        let url = format!("{}/{}/oauth2/v2.0/token", self.login_base, self.tenant_id);
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
            ("scope", MANAGEMENT_SCOPE),
        ];
        let resp: Value = self
            .client
            .post(&url)
            .form(&params)
            .send()
            .await
            .map_err(|e| ArmError::Auth(format!("SP token request: {}", e)))?
            .json()
            .await
            .map_err(|e| ArmError::Auth(format!("SP token decode: {}", e)))?;

        let token = resp["access_token"]
            .as_str()
            .ok_or_else(|| {
                let reason = resp["error_description"].as_str().unwrap_or("no access_token in response");
                ArmError::Auth(format!("SP token: {}", reason))
            })?
            .to_string();
        let expires_in = resp["expires_in"].as_u64().unwrap_or(3600);
        Ok(AccessToken { token, expires_in: Duration::from_secs(expires_in) })
    }
}

// ── Managed Identity (IMDS) ───────────────────────────────────────────────────

struct ManagedIdentityTokenProvider {
    client: reqwest::Client,
}

#[async_trait]
impl TokenProvider for ManagedIdentityTokenProvider {
    fn kind(&self) -> &'static str {
        "managed-identity"
    }

    async fn fetch(&self) -> Result<AccessToken, ArmError> {
        let resp: Value = self
            .client
            .get("http://169.254.169.254/metadata/identity/oauth2/token")
            .header("Metadata", "true")
            .query(&[
                ("api-version", "2018-02-01"),
                ("resource", "https://management.azure.com/"),
            ])
            .send()
            .await
            .map_err(|e| ArmError::Auth(format!("IMDS token request: {}", e)))?
            .json()
            .await
            .map_err(|e| ArmError::Auth(format!("IMDS token decode: {}", e)))?;

        let token = resp["access_token"]
            .as_str()
            .ok_or_else(|| ArmError::Auth(format!("IMDS token: no access_token: {}", resp)))?
            .to_string();
        let expires_in = resp["expires_in"]
            .as_str()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(3600);
        Ok(AccessToken { token, expires_in: Duration::from_secs(expires_in) })
    }
}

// ── Azure CLI ─────────────────────────────────────────────────────────────────

/// Reads the token of an existing `az login`; never prompts.
struct AzureCliTokenProvider {
    tenant_id: String,
}

#[async_trait]
impl TokenProvider for AzureCliTokenProvider {
    fn kind(&self) -> &'static str {
        "azure-cli"
    }

    async fn fetch(&self) -> Result<AccessToken, ArmError> {
        let output = tokio::process::Command::new("az")
            .args([
                "account",
                "get-access-token",
                "--resource",
                "https://management.azure.com",
                "--tenant",
                &self.tenant_id,
                "--output",
                "json",
            ])
            .output()
            .await
            .map_err(|e| ArmError::Auth(format!(
                "az CLI not found: {}. Install Azure CLI or configure service principal credentials.",
                e
            )))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ArmError::Auth(format!(
                "az account get-access-token failed: {}. Run 'az login' first.",
                stderr.trim()
            )));
        }

        let resp: Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| ArmError::Auth(format!("az CLI output parse: {}", e)))?;
        let token = resp["accessToken"]
            .as_str()
            .ok_or_else(|| ArmError::Auth("az CLI: no accessToken in output".into()))?
            .to_string();
        // The CLI refreshes its own cache; re-ask it every few minutes.
        Ok(AccessToken { token, expires_in: Duration::from_secs(300) })
    }
}

// ── Static (tests) ────────────────────────────────────────────────────────────

pub struct StaticToken(pub String);

#[async_trait]
impl TokenProvider for StaticToken {
    fn kind(&self) -> &'static str {
        "static"
    }

    async fn fetch(&self) -> Result<AccessToken, ArmError> {
        Ok(AccessToken { token: self.0.clone(), expires_in: Duration::from_secs(3600) })
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

/// The authentication capability every remote call is made through.
///
/// Holds the one token cache of the process. The management API evaluates
/// authorization against the claims of the token it is handed, so after a
/// policy or role assignment changes, callers invoke [`Session::refresh`]
/// before any request that must observe the change.
pub struct Session {
    tenant_id:       String,
    subscription_id: String,
    provider:        Box<dyn TokenProvider>,
    cache:           Mutex<Option<(String, Instant)>>,
    refreshes:       AtomicU64,
}

impl Session {
    /// Create a session, auto-selecting the token provider:
    /// 1. `client_id` + `client_secret` in credentials → Service Principal
    /// 2. `AZURE_CLIENT_ID` + `AZURE_CLIENT_SECRET` env vars → Service Principal
    /// 3. `IDENTITY_ENDPOINT` env var → Managed Identity (IMDS)
    /// 4. Otherwise → Azure CLI cached login
    pub fn new(credentials: Credentials) -> Result<Self, ArmError> {
        Self::with_login_base(credentials, DEFAULT_LOGIN_BASE)
    }

    pub fn with_login_base(credentials: Credentials, login_base: &str) -> Result<Self, ArmError> {
        if credentials.tenant_id.is_empty() {
            return Err(ArmError::Auth("tenant id is required".into()));
        }
        if credentials.subscription_id.is_empty() {
            return Err(ArmError::Auth("subscription id is required".into()));
        }
        let client = reqwest::Client::new();

        let provider: Box<dyn TokenProvider> = if let (Some(cid), Some(cs)) = (
            credentials.client_id.as_deref(),
            credentials.client_secret.as_deref(),
        ) {
            Box::new(ServicePrincipalTokenProvider {
                tenant_id:     credentials.tenant_id.clone(),
                client_id:     cid.to_string(),
                client_secret: cs.to_string(),
                login_base:    login_base.to_string(),
                client,
            })
        } else if let (Ok(cid), Ok(cs)) = (
            std::env::var("AZURE_CLIENT_ID"),
            std::env::var("AZURE_CLIENT_SECRET"),
        ) {
            Box::new(ServicePrincipalTokenProvider {
                tenant_id:     credentials.tenant_id.clone(),
                client_id:     cid,
                client_secret: cs,
                login_base:    login_base.to_string(),
                client,
            })
        } else if std::env::var("IDENTITY_ENDPOINT").is_ok() {
            Box::new(ManagedIdentityTokenProvider { client })
        } else {
            Box::new(AzureCliTokenProvider { tenant_id: credentials.tenant_id.clone() })
        };

        info!(provider = provider.kind(), tenant_id = %credentials.tenant_id, "Session created");
        Ok(Self::with_provider(&credentials.tenant_id, &credentials.subscription_id, provider))
    }

    pub fn with_provider(tenant_id: &str, subscription_id: &str, provider: Box<dyn TokenProvider>) -> Self {
        Self {
            tenant_id:       tenant_id.to_string(),
            subscription_id: subscription_id.to_string(),
            provider,
            cache:           Mutex::new(None),
            refreshes:       AtomicU64::new(0),
        }
    }

    /// Session with a fixed bearer token. Used by tests and fakes.
    pub fn static_token(tenant_id: &str, subscription_id: &str, token: &str) -> Self {
        Self::with_provider(tenant_id, subscription_id, Box::new(StaticToken(token.to_string())))
    }

    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    /// Current bearer token, fetched on first use or after expiry.
    pub async fn bearer(&self) -> Result<String, ArmError> {
        let mut guard = self.cache.lock().await;
        if let Some((tok, expiry)) = guard.as_ref() {
            if Instant::now() < *expiry {
                return Ok(tok.clone());
            }
        }
        let fresh = self.provider.fetch().await?;
        let expiry = Instant::now() + fresh.expires_in.saturating_sub(Duration::from_secs(60));
        *guard = Some((fresh.token.clone(), expiry));
        Ok(fresh.token)
    }

    /// Drop the cached token and acquire a new one. Completes before returning,
    /// so every request issued afterwards carries the fresh token.
    pub async fn refresh(&self) -> Result<(), ArmError> {
        let mut guard = self.cache.lock().await;
        *guard = None;
        let fresh = self.provider.fetch().await?;
        let expiry = Instant::now() + fresh.expires_in.saturating_sub(Duration::from_secs(60));
        *guard = Some((fresh.token, expiry));
        let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(provider = self.provider.kind(), tenant_id = %self.tenant_id, refreshes = n, "Session token refreshed");
        Ok(())
    }

    /// How many times [`Session::refresh`] has completed.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::SeqCst)
    }
}
