//! OAuth 2.0 / OIDC provider mocks.
//!
//! Token minting is delegated to a [`TokenIssuer`]; the engine only decides
//! whether a grant is allowed and what goes into the token.

use crate::error::ValidationError;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashSet};

/// OAuth mock payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct OAuthSpec {
    pub issuer: String,

    /// Access token lifetime in seconds
    #[serde(default = "default_token_expiry")]
    pub token_expiry: u64,

    /// Refresh token lifetime in seconds
    #[serde(default = "default_refresh_expiry")]
    pub refresh_expiry: u64,

    #[serde(default)]
    pub default_scopes: Vec<String>,

    #[serde(default)]
    pub clients: Vec<OAuthClient>,

    #[serde(default)]
    pub users: Vec<OAuthUser>,
}

fn default_token_expiry() -> u64 {
    3600
}

fn default_refresh_expiry() -> u64 {
    86_400
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct OAuthClient {
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    /// Allowed grants; empty allows all supported grants
    #[serde(default)]
    pub grant_types: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OAuthUser {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub claims: BTreeMap<String, Value>,
}

/// Form fields posted to the token endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenRequest {
    pub grant_type: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    pub scope: String,
}

/// RFC 6749 error body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OAuthErrorBody {
    pub error: &'static str,
    pub error_description: String,
}

impl OAuthErrorBody {
    fn new(error: &'static str, description: impl Into<String>) -> Self {
        Self {
            error,
            error_description: description.into(),
        }
    }

    /// HTTP status the token endpoint answers with.
    pub fn status_code(&self) -> u16 {
        if self.error == "invalid_client" {
            401
        } else {
            400
        }
    }
}

/// What to put into issued tokens.
#[derive(Debug, Clone, PartialEq)]
pub struct IssueRequest {
    pub issuer: String,
    pub subject: String,
    pub audience: String,
    pub scopes: Vec<String>,
    pub expires_in: u64,
    pub refresh_expires_in: u64,
    pub claims: BTreeMap<String, Value>,
    pub include_refresh: bool,
    pub include_id_token: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IssuedTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
}

/// Who a refresh token was issued for.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshClaims {
    pub subject: String,
    pub client_id: String,
}

/// Token minting and refresh-token inspection.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn issue(&self, request: &IssueRequest) -> anyhow::Result<IssuedTokens>;

    /// Claims of a still valid refresh token.
    async fn refresh_claims(&self, refresh_token: &str) -> Option<RefreshClaims>;
}

/// Issues unsigned `alg: none` tokens carrying the claims in clear.
#[derive(Debug, Default, Clone)]
pub struct UnsignedTokenIssuer;

impl UnsignedTokenIssuer {
    fn encode(claims: &Value) -> anyhow::Result<String> {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
        Ok(format!("{header}.{payload}."))
    }

    fn decode(token: &str) -> Option<Value> {
        let payload = token.split('.').nth(1)?;
        let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}

#[async_trait]
impl TokenIssuer for UnsignedTokenIssuer {
    async fn issue(&self, request: &IssueRequest) -> anyhow::Result<IssuedTokens> {
        let now = chrono::Utc::now().timestamp();
        let mut claims: Map<String, Value> = request
            .claims
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        claims.insert("iss".into(), json!(request.issuer));
        claims.insert("sub".into(), json!(request.subject));
        claims.insert("aud".into(), json!(request.audience));
        claims.insert("iat".into(), json!(now));
        claims.insert("exp".into(), json!(now + request.expires_in as i64));
        claims.insert("scope".into(), json!(request.scopes.join(" ")));
        claims.insert("jti".into(), json!(uuid::Uuid::new_v4().to_string()));
        let access_token = Self::encode(&Value::Object(claims.clone()))?;

        let refresh_token = if request.include_refresh {
            Some(Self::encode(&json!({
                "iss": request.issuer,
                "sub": request.subject,
                "client_id": request.audience,
                "typ": "refresh",
                "exp": now + request.refresh_expires_in as i64,
                "jti": uuid::Uuid::new_v4().to_string(),
            }))?)
        } else {
            None
        };

        let id_token = if request.include_id_token {
            claims.remove("scope");
            Some(Self::encode(&Value::Object(claims))?)
        } else {
            None
        };

        Ok(IssuedTokens {
            access_token,
            refresh_token,
            id_token,
        })
    }

    async fn refresh_claims(&self, refresh_token: &str) -> Option<RefreshClaims> {
        let claims = Self::decode(refresh_token)?;
        if claims.get("typ").and_then(Value::as_str) != Some("refresh") {
            return None;
        }
        let exp = claims.get("exp").and_then(Value::as_i64)?;
        if exp < chrono::Utc::now().timestamp() {
            return None;
        }
        let field = |name: &str| claims.get(name).and_then(Value::as_str).map(String::from);
        Some(RefreshClaims {
            subject: field("sub")?,
            client_id: field("client_id")?,
        })
    }
}

const SUPPORTED_GRANTS: [&str; 3] = ["client_credentials", "password", "refresh_token"];

impl OAuthSpec {
    pub fn new(issuer: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            token_expiry: default_token_expiry(),
            refresh_expiry: default_refresh_expiry(),
            default_scopes: Vec::new(),
            clients: Vec::new(),
            users: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.issuer.trim().is_empty() {
            return Err(ValidationError::Missing("oauth.issuer"));
        }
        if self.token_expiry == 0 {
            return Err(ValidationError::Invalid(
                "oauth.tokenExpiry must be positive".into(),
            ));
        }
        let mut seen = HashSet::new();
        for client in &self.clients {
            if !seen.insert(client.client_id.as_str()) {
                return Err(ValidationError::Invalid(format!(
                    "oauth client {:?} is declared twice",
                    client.client_id
                )));
            }
            if let Some(grant) = client
                .grant_types
                .iter()
                .find(|g| !SUPPORTED_GRANTS.contains(&g.as_str()) && *g != "authorization_code")
            {
                return Err(ValidationError::Invalid(format!(
                    "oauth client {:?}: unknown grant type {grant:?}",
                    client.client_id
                )));
            }
        }
        Ok(())
    }

    /// OpenID discovery document for this issuer.
    pub fn discovery(&self) -> Value {
        let issuer = self.issuer.trim_end_matches('/');
        json!({
            "issuer": issuer,
            "authorization_endpoint": format!("{issuer}/authorize"),
            "token_endpoint": format!("{issuer}/token"),
            "userinfo_endpoint": format!("{issuer}/userinfo"),
            "jwks_uri": format!("{issuer}/.well-known/jwks.json"),
            "grant_types_supported": SUPPORTED_GRANTS,
            "response_types_supported": ["code"],
            "scopes_supported": self.default_scopes,
            "id_token_signing_alg_values_supported": ["none"],
            "token_endpoint_auth_methods_supported": ["client_secret_post", "client_secret_basic"],
        })
    }

    fn authenticate(&self, request: &TokenRequest) -> Result<&OAuthClient, OAuthErrorBody> {
        self.clients
            .iter()
            .find(|c| c.client_id == request.client_id && c.client_secret == request.client_secret)
            .ok_or_else(|| OAuthErrorBody::new("invalid_client", "client authentication failed"))
    }

    fn scopes(&self, requested: Option<&str>) -> Result<Vec<String>, OAuthErrorBody> {
        let requested: Vec<String> = requested
            .map(|s| s.split_whitespace().map(String::from).collect())
            .unwrap_or_default();
        if requested.is_empty() {
            return Ok(self.default_scopes.clone());
        }
        if !self.default_scopes.is_empty() {
            if let Some(unknown) = requested.iter().find(|s| !self.default_scopes.contains(s)) {
                return Err(OAuthErrorBody::new(
                    "invalid_scope",
                    format!("scope {unknown:?} is not allowed"),
                ));
            }
        }
        Ok(requested)
    }

    /// Run the token endpoint for one request.
    pub async fn grant(
        &self,
        request: &TokenRequest,
        issuer: &dyn TokenIssuer,
    ) -> Result<TokenResponse, OAuthErrorBody> {
        if !SUPPORTED_GRANTS.contains(&request.grant_type.as_str()) {
            return Err(OAuthErrorBody::new(
                "unsupported_grant_type",
                format!("grant type {:?} is not supported", request.grant_type),
            ));
        }
        let client = self.authenticate(request)?;
        if !client.grant_types.is_empty() && !client.grant_types.contains(&request.grant_type) {
            return Err(OAuthErrorBody::new(
                "unauthorized_client",
                format!("client may not use {}", request.grant_type),
            ));
        }
        let scopes = self.scopes(request.scope.as_deref())?;

        let (subject, claims, is_user) = match request.grant_type.as_str() {
            "client_credentials" => (client.client_id.clone(), BTreeMap::new(), false),
            "password" => {
                let user = self
                    .users
                    .iter()
                    .find(|u| {
                        Some(u.username.as_str()) == request.username.as_deref()
                            && Some(u.password.as_str()) == request.password.as_deref()
                    })
                    .ok_or_else(|| {
                        OAuthErrorBody::new("invalid_grant", "invalid username or password")
                    })?;
                (user.username.clone(), user.claims.clone(), true)
            }
            _ => {
                let token = request.refresh_token.as_deref().unwrap_or_default();
                let subject = issuer
                    .refresh_claims(token)
                    .await
                    .filter(|refresh| refresh.client_id == client.client_id)
                    .map(|refresh| refresh.subject)
                    .ok_or_else(|| {
                        OAuthErrorBody::new(
                            "invalid_grant",
                            "refresh token is invalid, expired or issued to another client",
                        )
                    })?;
                let claims = self
                    .users
                    .iter()
                    .find(|u| u.username == subject)
                    .map(|u| u.claims.clone())
                    .unwrap_or_default();
                let is_user = subject != client.client_id;
                (subject, claims, is_user)
            }
        };

        let issue = IssueRequest {
            issuer: self.issuer.clone(),
            subject,
            audience: client.client_id.clone(),
            scopes: scopes.clone(),
            expires_in: self.token_expiry,
            refresh_expires_in: self.refresh_expiry,
            claims,
            include_refresh: is_user,
            include_id_token: is_user && scopes.iter().any(|s| s == "openid"),
        };
        let tokens = issuer
            .issue(&issue)
            .await
            .map_err(|e| OAuthErrorBody::new("server_error", e.to_string()))?;

        Ok(TokenResponse {
            access_token: tokens.access_token,
            token_type: "Bearer".into(),
            expires_in: self.token_expiry,
            refresh_token: tokens.refresh_token,
            id_token: tokens.id_token,
            scope: scopes.join(" "),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> OAuthSpec {
        serde_yaml::from_str(
            r#"
issuer: http://localhost:9999/oauth
defaultScopes: [openid, profile, read]
clients:
  - clientId: web
    clientSecret: s3cret
  - clientId: machine
    clientSecret: m
    grantTypes: [client_credentials]
  - clientId: mobile
    clientSecret: m0b
users:
  - username: ada
    password: lovelace
    claims: {email: ada@example.com}
"#,
        )
        .unwrap()
    }

    fn request(grant: &str, client: &str, secret: &str) -> TokenRequest {
        TokenRequest {
            grant_type: grant.into(),
            client_id: client.into(),
            client_secret: secret.into(),
            ..TokenRequest::default()
        }
    }

    #[tokio::test]
    async fn test_client_credentials() {
        let token = spec()
            .grant(&request("client_credentials", "machine", "m"), &UnsignedTokenIssuer)
            .await
            .unwrap();
        assert_eq!(token.token_type, "Bearer");
        assert_eq!(token.expires_in, 3600);
        assert!(token.refresh_token.is_none());
        assert_eq!(token.scope, "openid profile read");
    }

    #[tokio::test]
    async fn test_bad_secret_is_invalid_client() {
        let err = spec()
            .grant(&request("client_credentials", "machine", "wrong"), &UnsignedTokenIssuer)
            .await
            .unwrap_err();
        assert_eq!(err.error, "invalid_client");
        assert_eq!(err.status_code(), 401);
    }

    #[tokio::test]
    async fn test_password_grant_and_refresh() {
        let spec = spec();
        let mut req = request("password", "web", "s3cret");
        req.username = Some("ada".into());
        req.password = Some("lovelace".into());
        req.scope = Some("openid read".into());
        let token = spec.grant(&req, &UnsignedTokenIssuer).await.unwrap();
        assert!(token.id_token.is_some());
        let claims = UnsignedTokenIssuer::decode(&token.access_token).unwrap();
        assert_eq!(claims["sub"], "ada");
        assert_eq!(claims["email"], "ada@example.com");

        let mut refresh = request("refresh_token", "web", "s3cret");
        refresh.refresh_token = token.refresh_token.clone();
        let renewed = spec.grant(&refresh, &UnsignedTokenIssuer).await.unwrap();
        let claims = UnsignedTokenIssuer::decode(&renewed.access_token).unwrap();
        assert_eq!(claims["sub"], "ada");
    }

    #[tokio::test]
    async fn test_refresh_token_bound_to_client() {
        let spec = spec();
        let mut req = request("password", "web", "s3cret");
        req.username = Some("ada".into());
        req.password = Some("lovelace".into());
        let token = spec.grant(&req, &UnsignedTokenIssuer).await.unwrap();
        let refresh_token = token.refresh_token.unwrap();
        let refresh = UnsignedTokenIssuer.refresh_claims(&refresh_token).await.unwrap();
        assert_eq!(refresh.client_id, "web");

        let mut stolen = request("refresh_token", "mobile", "m0b");
        stolen.refresh_token = Some(refresh_token);
        let err = spec.grant(&stolen, &UnsignedTokenIssuer).await.unwrap_err();
        assert_eq!(err.error, "invalid_grant");
    }

    #[tokio::test]
    async fn test_grant_restrictions() {
        let spec = spec();
        let mut req = request("password", "machine", "m");
        req.username = Some("ada".into());
        req.password = Some("lovelace".into());
        let err = spec.grant(&req, &UnsignedTokenIssuer).await.unwrap_err();
        assert_eq!(err.error, "unauthorized_client");

        let err = spec
            .grant(&request("implicit", "web", "s3cret"), &UnsignedTokenIssuer)
            .await
            .unwrap_err();
        assert_eq!(err.error, "unsupported_grant_type");

        let mut req = request("client_credentials", "web", "s3cret");
        req.scope = Some("admin".into());
        let err = spec.grant(&req, &UnsignedTokenIssuer).await.unwrap_err();
        assert_eq!(err.error, "invalid_scope");
    }

    #[test]
    fn test_discovery_document() {
        let doc = spec().discovery();
        assert_eq!(doc["token_endpoint"], "http://localhost:9999/oauth/token");
        assert_eq!(doc["issuer"], "http://localhost:9999/oauth");
    }

    #[test]
    fn test_duplicate_client_rejected() {
        let mut spec = spec();
        spec.clients.push(spec.clients[0].clone());
        assert!(spec.validate().is_err());
    }
}
