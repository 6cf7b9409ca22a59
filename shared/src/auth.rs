//! Credential store and call authentication.
//!
//! Two interchangeable validation strategies gate every call: HMAC-SHA256
//! signed tokens carrying a `service_name` claim, or opaque API keys resolved
//! through a mutable key -> service map. Tokens are long-lived by contract;
//! no expiry claim is issued and none is enforced.

use std::collections::HashMap;

use http::HeaderMap;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use courier_config::{AuthConfig, AuthMethod, generate_signing_secret};
use courier_error::{BrokerError, BrokerResult};

use crate::utils::SecureString;

/// Identity bound to calls when authentication is disabled.
pub const ANONYMOUS_SERVICE: &str = "anonymous";

/// Method path suffix exempt from authentication (health checks).
pub const PING_METHOD_SUFFIX: &str = "/Ping";

const AUTHORIZATION_HEADER: &str = "authorization";
const API_KEY_HEADER: &str = "x-api-key";
const BEARER_PREFIX: &str = "Bearer ";
const TOKEN_ISSUER: &str = "courier-broker";

/// Token claims. `service_name` is the authenticated identity.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub service_name: String,
    pub iat: i64,
    pub iss: String,
    pub sub: String,
}

/// Holds the signing secret and the opaque key -> service map.
///
/// Key mutation happens through admin operations concurrent with request
/// validation, so the map sits behind a lock.
pub struct CredentialStore {
    secret: SecureString,
    keys: RwLock<HashMap<String, String>>,
}

impl CredentialStore {
    pub fn new(secret: SecureString, keys: HashMap<String, String>) -> Self {
        Self {
            secret,
            keys: RwLock::new(keys),
        }
    }

    pub fn secret(&self) -> &SecureString {
        &self.secret
    }

    /// Mint a fresh API key for `service_name` and register it.
    pub fn generate_api_key(&self, service_name: &str) -> String {
        let key = generate_signing_secret();
        self.keys
            .write()
            .insert(key.clone(), service_name.to_string());
        key
    }

    /// Remove an API key. Returns whether it existed.
    pub fn revoke_api_key(&self, key: &str) -> bool {
        self.keys.write().remove(key).is_some()
    }

    /// Resolve an API key to its service name.
    pub fn resolve_api_key(&self, key: &str) -> Option<String> {
        self.keys.read().get(key).cloned()
    }

    pub fn key_count(&self) -> usize {
        self.keys.read().len()
    }
}

/// Validates request credentials and issues tokens/keys for provisioning.
pub struct AuthManager {
    enabled: bool,
    method: AuthMethod,
    store: CredentialStore,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl AuthManager {
    pub fn new(config: &AuthConfig) -> Self {
        let secret = if config.signing_secret.is_empty() {
            tracing::info!("no signing secret configured, generating one");
            generate_signing_secret()
        } else {
            config.signing_secret.clone()
        };

        let encoding_key = EncodingKey::from_secret(secret.as_bytes());
        let decoding_key = DecodingKey::from_secret(secret.as_bytes());

        Self {
            enabled: config.enabled,
            method: config.method,
            store: CredentialStore::new(SecureString::new(secret), config.api_keys.clone()),
            encoding_key,
            decoding_key,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.store
    }

    /// Issue a signed token for `service_name`.
    ///
    /// Tokens are deliberately long-lived: no `exp` claim is present, and
    /// verification never checks one.
    pub fn issue_token(&self, service_name: &str) -> BrokerResult<String> {
        let claims = Claims {
            service_name: service_name.to_string(),
            iat: chrono::Utc::now().timestamp(),
            iss: TOKEN_ISSUER.to_string(),
            sub: service_name.to_string(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?;
        Ok(token)
    }

    /// Verify a signed token and return the `service_name` claim.
    ///
    /// Only HMAC-SHA256 is accepted; a token claiming any other algorithm
    /// (including `none`) fails signature validation outright.
    pub fn verify_token(&self, token: &str) -> BrokerResult<String> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.required_spec_claims.clear();

        let data = decode::<Claims>(token, &self.decoding_key, &validation)?;
        if data.claims.service_name.is_empty() {
            return Err(BrokerError::auth("token has no service_name claim"));
        }
        Ok(data.claims.service_name)
    }

    /// Validate one call: returns the service identity to bind, or the
    /// rejection reason.
    ///
    /// Policy: disabled auth yields the synthetic `anonymous` identity, the
    /// Ping method is always exempt, and otherwise the configured strategy
    /// decides.
    pub fn validate(&self, method_path: &str, headers: &HeaderMap) -> BrokerResult<String> {
        if !self.enabled {
            return Ok(ANONYMOUS_SERVICE.to_string());
        }
        if method_path.ends_with(PING_METHOD_SUFFIX) {
            return Ok(ANONYMOUS_SERVICE.to_string());
        }

        match self.method {
            AuthMethod::SignedToken => self.authenticate_bearer(headers),
            AuthMethod::OpaqueKey => self.authenticate_api_key(headers),
        }
    }

    fn authenticate_bearer(&self, headers: &HeaderMap) -> BrokerResult<String> {
        let value = headers
            .get(AUTHORIZATION_HEADER)
            .ok_or_else(|| BrokerError::auth("missing authorization header"))?
            .to_str()
            .map_err(|_| BrokerError::auth("malformed authorization header"))?;

        let token = value
            .strip_prefix(BEARER_PREFIX)
            .ok_or_else(|| BrokerError::auth("invalid authorization format"))?;

        self.verify_token(token)
            .map_err(|_| BrokerError::auth("invalid token"))
    }

    fn authenticate_api_key(&self, headers: &HeaderMap) -> BrokerResult<String> {
        let key = headers
            .get(API_KEY_HEADER)
            .ok_or_else(|| BrokerError::auth("missing API key"))?
            .to_str()
            .map_err(|_| BrokerError::auth("malformed API key"))?;

        self.store
            .resolve_api_key(key)
            .ok_or_else(|| BrokerError::auth("invalid API key"))
    }
}
