//! Per-remote credentials and custom login flows.

use crate::transport::HttpClientFactory;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

/// Query parameter that selects the Persona authorizer.
pub const PERSONA_QUERY_PARAMETER: &str = "persona";
/// Query parameter that selects the Facebook authorizer.
pub const FACEBOOK_QUERY_PARAMETER: &str = "facebookAccessToken";
/// Companion query parameter carrying the account email.
pub const EMAIL_QUERY_PARAMETER: &str = "email";

/// Capability contract for injecting credentials into a replication.
///
/// Authorizers are long-lived, thread-safe, and may be shared across
/// replications.
pub trait Authorizer: Send + Sync {
    /// Whether login happens by POSTing credentials and replaying the
    /// session cookie (as opposed to per-request headers).
    fn uses_cookie_based_login(&self) -> bool;

    /// Form parameters for the login POST, or `None` to skip login.
    fn login_parameters_for_site(&self, site: &Url) -> Option<HashMap<String, String>>;

    /// The path to POST the login parameters to.
    fn login_path_for_site(&self, site: &Url) -> String;

    /// Optional custom transport (e.g. mTLS) for this remote.
    fn http_client_factory(&self) -> Option<Arc<dyn HttpClientFactory>> {
        None
    }
}

/// Per-manager registry of access tokens and identity assertions, keyed by
/// `(email, origin)`. Instance state, so tokens never leak across manager
/// instances.
#[derive(Debug, Default)]
pub struct TokenRegistry {
    access_tokens: Mutex<HashMap<(String, String), String>>,
    assertions: Mutex<HashMap<(String, String), String>>,
}

impl TokenRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a Facebook access token for an account at an origin.
    pub fn register_access_token(&self, token: &str, email: &str, origin: &str) {
        debug!(email, origin, "registering access token");
        self.access_tokens
            .lock()
            .insert((email.to_string(), origin.to_lowercase()), token.to_string());
    }

    /// Looks up the access token for an account at a site.
    #[must_use]
    pub fn access_token_for(&self, email: &str, site: &Url) -> Option<String> {
        let origin = site_origin(site);
        self.access_tokens
            .lock()
            .get(&(email.to_string(), origin))
            .cloned()
    }

    /// Stores a Persona assertion, extracting the email from its payload.
    /// Returns the email on success.
    pub fn register_assertion(&self, assertion: &str, origin: &str) -> Option<String> {
        let email = assertion_email(assertion)?;
        self.assertions.lock().insert(
            (email.clone(), origin.to_lowercase()),
            assertion.to_string(),
        );
        Some(email)
    }

    /// Looks up the assertion for an account at a site.
    #[must_use]
    pub fn assertion_for(&self, email: &str, site: &Url) -> Option<String> {
        let origin = site_origin(site);
        self.assertions
            .lock()
            .get(&(email.to_string(), origin))
            .cloned()
    }
}

fn site_origin(site: &Url) -> String {
    let mut origin = site.to_string().to_lowercase();
    if origin.ends_with('/') {
        origin.pop();
    }
    origin
}

/// Pulls the `email` claim out of a Persona assertion (a JWT-shaped token).
fn assertion_email(assertion: &str) -> Option<String> {
    for segment in assertion.split('.') {
        let Ok(decoded) = BASE64.decode(segment) else {
            continue;
        };
        let Ok(payload) = serde_json::from_slice::<Value>(&decoded) else {
            continue;
        };
        if let Some(email) = payload
            .get("principal")
            .and_then(|p| p.get("email"))
            .and_then(Value::as_str)
        {
            return Some(email.to_string());
        }
        if let Some(email) = payload.get("email").and_then(Value::as_str) {
            return Some(email.to_string());
        }
    }
    warn!("assertion carries no email claim");
    None
}

/// Cookie-based login with a Facebook access token.
pub struct FacebookAuthorizer {
    email: String,
    registry: Arc<TokenRegistry>,
}

impl FacebookAuthorizer {
    /// An authorizer for `email`, reading tokens from `registry`.
    #[must_use]
    pub fn new(email: impl Into<String>, registry: Arc<TokenRegistry>) -> Self {
        Self {
            email: email.into(),
            registry,
        }
    }

    /// The account email.
    #[must_use]
    pub fn email(&self) -> &str {
        &self.email
    }
}

impl Authorizer for FacebookAuthorizer {
    fn uses_cookie_based_login(&self) -> bool {
        true
    }

    fn login_parameters_for_site(&self, site: &Url) -> Option<HashMap<String, String>> {
        let token = self.registry.access_token_for(&self.email, site)?;
        let mut params = HashMap::new();
        params.insert("access_token".to_string(), token);
        Some(params)
    }

    fn login_path_for_site(&self, _site: &Url) -> String {
        "/_facebook".to_string()
    }
}

/// Cookie-based login with a Persona assertion.
pub struct PersonaAuthorizer {
    email: String,
    registry: Arc<TokenRegistry>,
}

impl PersonaAuthorizer {
    /// An authorizer for `email`, reading assertions from `registry`.
    #[must_use]
    pub fn new(email: impl Into<String>, registry: Arc<TokenRegistry>) -> Self {
        Self {
            email: email.into(),
            registry,
        }
    }
}

impl Authorizer for PersonaAuthorizer {
    fn uses_cookie_based_login(&self) -> bool {
        true
    }

    fn login_parameters_for_site(&self, site: &Url) -> Option<HashMap<String, String>> {
        let assertion = self.registry.assertion_for(&self.email, site)?;
        let mut params = HashMap::new();
        params.insert("assertion".to_string(), assertion);
        Some(params)
    }

    fn login_path_for_site(&self, _site: &Url) -> String {
        "/_persona_assertion".to_string()
    }
}

/// Recognises authorizer-selecting query parameters on a remote URL.
///
/// `persona=<assertion>` or `facebookAccessToken=<token>&email=<email>`
/// register the credential in `registry` and produce the matching
/// authorizer; the query string is stripped from the working URL either
/// way, since the parameters would confuse the remote endpoints.
pub fn authorizer_from_url(
    remote: &Url,
    registry: &Arc<TokenRegistry>,
) -> (Url, Option<Arc<dyn Authorizer>>) {
    if remote.query().is_none() {
        return (remote.clone(), None);
    }

    let mut stripped = remote.clone();
    stripped.set_query(None);
    let origin = site_origin(&stripped);

    let params: HashMap<String, String> = remote
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if let Some(assertion) = params.get(PERSONA_QUERY_PARAMETER) {
        if !assertion.is_empty() {
            if let Some(email) = registry.register_assertion(assertion, &origin) {
                let authorizer = PersonaAuthorizer::new(email, Arc::clone(registry));
                return (stripped, Some(Arc::new(authorizer)));
            }
        }
    }

    if let Some(token) = params.get(FACEBOOK_QUERY_PARAMETER) {
        if !token.is_empty() {
            if let Some(email) = params.get(EMAIL_QUERY_PARAMETER) {
                registry.register_access_token(token, email, &origin);
                let authorizer = FacebookAuthorizer::new(email.clone(), Arc::clone(registry));
                return (stripped, Some(Arc::new(authorizer)));
            }
        }
    }

    (stripped, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn persona_assertion(email: &str) -> String {
        let payload = BASE64.encode(format!("{{\"email\":\"{email}\"}}"));
        format!("header.{payload}.signature")
    }

    #[test]
    fn facebook_authorizer_reads_registered_token() {
        let registry = Arc::new(TokenRegistry::new());
        let site = Url::parse("https://sync.example/db").unwrap();
        registry.register_access_token("tok123", "a@example.com", "https://sync.example/db");

        let auth = FacebookAuthorizer::new("a@example.com", Arc::clone(&registry));
        assert!(auth.uses_cookie_based_login());
        let params = auth.login_parameters_for_site(&site).unwrap();
        assert_eq!(params.get("access_token"), Some(&"tok123".to_string()));
        assert_eq!(auth.login_path_for_site(&site), "/_facebook");
    }

    #[test]
    fn missing_token_skips_login() {
        let registry = Arc::new(TokenRegistry::new());
        let auth = FacebookAuthorizer::new("nobody@example.com", registry);
        let site = Url::parse("https://sync.example/db").unwrap();
        assert!(auth.login_parameters_for_site(&site).is_none());
    }

    #[test]
    fn tokens_are_per_registry() {
        let first = Arc::new(TokenRegistry::new());
        let second = Arc::new(TokenRegistry::new());
        first.register_access_token("tok", "a@example.com", "https://sync.example/db");

        let site = Url::parse("https://sync.example/db").unwrap();
        assert!(first.access_token_for("a@example.com", &site).is_some());
        assert!(second.access_token_for("a@example.com", &site).is_none());
    }

    #[test]
    fn assertion_email_extraction() {
        assert_eq!(
            assertion_email(&persona_assertion("p@example.com")),
            Some("p@example.com".to_string())
        );
        assert_eq!(assertion_email("not-a-jwt"), None);
    }

    #[test]
    fn url_with_persona_parameter_installs_authorizer() {
        let registry = Arc::new(TokenRegistry::new());
        let assertion = persona_assertion("p@example.com");
        let remote =
            Url::parse(&format!("https://sync.example/db?persona={assertion}")).unwrap();

        let (stripped, authorizer) = authorizer_from_url(&remote, &registry);
        assert_eq!(stripped.as_str(), "https://sync.example/db");
        let authorizer = authorizer.unwrap();
        let params = authorizer.login_parameters_for_site(&stripped).unwrap();
        assert_eq!(params.get("assertion"), Some(&assertion));
    }

    #[test]
    fn url_with_facebook_parameters_installs_authorizer() {
        let registry = Arc::new(TokenRegistry::new());
        let remote = Url::parse(
            "https://sync.example/db?facebookAccessToken=tok99&email=f@example.com",
        )
        .unwrap();

        let (stripped, authorizer) = authorizer_from_url(&remote, &registry);
        assert_eq!(stripped.as_str(), "https://sync.example/db");
        let authorizer = authorizer.unwrap();
        let params = authorizer.login_parameters_for_site(&stripped).unwrap();
        assert_eq!(params.get("access_token"), Some(&"tok99".to_string()));
    }

    #[test]
    fn plain_url_is_untouched() {
        let registry = Arc::new(TokenRegistry::new());
        let remote = Url::parse("https://sync.example/db").unwrap();
        let (stripped, authorizer) = authorizer_from_url(&remote, &registry);
        assert_eq!(stripped, remote);
        assert!(authorizer.is_none());
    }
}
