//! Webhook delivery routing and HMAC-SHA256 verification.
//!
//! Provides:
//! - `verify_hmac_sha256()`: signature check over the raw request body
//! - `verify_delivery()`: applies an organization's webhook secret, if any
//! - `WebhookRegistry`: DashMap-backed path -> workflow lookup, rebuilt from
//!   saved definitions

use std::sync::Arc;

use dashmap::DashMap;
use hmac::{Hmac, Mac};
use orbin_types::workflow::{TriggerSpec, WorkflowDefinition, WorkflowStatus};
use sha2::Sha256;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the delivery signature, `sha256=<hex>` or plain hex.
pub const SIGNATURE_HEADER: &str = "x-orbin-signature";

/// Header carrying the sender's delivery id, used as the idempotency key.
pub const DELIVERY_ID_HEADER: &str = "x-orbin-delivery";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("HMAC signature verification failed")]
    HmacVerificationFailed,

    #[error("no webhook registered at path: {0}")]
    PathNotFound(String),

    #[error("invalid HMAC key: {0}")]
    InvalidKey(String),

    #[error("missing signature: {SIGNATURE_HEADER} header required")]
    MissingSignature,
}

// ---------------------------------------------------------------------------
// HMAC-SHA256 verification
// ---------------------------------------------------------------------------

/// Verify a hex-encoded HMAC-SHA256 signature against a request body.
///
/// The comparison is constant-time (`Mac::verify_slice`).
pub fn verify_hmac_sha256(secret: &[u8], body: &[u8], signature_hex: &str) -> Result<(), WebhookError> {
    let expected = hex_decode(signature_hex).ok_or(WebhookError::HmacVerificationFailed)?;

    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|e| WebhookError::InvalidKey(e.to_string()))?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| WebhookError::HmacVerificationFailed)
}

/// Like [`verify_hmac_sha256`], accepting an optional `sha256=` prefix.
pub fn verify_hmac_sha256_with_prefix(
    secret: &[u8],
    body: &[u8],
    signature: &str,
) -> Result<(), WebhookError> {
    let hex_sig = signature.strip_prefix("sha256=").unwrap_or(signature);
    verify_hmac_sha256(secret, body, hex_sig)
}

/// Check a delivery against the organization's webhook secret.
///
/// Organizations without a secret accept unsigned deliveries.
pub fn verify_delivery(
    secret: Option<&str>,
    body: &[u8],
    signature: Option<&str>,
) -> Result<(), WebhookError> {
    let Some(secret) = secret else {
        return Ok(());
    };
    let signature = signature.ok_or(WebhookError::MissingSignature)?;
    verify_hmac_sha256_with_prefix(secret.as_bytes(), body, signature)
}

/// Hex-encoded HMAC-SHA256 of `body`.
pub fn compute_hmac_sha256_hex(secret: &[u8], body: &[u8]) -> Result<String, WebhookError> {
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|e| WebhookError::InvalidKey(e.to_string()))?;
    mac.update(body);
    Ok(hex_encode(&mac.finalize().into_bytes()))
}

/// Value for [`SIGNATURE_HEADER`] when sending a signed delivery.
pub fn signature_header(secret: &str, body: &[u8]) -> Result<String, WebhookError> {
    Ok(format!("sha256={}", compute_hmac_sha256_hex(secret.as_bytes(), body)?))
}

// ---------------------------------------------------------------------------
// WebhookRegistry
// ---------------------------------------------------------------------------

/// Workflow a webhook path starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookRoute {
    pub organization_id: Uuid,
    pub workflow_id: Uuid,
    /// For logging.
    pub workflow_name: String,
}

/// Thread-safe map of normalized webhook paths to workflows.
#[derive(Clone)]
pub struct WebhookRegistry {
    routes: Arc<DashMap<String, WebhookRoute>>,
}

impl WebhookRegistry {
    pub fn new() -> Self {
        Self {
            routes: Arc::new(DashMap::new()),
        }
    }

    /// Register a route. An existing route at the same path is replaced.
    pub fn register(&self, path: &str, route: WebhookRoute) {
        let normalized = normalize_path(path);
        if let Some(previous) = self.routes.get(&normalized) {
            if previous.workflow_id != route.workflow_id {
                tracing::warn!(
                    path = %normalized,
                    previous = %previous.workflow_id,
                    workflow_id = %route.workflow_id,
                    "webhook path reassigned"
                );
            }
        }
        tracing::debug!(path = %normalized, workflow_id = %route.workflow_id, "registered webhook");
        self.routes.insert(normalized, route);
    }

    pub fn unregister(&self, path: &str) -> Option<WebhookRoute> {
        self.routes.remove(&normalize_path(path)).map(|(_, v)| v)
    }

    pub fn lookup(&self, path: &str) -> Result<WebhookRoute, WebhookError> {
        let normalized = normalize_path(path);
        self.routes
            .get(&normalized)
            .map(|r| r.value().clone())
            .ok_or(WebhookError::PathNotFound(normalized))
    }

    /// Rebuild the registry from definitions: every active webhook-triggered
    /// workflow gets its path, everything else is dropped. Returns the number
    /// of registered paths.
    pub fn sync(&self, defs: &[WorkflowDefinition]) -> usize {
        self.routes.clear();
        for def in defs {
            if let Some(path) = webhook_path(def) {
                self.register(
                    path,
                    WebhookRoute {
                        organization_id: def.organization_id,
                        workflow_id: def.id,
                        workflow_name: def.name.clone(),
                    },
                );
            }
        }
        self.routes.len()
    }

    /// Update the registry after a single definition was saved.
    pub fn refresh(&self, def: &WorkflowDefinition) {
        self.routes.retain(|_, route| route.workflow_id != def.id);
        if let Some(path) = webhook_path(def) {
            self.register(
                path,
                WebhookRoute {
                    organization_id: def.organization_id,
                    workflow_id: def.id,
                    workflow_name: def.name.clone(),
                },
            );
        }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Registered paths, sorted.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.routes.iter().map(|r| r.key().clone()).collect();
        paths.sort();
        paths
    }
}

impl Default for WebhookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn webhook_path(def: &WorkflowDefinition) -> Option<&str> {
    match (&def.status, &def.trigger) {
        (WorkflowStatus::Active, TriggerSpec::Webhook { path }) => Some(path.as_str()),
        _ => None,
    }
}

/// Leading `/`, no trailing `/` (except the root).
fn normalize_path(path: &str) -> String {
    let mut normalized = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    if normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}

fn hex_decode(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 || !hex.is_ascii() {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use orbin_types::workflow::{StepConfig, StepSpec};

    fn definition(path: &str, status: WorkflowStatus) -> WorkflowDefinition {
        WorkflowDefinition {
            id: Uuid::now_v7(),
            organization_id: Uuid::now_v7(),
            name: format!("wf-{path}"),
            description: None,
            status,
            version: 1,
            trigger: TriggerSpec::Webhook {
                path: path.to_string(),
            },
            steps: vec![StepSpec {
                id: "a".to_string(),
                name: "a".to_string(),
                config: StepConfig::Action {
                    handler: "echo".to_string(),
                    params: serde_json::Value::Null,
                },
                retry_policy: None,
                continue_on_failure: false,
                timeout_ms: None,
            }],
            retry_policy: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn route(workflow_id: Uuid) -> WebhookRoute {
        WebhookRoute {
            organization_id: Uuid::now_v7(),
            workflow_id,
            workflow_name: "test-wf".to_string(),
        }
    }

    // -------------------------------------------------------------------
    // HMAC-SHA256
    // -------------------------------------------------------------------

    #[test]
    fn test_verify_hmac_sha256_valid() {
        let secret = b"whsec_orders";
        let body = br#"{"order":7}"#;
        let sig = compute_hmac_sha256_hex(secret, body).unwrap();
        assert!(verify_hmac_sha256(secret, body, &sig).is_ok());
    }

    #[test]
    fn test_verify_hmac_sha256_rejects_tampering() {
        let secret = b"whsec_orders";
        let sig = compute_hmac_sha256_hex(secret, b"original").unwrap();

        assert!(verify_hmac_sha256(secret, b"tampered", &sig).is_err());
        assert!(verify_hmac_sha256(b"other-secret", b"original", &sig).is_err());
    }

    #[test]
    fn test_verify_hmac_sha256_invalid_hex() {
        assert!(verify_hmac_sha256(b"k", b"body", "not-hex").is_err());
        assert!(verify_hmac_sha256(b"k", b"body", "zz").is_err());
        assert!(verify_hmac_sha256(b"k", b"body", "0").is_err());
    }

    // RFC 4231 test case 2
    #[test]
    fn test_hmac_sha256_rfc4231_vector() {
        let expected = "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843";
        let computed = compute_hmac_sha256_hex(b"Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(computed, expected);
    }

    #[test]
    fn test_verify_with_prefix() {
        let body = b"payload";
        let header = signature_header("s3cret", body).unwrap();
        assert!(header.starts_with("sha256="));
        assert!(verify_hmac_sha256_with_prefix(b"s3cret", body, &header).is_ok());
        assert!(verify_hmac_sha256_with_prefix(b"s3cret", body, &header["sha256=".len()..]).is_ok());
    }

    // -------------------------------------------------------------------
    // verify_delivery
    // -------------------------------------------------------------------

    #[test]
    fn test_delivery_without_secret_is_accepted() {
        assert!(verify_delivery(None, b"anything", None).is_ok());
        assert!(verify_delivery(None, b"anything", Some("sha256=junk")).is_ok());
    }

    #[test]
    fn test_delivery_with_secret_requires_signature() {
        let body = b"{}";
        assert!(matches!(
            verify_delivery(Some("s3cret"), body, None),
            Err(WebhookError::MissingSignature)
        ));
        assert!(matches!(
            verify_delivery(Some("s3cret"), body, Some("sha256=00")),
            Err(WebhookError::HmacVerificationFailed)
        ));

        let header = signature_header("s3cret", body).unwrap();
        assert!(verify_delivery(Some("s3cret"), body, Some(&header)).is_ok());
    }

    // -------------------------------------------------------------------
    // WebhookRegistry
    // -------------------------------------------------------------------

    #[test]
    fn test_registry_register_lookup_unregister() {
        let registry = WebhookRegistry::new();
        let wf = Uuid::now_v7();
        registry.register("orders/", route(wf));

        assert_eq!(registry.lookup("/orders").unwrap().workflow_id, wf);
        assert!(registry.unregister("/orders").is_some());
        assert!(matches!(
            registry.lookup("/orders"),
            Err(WebhookError::PathNotFound(p)) if p == "/orders"
        ));
    }

    #[test]
    fn test_registry_sync_only_active_webhooks() {
        let registry = WebhookRegistry::new();
        registry.register("/stale", route(Uuid::now_v7()));

        let active = definition("orders", WorkflowStatus::Active);
        let paused = definition("refunds", WorkflowStatus::Paused);
        let mut manual = definition("manual", WorkflowStatus::Active);
        manual.trigger = TriggerSpec::Manual {};

        assert_eq!(registry.sync(&[active.clone(), paused, manual]), 1);
        assert_eq!(registry.paths(), vec!["/orders".to_string()]);
        let found = registry.lookup("/orders").unwrap();
        assert_eq!(found.workflow_id, active.id);
        assert_eq!(found.organization_id, active.organization_id);
    }

    #[test]
    fn test_registry_refresh_moves_path() {
        let registry = WebhookRegistry::new();
        let mut def = definition("orders", WorkflowStatus::Active);
        registry.refresh(&def);

        def.trigger = TriggerSpec::Webhook {
            path: "orders-v2".to_string(),
        };
        registry.refresh(&def);
        assert_eq!(registry.paths(), vec!["/orders-v2".to_string()]);

        def.status = WorkflowStatus::Paused;
        registry.refresh(&def);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("trigger/test"), "/trigger/test");
        assert_eq!(normalize_path("/trigger/test/"), "/trigger/test");
        assert_eq!(normalize_path("/"), "/");
    }
}
