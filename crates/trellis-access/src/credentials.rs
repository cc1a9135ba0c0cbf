//! Handshake credential verification for the connection manager.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::nonce::{verify_device_nonce_signature, DeviceNonceWindow};
use crate::scopes::ScopeSet;
use crate::timing_safe_eq;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "kebab-case")]
/// Credential material presented in a `connect` request.
pub enum ConnectCredential {
    None,
    Token {
        token: String,
    },
    Password {
        password: String,
    },
    TrustedProxy {
        identity: String,
    },
    NetworkIdentity {
        network: String,
    },
    DeviceToken {
        device_id: String,
        nonce: String,
        signature: String,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
/// Trusted-proxy acceptance list; identities arrive via the proxy's header.
pub struct TrustedProxyPolicy {
    pub allowed_identities: Vec<String>,
    pub scopes: ScopeSet,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
/// Server-side policy the handshake verifies credentials against.
pub struct AccessPolicy {
    #[serde(default)]
    pub allow_unauthenticated: bool,
    #[serde(default)]
    pub unauthenticated_scopes: ScopeSet,
    #[serde(default)]
    pub shared_token: Option<String>,
    #[serde(default)]
    pub token_scopes: ScopeSet,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub password_scopes: ScopeSet,
    #[serde(default)]
    pub trusted_proxy: Option<TrustedProxyPolicy>,
    #[serde(default)]
    pub attested_networks: Vec<String>,
    #[serde(default)]
    pub network_scopes: ScopeSet,
    /// Paired device id -> base64 ed25519 public key.
    #[serde(default)]
    pub paired_devices: BTreeMap<String, String>,
    #[serde(default)]
    pub device_scopes: ScopeSet,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Successful handshake outcome: who connected and what they may do.
pub struct AuthGrant {
    pub identity: String,
    pub scopes: ScopeSet,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("access denied")]
/// Opaque denial. Which check failed is logged server-side, never returned.
pub struct AccessDenied;

/// Verifies a handshake credential against policy.
///
/// Every failure path converges on the same opaque [`AccessDenied`] value;
/// secret comparisons are timing-safe.
pub fn verify_connect_credential(
    policy: &AccessPolicy,
    credential: &ConnectCredential,
    nonce_window: &DeviceNonceWindow,
    now_unix_ms: u64,
) -> Result<AuthGrant, AccessDenied> {
    match credential {
        ConnectCredential::None => {
            if policy.allow_unauthenticated {
                Ok(AuthGrant {
                    identity: "anonymous".to_string(),
                    scopes: policy.unauthenticated_scopes.clone(),
                })
            } else {
                deny("unauthenticated_connect_disabled")
            }
        }
        ConnectCredential::Token { token } => match policy.shared_token.as_deref() {
            Some(expected) if timing_safe_eq(expected.as_bytes(), token.trim().as_bytes()) => {
                Ok(AuthGrant {
                    identity: "token".to_string(),
                    scopes: policy.token_scopes.clone(),
                })
            }
            Some(_) => deny("token_mismatch"),
            None => deny("token_auth_disabled"),
        },
        ConnectCredential::Password { password } => match policy.password.as_deref() {
            Some(expected) if timing_safe_eq(expected.as_bytes(), password.as_bytes()) => {
                Ok(AuthGrant {
                    identity: "password".to_string(),
                    scopes: policy.password_scopes.clone(),
                })
            }
            Some(_) => deny("password_mismatch"),
            None => deny("password_auth_disabled"),
        },
        ConnectCredential::TrustedProxy { identity } => {
            let Some(proxy) = policy.trusted_proxy.as_ref() else {
                return deny("trusted_proxy_disabled");
            };
            let identity = identity.trim();
            if identity.is_empty() {
                return deny("trusted_proxy_identity_empty");
            }
            if proxy
                .allowed_identities
                .iter()
                .any(|allowed| allowed.trim() == identity)
            {
                Ok(AuthGrant {
                    identity: identity.to_string(),
                    scopes: proxy.scopes.clone(),
                })
            } else {
                deny("trusted_proxy_identity_unknown")
            }
        }
        ConnectCredential::NetworkIdentity { network } => {
            let network = network.trim();
            if policy
                .attested_networks
                .iter()
                .any(|allowed| allowed.trim() == network && !network.is_empty())
            {
                Ok(AuthGrant {
                    identity: format!("network:{network}"),
                    scopes: policy.network_scopes.clone(),
                })
            } else {
                deny("network_identity_unknown")
            }
        }
        ConnectCredential::DeviceToken {
            device_id,
            nonce,
            signature,
        } => {
            let device_id = device_id.trim();
            let Some(public_key) = policy.paired_devices.get(device_id) else {
                return deny("device_unknown");
            };
            if !nonce_window.accepts(nonce.trim(), now_unix_ms) {
                return deny("device_nonce_expired");
            }
            if verify_device_nonce_signature(device_id, nonce, signature, public_key).is_err() {
                return deny("device_signature_invalid");
            }
            Ok(AuthGrant {
                identity: format!("device:{device_id}"),
                scopes: policy.device_scopes.clone(),
            })
        }
    }
}

fn deny(reason_code: &str) -> Result<AuthGrant, AccessDenied> {
    warn!(reason_code, "handshake credential rejected");
    Err(AccessDenied)
}
