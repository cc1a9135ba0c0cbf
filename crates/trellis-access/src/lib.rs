//! Authentication and authorization primitives for gateway connections.
//!
//! Covers the handshake credential modes (`none`, `token`, `password`,
//! `trusted-proxy`, `network-identity`, `device-token`), scope-based method
//! authorization, the rotating device-token nonce window, and the timing-safe
//! comparisons the connection manager relies on. Denials never describe which
//! part of a credential failed; the reason code stays server-side.

mod credentials;
mod nonce;
mod scopes;

pub use credentials::{
    verify_connect_credential, AccessDenied, AccessPolicy, AuthGrant, ConnectCredential,
    TrustedProxyPolicy,
};
pub use nonce::{sign_device_nonce, DeviceNonceWindow, DEVICE_NONCE_ROTATION_MS_DEFAULT};
pub use scopes::{Scope, ScopeSet};

/// Constant-time byte comparison; runtime depends only on input lengths.
pub(crate) fn timing_safe_eq(left: &[u8], right: &[u8]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    let mut diff = 0u8;
    for (a, b) in left.iter().zip(right.iter()) {
        diff |= a ^ b;
    }
    diff == 0
}
