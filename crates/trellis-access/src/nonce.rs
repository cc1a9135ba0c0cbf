//! Rotating nonce window for device-token handshakes.
//!
//! The server issues the current nonce in its connect challenge; a device
//! token carries an ed25519 signature over that nonce. Nonces rotate on a
//! fixed window (~10 minutes) and the previous window is still accepted so a
//! handshake racing a rotation does not fail spuriously.

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

pub const DEVICE_NONCE_ROTATION_MS_DEFAULT: u64 = 600_000;

/// Derives deterministic nonces from a boot-time seed and the rotation window.
#[derive(Debug, Clone)]
pub struct DeviceNonceWindow {
    seed: [u8; 32],
    rotation_ms: u64,
}

impl DeviceNonceWindow {
    pub fn new(seed: [u8; 32], rotation_ms: u64) -> Self {
        Self {
            seed,
            rotation_ms: rotation_ms.max(1),
        }
    }

    /// Current nonce for the window containing `now_unix_ms`.
    pub fn current(&self, now_unix_ms: u64) -> String {
        self.nonce_for_window(now_unix_ms / self.rotation_ms)
    }

    /// Whether `nonce` matches the current or immediately previous window.
    pub fn accepts(&self, nonce: &str, now_unix_ms: u64) -> bool {
        let window = now_unix_ms / self.rotation_ms;
        if crate::timing_safe_eq(nonce.as_bytes(), self.nonce_for_window(window).as_bytes()) {
            return true;
        }
        window > 0
            && crate::timing_safe_eq(
                nonce.as_bytes(),
                self.nonce_for_window(window - 1).as_bytes(),
            )
    }

    fn nonce_for_window(&self, window: u64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.seed);
        hasher.update(window.to_be_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Canonical bytes a device token signs: the nonce bound to the device id.
pub fn device_nonce_message_bytes(device_id: &str, nonce: &str) -> Vec<u8> {
    format!("v1\ndevice_id={}\nnonce={}", device_id.trim(), nonce.trim()).into_bytes()
}

/// Signs a device nonce; used by clients and handshake tests.
pub fn sign_device_nonce(signing_key: &SigningKey, device_id: &str, nonce: &str) -> String {
    let signature = signing_key.sign(&device_nonce_message_bytes(device_id, nonce));
    BASE64.encode(signature.to_bytes())
}

pub(crate) fn verify_device_nonce_signature(
    device_id: &str,
    nonce: &str,
    signature_base64: &str,
    public_key_base64: &str,
) -> Result<()> {
    let signature_bytes = decode_base64_fixed::<64>("signature", signature_base64)?;
    let public_key_bytes = decode_base64_fixed::<32>("public key", public_key_base64)?;
    let verifying_key = VerifyingKey::from_bytes(&public_key_bytes)
        .context("failed to decode ed25519 public key bytes")?;
    let signature = Signature::from_bytes(&signature_bytes);
    verifying_key
        .verify(&device_nonce_message_bytes(device_id, nonce), &signature)
        .map_err(|error| anyhow!("invalid ed25519 signature: {error}"))?;
    Ok(())
}

fn decode_base64_fixed<const N: usize>(label: &str, raw: &str) -> Result<[u8; N]> {
    let decoded = BASE64
        .decode(raw.trim())
        .with_context(|| format!("failed to decode base64 {label}"))?;
    let decoded_len = decoded.len();
    decoded
        .try_into()
        .map_err(|_| anyhow!("{label} decoded to {decoded_len} bytes (expected {N})"))
}
