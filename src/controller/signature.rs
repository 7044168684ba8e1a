//! Artifact signature verification
//!
//! A release may carry a PEM-encoded ECDSA P-256 public key and a base64
//! signature over its image reference. Verification fails closed: a key without
//! a signature, a malformed key or signature, or a signature that does not
//! match the image all reject the release.

use async_trait::async_trait;
use base64::Engine;
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, VerifyingKey};
use p256::pkcs8::DecodePublicKey;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SignatureError {
    #[error("signature required but none provided")]
    Missing,

    #[error("public key required to verify signature")]
    MissingPublicKey,

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid signature encoding: {0}")]
    InvalidEncoding(String),

    #[error("signature does not match image {0}")]
    Mismatch(String),
}

/// Verifies that an artifact reference was signed by a trusted key
#[async_trait]
pub trait ArtifactVerifier: Send + Sync {
    async fn verify(
        &self,
        image: &str,
        public_key: Option<&str>,
        signature: Option<&str>,
    ) -> Result<(), SignatureError>;
}

/// Keyed ECDSA P-256 (SHA-256) verification
pub struct EcdsaP256Verifier {
    /// Reject unsigned releases instead of letting them through
    require_signature: bool,
}

impl EcdsaP256Verifier {
    pub fn new(require_signature: bool) -> Self {
        Self { require_signature }
    }
}

#[async_trait]
impl ArtifactVerifier for EcdsaP256Verifier {
    async fn verify(
        &self,
        image: &str,
        public_key: Option<&str>,
        signature: Option<&str>,
    ) -> Result<(), SignatureError> {
        match (public_key, signature) {
            (None, None) if !self.require_signature => Ok(()),
            (None, None) | (Some(_), None) => Err(SignatureError::Missing),
            (None, Some(_)) => Err(SignatureError::MissingPublicKey),
            (Some(pem), Some(sig)) => verify_p256(image, pem, sig),
        }
    }
}

fn verify_p256(image: &str, pem: &str, signature_b64: &str) -> Result<(), SignatureError> {
    let key = VerifyingKey::from_public_key_pem(pem.trim())
        .map_err(|e| SignatureError::InvalidPublicKey(e.to_string()))?;

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(signature_b64.trim())
        .map_err(|e| SignatureError::InvalidEncoding(e.to_string()))?;

    // DER is what signing tools emit; raw r||s is accepted as well
    let signature = Signature::from_der(&bytes)
        .or_else(|_| Signature::from_slice(&bytes))
        .map_err(|e| SignatureError::InvalidEncoding(e.to_string()))?;

    key.verify(image.as_bytes(), &signature)
        .map_err(|_| SignatureError::Mismatch(image.to_string()))
}
