//! Credential decryption seam.
//!
//! Connection passwords stored in datasource definitions pass through
//! [`Secrets::decrypt`] before use. The default implementation is a
//! pass-through; deployments with encrypted credentials inject their own.

use crate::error::Result;

pub trait Secrets: Send + Sync {
    fn decrypt(&self, ciphertext: &str) -> Result<String>;
}

/// Pass-through secrets provider for plaintext credentials.
#[derive(Debug, Default)]
pub struct PlainSecrets;

impl Secrets for PlainSecrets {
    fn decrypt(&self, ciphertext: &str) -> Result<String> {
        Ok(ciphertext.to_string())
    }
}
