//! Authorities that turn approved requests into certificates

use async_trait::async_trait;

pub mod local;

#[async_trait]
pub trait Signer: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Issues a certificate for a PEM-encoded PKCS#10 request, returning the PEM-encoded certificate
    async fn sign(&self, request: &[u8]) -> Result<Vec<u8>, Self::Error>;
}
