//! Per-job ownership checks on top of mTLS.
//!
//! The transport already guarantees every caller presented a certificate
//! signed by the CA; this layer additionally pins each job to the exact
//! client that started it. Identity is the leaf certificate's DER bytes:
//! nothing here parses X.509, so messages show a short fingerprint rather
//! than a subject name.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tonic::{Request, Status};

/// Raw DER of a client's leaf certificate.
pub type ClientIdentity = Vec<u8>;

#[derive(Default)]
pub struct AuthHandler {
    owners: RwLock<HashMap<String, ClientIdentity>>,
}

impl AuthHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extract the caller's identity from the request's peer certificates.
    pub fn client_identity<T>(request: &Request<T>) -> Result<ClientIdentity, Status> {
        let certs = request
            .peer_certs()
            .ok_or_else(|| Status::permission_denied("no client certificate presented"))?;
        let leaf = certs
            .first()
            .ok_or_else(|| Status::permission_denied("empty client certificate chain"))?;
        Ok(leaf.as_ref().to_vec())
    }

    /// Record the client that started a job as its owner.
    pub async fn register_owner(&self, job_id: &str, owner: ClientIdentity) {
        self.owners.write().await.insert(job_id.to_string(), owner);
    }

    /// Verify the caller owns `job_id`. Unknown jobs are denied the same way
    /// as foreign ones, so probing reveals nothing about other clients.
    pub async fn check_owner<T>(&self, request: &Request<T>, job_id: &str) -> Result<(), Status> {
        let identity = Self::client_identity(request)?;
        if self.owns(job_id, &identity).await {
            Ok(())
        } else {
            Err(Status::permission_denied(format!(
                "client {} cannot access job {job_id}",
                fingerprint(&identity)
            )))
        }
    }

    async fn owns(&self, job_id: &str, identity: &[u8]) -> bool {
        self.owners
            .read()
            .await
            .get(job_id)
            .is_some_and(|owner| owner == identity)
    }
}

/// Short display form of a client identity for logs and error messages.
pub fn fingerprint(identity: &[u8]) -> String {
    use std::hash::{DefaultHasher, Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    identity.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
