//! Actor signing keys
//!
//! Generates RSA key pairs for local actors and guarantees at most one
//! active pair per actor. Keys are created at actor-creation time and are
//! immutable afterwards: silently regenerating a pair would invalidate
//! every signature remote instances have already verified against the
//! published public key.

use chrono::Utc;
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::data::{ActorKeyPair, Database};
use crate::error::AppError;

/// RSA modulus size for actor keys
const KEY_BITS: usize = 2048;

/// A freshly generated key pair, PEM-encoded for storage
#[derive(Debug, Clone)]
pub struct GeneratedKeyPair {
    /// SPKI PEM, published on the actor document
    pub public_key_pem: String,
    /// PKCS#8 PEM; at-rest encryption is the secrets collaborator's job
    pub private_key_pem: String,
}

/// Generate a new RSA key pair suitable for HTTP Signatures
///
/// # Errors
/// Returns error if key generation or PEM encoding fails
pub fn generate_keypair() -> Result<GeneratedKeyPair, AppError> {
    let mut rng = rand::thread_rng();
    let private_key =
        RsaPrivateKey::new(&mut rng, KEY_BITS).map_err(|e| AppError::Internal(e.into()))?;
    let public_key = RsaPublicKey::from(&private_key);

    let private_key_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| AppError::Internal(e.into()))?
        .to_string();
    let public_key_pem = public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| AppError::Internal(e.into()))?;

    Ok(GeneratedKeyPair {
        public_key_pem,
        private_key_pem,
    })
}

/// Get the actor's key pair, generating one if the actor has none yet.
///
/// Creation is insert-if-absent at the SQL statement level, so two
/// concurrent initializers for the same actor converge on one pair: the
/// loser discards its freshly generated keys and reads back the winner's.
///
/// # Errors
/// Returns error if generation or storage fails
pub async fn ensure_actor_keypair(db: &Database, actor_id: &str) -> Result<ActorKeyPair, AppError> {
    if let Some(existing) = db.get_actor_keypair(actor_id).await? {
        return Ok(existing);
    }

    let generated = generate_keypair()?;
    let keypair = ActorKeyPair {
        actor_id: actor_id.to_string(),
        public_key_pem: generated.public_key_pem,
        private_key_pem: generated.private_key_pem,
        created_at: Utc::now(),
    };

    if db.insert_actor_keypair_if_absent(&keypair).await? {
        tracing::info!(actor_id = %actor_id, "Generated signing key pair");
        return Ok(keypair);
    }

    // Lost the creation race; the winner's pair is authoritative.
    db.get_actor_keypair(actor_id)
        .await?
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("key pair vanished after insert race")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};

    #[test]
    fn generate_keypair_produces_parseable_pems() {
        let generated = generate_keypair().expect("key generation should work");

        RsaPrivateKey::from_pkcs8_pem(&generated.private_key_pem)
            .expect("private key should parse as PKCS#8 PEM");
        RsaPublicKey::from_public_key_pem(&generated.public_key_pem)
            .expect("public key should parse as SPKI PEM");
    }

    #[tokio::test]
    async fn ensure_actor_keypair_never_regenerates() {
        let temp_dir = tempfile::TempDir::new().expect("temp dir");
        let db = Database::connect(&temp_dir.path().join("test.db"))
            .await
            .expect("connect");

        let first = ensure_actor_keypair(&db, "actor-1").await.expect("first");
        let second = ensure_actor_keypair(&db, "actor-1").await.expect("second");

        assert_eq!(first.public_key_pem, second.public_key_pem);
        assert_eq!(first.private_key_pem, second.private_key_pem);
    }
}
