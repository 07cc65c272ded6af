//! Node identity and credentials.
//!
//! Registration proves wallet ownership by recovering the signer address
//! from an Ethereum personal-sign signature over a known challenge
//! message. The stable node id is derived from (machine-id, wallet).
//! The minted bearer credential is an HS256 JWT; only a salted hash of
//! it is persisted.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sha3::Keccak256;

use crate::config::JwtConfig;
use crate::error::{OrchestratorError, Result};

/// Claims carried in a node's bearer credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeClaims {
    /// Node id.
    pub sub: String,
    pub wallet: String,
    pub machine_id: String,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
}

/// Validate and normalize a wallet address to lowercase hex.
pub fn validate_wallet_address(address: &str) -> Result<String> {
    let trimmed = address.trim();
    if trimmed.is_empty() {
        return Err(OrchestratorError::Validation(
            "wallet address is required".to_string(),
        ));
    }
    let hex_part = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .ok_or_else(|| {
            OrchestratorError::Validation("wallet address must start with 0x".to_string())
        })?;
    if hex_part.len() != 40 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(OrchestratorError::Validation(format!(
            "invalid wallet address: {}",
            trimmed
        )));
    }
    Ok(format!("0x{}", hex_part.to_lowercase()))
}

/// Derive the stable node id from (machine-id, wallet).
pub fn derive_node_id(machine_id: &str, wallet_address: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(machine_id.as_bytes());
    hasher.update(b":");
    hasher.update(wallet_address.to_lowercase().as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

/// Keccak-256 over the personal-sign prefixed message.
fn personal_message_digest(message: &str) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(format!("\x19Ethereum Signed Message:\n{}", message.len()).as_bytes());
    hasher.update(message.as_bytes());
    hasher.finalize().into()
}

fn address_from_key(key: &VerifyingKey) -> String {
    let point = key.to_encoded_point(false);
    let digest = Keccak256::digest(&point.as_bytes()[1..]);
    format!("0x{}", hex::encode(&digest[12..]))
}

/// Recover the signer address from a 65-byte recoverable signature over
/// the personal-sign digest of `message`.
pub fn recover_wallet(message: &str, signature_hex: &str) -> Result<String> {
    let raw = hex::decode(signature_hex.trim_start_matches("0x"))
        .map_err(|_| OrchestratorError::Unauthorized("signature is not valid hex".to_string()))?;
    if raw.len() != 65 {
        return Err(OrchestratorError::Unauthorized(format!(
            "signature must be 65 bytes, got {}",
            raw.len()
        )));
    }
    let v = raw[64];
    let recovery = if v >= 27 { v - 27 } else { v };
    let recovery_id = RecoveryId::try_from(recovery)
        .map_err(|_| OrchestratorError::Unauthorized(format!("invalid recovery id {}", v)))?;
    let signature = Signature::from_slice(&raw[..64])
        .map_err(|e| OrchestratorError::Unauthorized(format!("malformed signature: {}", e)))?;
    let digest = personal_message_digest(message);
    let key = VerifyingKey::recover_from_prehash(&digest, &signature, recovery_id)
        .map_err(|e| OrchestratorError::Unauthorized(format!("recovery failed: {}", e)))?;
    Ok(address_from_key(&key))
}

/// Verify that `signature_hex` over `message` recovers to `claimed`.
pub fn verify_wallet_signature(message: &str, signature_hex: &str, claimed: &str) -> Result<()> {
    let recovered = recover_wallet(message, signature_hex)?;
    if recovered.eq_ignore_ascii_case(claimed) {
        Ok(())
    } else {
        Err(OrchestratorError::Unauthorized(format!(
            "signature recovers to {}, not {}",
            recovered, claimed
        )))
    }
}

/// Mint the long-lived bearer credential for a node.
pub fn mint_node_token(
    config: &JwtConfig,
    node_id: &str,
    wallet: &str,
    machine_id: &str,
) -> Result<String> {
    let now = chrono::Utc::now();
    let claims = NodeClaims {
        sub: node_id.to_string(),
        wallet: wallet.to_string(),
        machine_id: machine_id.to_string(),
        iss: config.issuer.clone(),
        aud: config.audience.clone(),
        iat: now.timestamp(),
        exp: (now + chrono::Duration::days(config.ttl_days as i64)).timestamp(),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(config.key.as_bytes()),
    )
    .map_err(|e| OrchestratorError::External(format!("minting credential: {}", e)))
}

/// Verify a node bearer credential and return its claims.
pub fn verify_node_token(config: &JwtConfig, token: &str) -> Result<NodeClaims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_issuer(&[&config.issuer]);
    validation.set_audience(&[&config.audience]);
    decode::<NodeClaims>(
        token,
        &DecodingKey::from_secret(config.key.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|e| OrchestratorError::Unauthorized(format!("invalid credential: {}", e)))
}

/// Salted hash of an issued credential, `salt$hash`.
pub fn hash_api_key(token: &str) -> String {
    let mut salt = [0u8; 16];
    OsRng.fill_bytes(&mut salt);
    let salt_hex = hex::encode(salt);
    let mut hasher = Sha256::new();
    hasher.update(salt_hex.as_bytes());
    hasher.update(token.as_bytes());
    format!("{}${}", salt_hex, hex::encode(hasher.finalize()))
}

/// Check a presented credential against a stored salted hash.
pub fn verify_api_key(token: &str, stored: &str) -> bool {
    let Some((salt, expected)) = stored.split_once('$') else {
        return false;
    };
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize()) == expected
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::ecdsa::SigningKey;

    fn test_jwt_config() -> JwtConfig {
        JwtConfig {
            key: "test-secret".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_wallet_validation() {
        let ok = validate_wallet_address("0xAbCd000000000000000000000000000000000001").unwrap();
        assert_eq!(ok, "0xabcd000000000000000000000000000000000001");
        assert!(validate_wallet_address("").is_err());
        assert!(validate_wallet_address("abcd").is_err());
        assert!(validate_wallet_address("0x123").is_err());
        assert!(validate_wallet_address("0xzz00000000000000000000000000000000000000").is_err());
    }

    #[test]
    fn test_node_id_is_stable_and_case_insensitive() {
        let a = derive_node_id("machine-1", "0xABC0000000000000000000000000000000000001");
        let b = derive_node_id("machine-1", "0xabc0000000000000000000000000000000000001");
        let c = derive_node_id("machine-2", "0xabc0000000000000000000000000000000000001");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_signature_recovery_roundtrip() {
        let signing_key = SigningKey::random(&mut OsRng);
        let verifying_key = VerifyingKey::from(&signing_key);
        let expected = address_from_key(&verifying_key);

        let message = "nimbus-register:machine-1";
        let digest = personal_message_digest(message);
        let (signature, recovery_id) = signing_key.sign_prehash_recoverable(&digest).unwrap();
        let mut raw = signature.to_bytes().to_vec();
        raw.push(recovery_id.to_byte() + 27);
        let signature_hex = format!("0x{}", hex::encode(raw));

        let recovered = recover_wallet(message, &signature_hex).unwrap();
        assert_eq!(recovered, expected);
        verify_wallet_signature(message, &signature_hex, &expected.to_uppercase()).unwrap();
        assert!(verify_wallet_signature("other message", &signature_hex, &expected).is_err());
    }

    #[test]
    fn test_signature_length_is_enforced() {
        assert!(recover_wallet("msg", "0xdeadbeef").is_err());
    }

    #[test]
    fn test_jwt_roundtrip() {
        let config = test_jwt_config();
        let token = mint_node_token(&config, "node-1", "0xabc", "machine-1").unwrap();
        let claims = verify_node_token(&config, &token).unwrap();
        assert_eq!(claims.sub, "node-1");
        assert_eq!(claims.machine_id, "machine-1");

        let mut other = test_jwt_config();
        other.key = "different".to_string();
        assert!(verify_node_token(&other, &token).is_err());
    }

    #[test]
    fn test_api_key_hash_roundtrip() {
        let stored = hash_api_key("token-1");
        assert!(verify_api_key("token-1", &stored));
        assert!(!verify_api_key("token-2", &stored));
        // Distinct salts per mint
        assert_ne!(stored, hash_api_key("token-1"));
    }
}
