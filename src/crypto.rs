use alloy_primitives::{Address, keccak256};
use blst::min_sig::{PublicKey as BlstPublicKey, SecretKey, Signature as BlstSignature};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// Length of a compressed min_sig public key (G2).
pub const PUBLIC_KEY_LENGTH: usize = 96;
/// Length of a compressed min_sig signature (G1).
pub const SIGNATURE_LENGTH: usize = 48;
/// A wire signature is the signer's public key followed by the BLS signature.
pub const RECOVERABLE_SIGNATURE_LENGTH: usize = PUBLIC_KEY_LENGTH + SIGNATURE_LENGTH;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Malformed signature: expected 144 bytes, got {0}")]
    MalformedSignature(usize),
    #[error("Invalid public key encoding: {0}")]
    InvalidPublicKey(String),
    #[error("Invalid signature encoding: {0}")]
    InvalidSignatureEncoding(String),
    #[error("Signature does not match digest")]
    SignatureMismatch,
    #[error("Key generation failed: {0}")]
    KeyGen(String),
}

/// A Hash type (32 bytes), typically SHA-256.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl From<[u8; 32]> for Hash {
    fn from(bytes: [u8; 32]) -> Self {
        Hash(bytes)
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// -----------------------------------------------------------------------------
// BLS Cryptography (blst::min_sig)
// Signatures in G1 (48 bytes), public keys in G2 (96 bytes).
// -----------------------------------------------------------------------------

/// BLS Public Key (96 bytes).
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey(pub BlstPublicKey);

impl PublicKey {
    /// Masternode address: last 20 bytes of keccak256 over the compressed key.
    pub fn address(&self) -> Address {
        let hash = keccak256(self.0.to_bytes());
        Address::from_slice(&hash[12..])
    }
}

impl std::hash::Hash for PublicKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.to_bytes().hash(state);
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let bytes = self.0.to_bytes();
        serializer.serialize_bytes(&bytes)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = Deserialize::deserialize(deserializer)?;
        let pk = BlstPublicKey::from_bytes(&bytes)
            .map_err(|e| serde::de::Error::custom(format!("{:?}", e)))?;
        Ok(PublicKey(pk))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pub({})", hex::encode(self.0.to_bytes()))
    }
}

/// BLS Private Key.
#[derive(Clone)]
pub struct PrivateKey(pub SecretKey);

impl PrivateKey {
    fn from_ikm(ikm: &[u8; 32]) -> Result<Self, CryptoError> {
        SecretKey::key_gen(ikm, &[])
            .map(PrivateKey)
            .map_err(|e| CryptoError::KeyGen(format!("{:?}", e)))
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.sk_to_pk())
    }

    pub fn address(&self) -> Address {
        self.public_key().address()
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Priv({})", self.address())
    }
}

/// A masternode signature over a digest.
///
/// Opaque bytes on the wire. BLS signatures are not recoverable on their own,
/// so the signer's compressed public key travels in front of the signature and
/// `recover_signer` checks one against the other.
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Signature(pub Vec<u8>);

impl Signature {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sig({})", hex::encode(&self.0))
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

/// Domain separation tag (DST).
const DST: &[u8] = b"BLS_SIG_BLS12381G1_XMD:SHA-256_SSWU_RO_POP_";

/// Signs a digest with the private key.
pub fn sign(priv_key: &PrivateKey, digest: &Hash) -> Signature {
    let sig = priv_key.0.sign(&digest.0, DST, &[]);
    let mut bytes = Vec::with_capacity(RECOVERABLE_SIGNATURE_LENGTH);
    bytes.extend_from_slice(&priv_key.0.sk_to_pk().to_bytes());
    bytes.extend_from_slice(&sig.to_bytes());
    Signature(bytes)
}

/// Verifies `signature` over `digest` and returns the signer's address.
pub fn recover_signer(digest: &Hash, signature: &Signature) -> Result<Address, CryptoError> {
    let bytes = signature.as_bytes();
    if bytes.len() != RECOVERABLE_SIGNATURE_LENGTH {
        return Err(CryptoError::MalformedSignature(bytes.len()));
    }
    let (pk_bytes, sig_bytes) = bytes.split_at(PUBLIC_KEY_LENGTH);
    let pk = BlstPublicKey::from_bytes(pk_bytes)
        .map_err(|e| CryptoError::InvalidPublicKey(format!("{:?}", e)))?;
    let sig = BlstSignature::from_bytes(sig_bytes)
        .map_err(|e| CryptoError::InvalidSignatureEncoding(format!("{:?}", e)))?;

    let err = sig.verify(true, &digest.0, DST, &[], &pk, true);
    if err != blst::BLST_ERROR::BLST_SUCCESS {
        return Err(CryptoError::SignatureMismatch);
    }
    Ok(PublicKey(pk).address())
}

/// Helper to hash any serializable object
pub fn hash_data<T: Serialize>(data: &T) -> Hash {
    let serialized = serde_json::to_vec(data).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(serialized);
    let result = hasher.finalize();
    Hash(result.into())
}

/// Generate a KeyPair from a u64 ID (deterministic).
/// Used for static masternode sets where keys are derived from IDs.
pub fn generate_keypair_from_id(id: u64) -> (PublicKey, PrivateKey) {
    let mut ikm = [0u8; 32];
    ikm[24..32].copy_from_slice(&id.to_be_bytes());
    // key_gen only rejects IKM shorter than 32 bytes.
    let sk = PrivateKey::from_ikm(&ikm).expect("32-byte IKM is always accepted");
    (sk.public_key(), sk)
}
