//! Anonymous voter identity and its local persistence
//!
//! Keys follow Semaphore v4. The private key is 32 random bytes; the secret
//! scalar is derived from it the EdDSA-Poseidon way (BLAKE-512, pruned,
//! shifted right by 3, reduced below the Baby Jubjub subgroup order); the
//! public key is `secret * Base8` on Baby Jubjub and the commitment is
//! `Poseidon(pk.x, pk.y)`, which is the leaf the membership circuit
//! recomputes from the secret. Only the commitment ever leaves the machine.
//! Backups use Semaphore's export format (base64 of the private key).
//!
//! Clearing an identity and generating a new one produces an unrelated
//! commitment. Votes cast with the old identity can never be linked to, or
//! repeated by, the new one. Export a backup first if that matters.

use std::fmt;
use std::sync::Arc;

use alloy_primitives::U256;
use ark_bn254::Fr;
use ark_ec::CurveGroup;
use ark_ed_on_bn254::{EdwardsAffine, Fr as SubgroupScalar};
use ark_ff::{BigInteger, Field, MontFp, PrimeField};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use blake_hash::Blake512;
use chrono::{DateTime, Utc};
use log::{info, warn};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroize;

use crate::poseidon_hash::{hash_pair, HashError};
use crate::storage::KeyValueStore;
use crate::utils::{decode_hex, field_to_u256};

/// Storage key of the persisted identity record
pub const STORAGE_KEY: &str = "semaphore_identity";

const PRIVATE_KEY_BYTES: usize = 32;

/// circomlib `Base8`, generator of the prime-order subgroup, in the
/// `168700 x^2 + y^2 = 1 + 168696 x^2 y^2` coordinates circom uses
const BASE8_X: Fr =
    MontFp!("5299619240641551281634865583518297030282874472190772894086521144482721001553");
const BASE8_Y: Fr =
    MontFp!("16950150798460657717958625567821834550301663161624707787222815936182638968203");

/// Curve coefficient `a` of the circom form; arkworks uses the a = 1 form
/// reached through `x' = x * sqrt(a)`
const CIRCOM_COEFF_A: u64 = 168_700;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("no identity to export")]
    NoIdentity,

    #[error("invalid identity secret: {0}")]
    InvalidSecret(String),

    #[error("secure randomness unavailable: {0}")]
    Entropy(#[from] rand::Error),

    #[error("baby jubjub: {0}")]
    Curve(&'static str),

    #[error(transparent)]
    Hash(#[from] HashError),
}

/// Baby Jubjub public key in circom coordinates
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublicKey {
    pub x: Fr,
    pub y: Fr,
}

impl PublicKey {
    /// `secret * Base8`
    pub fn from_secret(secret: &SubgroupScalar) -> Result<Self, IdentityError> {
        let scale = Fr::from(CIRCOM_COEFF_A)
            .sqrt()
            .ok_or(IdentityError::Curve("coefficient a has no square root"))?;
        let unscale = scale
            .inverse()
            .ok_or(IdentityError::Curve("zero coordinate scale"))?;

        let base = EdwardsAffine::new_unchecked(BASE8_X * scale, BASE8_Y);
        if !base.is_on_curve() {
            return Err(IdentityError::Curve("Base8 is not on the curve"));
        }

        let point = (base * secret).into_affine();
        Ok(Self {
            x: point.x * unscale,
            y: point.y,
        })
    }

    /// Identity commitment: Poseidon(x, y)
    pub fn commitment(&self) -> Result<U256, IdentityError> {
        Ok(field_to_u256(hash_pair(self.x, self.y)?))
    }
}

/// EdDSA-Poseidon secret scalar of a private key
fn derive_secret_scalar(private_key: &[u8]) -> SubgroupScalar {
    let digest = <Blake512 as blake_hash::Digest>::digest(private_key);
    let mut half = [0u8; 32];
    half.copy_from_slice(&digest[..32]);

    half[0] &= 0xF8;
    half[31] &= 0x7F;
    half[31] |= 0x40;

    let shifted: U256 = U256::from_le_bytes(half) >> 3;
    half.zeroize();
    SubgroupScalar::from_le_bytes_mod_order(&shifted.to_le_bytes::<32>())
}

/// Commitment the membership circuit recomputes from `secret`
///
/// Fails for secrets at or above the subgroup order, which no derived secret
/// ever is.
pub fn commitment_of_secret(secret: Fr) -> Result<U256, IdentityError> {
    let scalar = SubgroupScalar::from_bigint(secret.into_bigint())
        .ok_or(IdentityError::Curve("secret is not below the subgroup order"))?;
    PublicKey::from_secret(&scalar)?.commitment()
}

/// A voter identity: private key, secret scalar, public key and commitment
#[derive(Clone)]
pub struct Identity {
    private_key: [u8; PRIVATE_KEY_BYTES],
    secret: Fr,
    public_key: PublicKey,
    commitment: U256,
}

impl Identity {
    /// Fresh identity from the OS randomness source
    pub fn generate() -> Result<Self, IdentityError> {
        let mut private_key = [0u8; PRIVATE_KEY_BYTES];
        OsRng.try_fill_bytes(&mut private_key)?;
        let identity = Self::from_private_key(&private_key);
        private_key.zeroize();
        identity
    }

    pub fn from_private_key(private_key: &[u8; PRIVATE_KEY_BYTES]) -> Result<Self, IdentityError> {
        let scalar = derive_secret_scalar(private_key);
        let public_key = PublicKey::from_secret(&scalar)?;
        let commitment = public_key.commitment()?;
        let secret = Fr::from_le_bytes_mod_order(&scalar.into_bigint().to_bytes_le());

        Ok(Self {
            private_key: *private_key,
            secret,
            public_key,
            commitment,
        })
    }

    /// Restore from a backup string
    ///
    /// Takes the base64 export of [`Identity::export`] (Semaphore's format)
    /// or a `0x`-prefixed hex private key.
    pub fn import(exported: &str) -> Result<Self, IdentityError> {
        let exported = exported.trim();
        let decoded = if exported.starts_with("0x") || exported.starts_with("0X") {
            decode_hex(exported).map_err(|e| IdentityError::InvalidSecret(e.to_string()))
        } else {
            BASE64
                .decode(exported)
                .map_err(|e| IdentityError::InvalidSecret(e.to_string()))
        };
        let mut bytes = decoded?;

        if bytes.len() != PRIVATE_KEY_BYTES {
            let len = bytes.len();
            bytes.zeroize();
            return Err(IdentityError::InvalidSecret(format!(
                "expected {} bytes, got {}",
                PRIVATE_KEY_BYTES, len
            )));
        }

        let mut private_key = [0u8; PRIVATE_KEY_BYTES];
        private_key.copy_from_slice(&bytes);
        bytes.zeroize();

        let identity = Self::from_private_key(&private_key);
        private_key.zeroize();
        identity
    }

    /// Backup string: base64 of the private key
    pub fn export(&self) -> String {
        BASE64.encode(self.private_key)
    }

    pub fn commitment(&self) -> U256 {
        self.commitment
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    pub fn secret_scalar(&self) -> Fr {
        self.secret
    }

    /// Nullifier for `scope`: Poseidon(scope, secret)
    ///
    /// Deterministic per (identity, scope) and unlinkable to the commitment.
    pub fn nullifier(&self, scope: Fr) -> Result<Fr, IdentityError> {
        Ok(hash_pair(scope, self.secret)?)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("commitment", &self.commitment)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.commitment == other.commitment
    }
}

impl Eq for Identity {}

impl Drop for Identity {
    fn drop(&mut self) {
        self.private_key.zeroize();
    }
}

/// Backup material returned by [`IdentityStore::export_identity`]
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedIdentity {
    pub private_key: String,
    pub commitment: String,
}

/// Persisted record: `{"privateKey", "commitment", "createdAt"}`
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredIdentity {
    private_key: String,
    commitment: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    created_at: DateTime<Utc>,
}

/// Identity manager backed by a [`KeyValueStore`]
///
/// Storage problems never reach the caller: an unreadable record loads as
/// "no identity yet" and a failed write leaves the identity usable in memory
/// for this session.
pub struct IdentityStore {
    storage: Arc<dyn KeyValueStore>,
    identity: Option<Identity>,
    created_at: Option<DateTime<Utc>>,
}

impl IdentityStore {
    /// Load the persisted identity, if any
    pub fn load(storage: Arc<dyn KeyValueStore>) -> Self {
        let mut store = Self {
            storage,
            identity: None,
            created_at: None,
        };

        match store.read_record() {
            Ok(Some((identity, created_at))) => {
                info!("loaded identity with commitment {}", identity.commitment());
                store.identity = Some(identity);
                store.created_at = Some(created_at);
            }
            Ok(None) => {}
            Err(reason) => warn!("ignoring unreadable identity record: {}", reason),
        }
        store
    }

    fn read_record(&self) -> Result<Option<(Identity, DateTime<Utc>)>, String> {
        let Some(raw) = self.storage.get(STORAGE_KEY).map_err(|e| e.to_string())? else {
            return Ok(None);
        };
        let record: StoredIdentity = serde_json::from_str(&raw).map_err(|e| e.to_string())?;
        let identity = Identity::import(&record.private_key).map_err(|e| e.to_string())?;

        if record.commitment != identity.commitment().to_string() {
            warn!("stored commitment does not match private key, using derived commitment");
        }
        Ok(Some((identity, record.created_at)))
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn commitment(&self) -> Option<U256> {
        self.identity.as_ref().map(Identity::commitment)
    }

    pub fn has_identity(&self) -> bool {
        self.identity.is_some()
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    /// Return the current commitment, generating an identity on first use
    pub fn ensure_identity(&mut self) -> Result<U256, IdentityError> {
        match self.commitment() {
            Some(commitment) => Ok(commitment),
            None => self.generate_identity(),
        }
    }

    /// Replace any current identity with a freshly generated one
    pub fn generate_identity(&mut self) -> Result<U256, IdentityError> {
        let identity = Identity::generate()?;
        info!("generated identity with commitment {}", identity.commitment());
        Ok(self.replace(identity))
    }

    pub fn export_identity(&self) -> Result<ExportedIdentity, IdentityError> {
        let identity = self.identity.as_ref().ok_or(IdentityError::NoIdentity)?;
        Ok(ExportedIdentity {
            private_key: identity.export(),
            commitment: identity.commitment().to_string(),
        })
    }

    /// Replace any current identity with one restored from a backup string
    pub fn import_identity(&mut self, private_key: &str) -> Result<U256, IdentityError> {
        let identity = Identity::import(private_key)?;
        info!("imported identity with commitment {}", identity.commitment());
        Ok(self.replace(identity))
    }

    /// Forget the identity, in memory and on disk
    pub fn clear_identity(&mut self) {
        if let Err(e) = self.storage.remove(STORAGE_KEY) {
            warn!("failed to remove identity record: {}", e);
        }
        self.identity = None;
        self.created_at = None;
    }

    fn replace(&mut self, identity: Identity) -> U256 {
        let created_at = Utc::now();
        let record = StoredIdentity {
            private_key: identity.export(),
            commitment: identity.commitment().to_string(),
            created_at,
        };

        match serde_json::to_string(&record) {
            Ok(json) => {
                if let Err(e) = self.storage.set(STORAGE_KEY, &json) {
                    warn!("identity kept in memory only, persisting failed: {}", e);
                }
            }
            Err(e) => warn!("identity kept in memory only, encoding failed: {}", e),
        }

        let commitment = identity.commitment();
        self.identity = Some(identity);
        self.created_at = Some(created_at);
        commitment
    }
}
