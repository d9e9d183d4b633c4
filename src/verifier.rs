//! Certificate signature verification.

use crate::crypto::{CryptoError, Hash, Signature, recover_signer};
use crate::types::Address;
use rayon::prelude::*;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VerifyError {
    #[error("Insufficient signatures: {unique} unique, need {required}")]
    InsufficientSignatures { unique: usize, required: f64 },
    #[error("Signature {signature} failed verification: {source}")]
    InvalidSignature {
        signature: String,
        #[source]
        source: CryptoError,
    },
    #[error("Signature {signature} recovers to {signer}, which is not a masternode")]
    NotAMasternode { signature: String, signer: Address },
    #[error("{failed} of {total} signatures failed, first: {first}")]
    Multiple {
        failed: usize,
        total: usize,
        first: Box<VerifyError>,
    },
}

/// Split `signatures` into unique ones (first occurrence order) and duplicates.
pub fn unique_signatures(signatures: &[Signature]) -> (Vec<Signature>, Vec<Signature>) {
    let mut seen = HashSet::with_capacity(signatures.len());
    let mut unique = Vec::with_capacity(signatures.len());
    let mut duplicates = Vec::new();
    for sig in signatures {
        if seen.insert(sig.as_bytes()) {
            unique.push(sig.clone());
        } else {
            duplicates.push(sig.clone());
        }
    }
    (unique, duplicates)
}

/// Whether `count` reaches `threshold` of a set of `set_size`. Exact float
/// comparison: 4 of 5 at 0.667 passes, 3 of 5 does not.
pub fn threshold_reached(count: usize, set_size: usize, threshold: f64) -> bool {
    count as f64 >= set_size as f64 * threshold
}

/// Check that `signatures` over `digest` form a certificate for `masternodes`.
///
/// Duplicates (same bytes) are logged and counted once. Unique signatures are
/// verified in parallel on the rayon pool; every result is collected before
/// the outcome is decided, and the error names a failing signature.
pub fn verify_certificate_signatures(
    digest: &Hash,
    signatures: &[Signature],
    masternodes: &[Address],
    threshold: f64,
) -> Result<(), VerifyError> {
    let (unique, duplicates) = unique_signatures(signatures);
    for d in &duplicates {
        log::warn!("Duplicated signature in certificate: {}", d);
    }

    if !threshold_reached(unique.len(), masternodes.len(), threshold) {
        let required = masternodes.len() as f64 * threshold;
        log::warn!(
            "Certificate has {} unique signatures, threshold is {}",
            unique.len(),
            required
        );
        return Err(VerifyError::InsufficientSignatures {
            unique: unique.len(),
            required,
        });
    }

    let mut failures: Vec<VerifyError> = unique
        .par_iter()
        .filter_map(|sig| verify_one(digest, sig, masternodes).err())
        .collect();

    match failures.len() {
        0 => Ok(()),
        1 => Err(failures.remove(0)),
        failed => Err(VerifyError::Multiple {
            failed,
            total: unique.len(),
            first: Box::new(failures.remove(0)),
        }),
    }
}

fn verify_one(digest: &Hash, sig: &Signature, masternodes: &[Address]) -> Result<(), VerifyError> {
    let signer = recover_signer(digest, sig).map_err(|source| {
        log::warn!("Signature {} failed verification: {}", sig, source);
        VerifyError::InvalidSignature {
            signature: sig.to_string(),
            source,
        }
    })?;
    if !masternodes.contains(&signer) {
        log::warn!("Signature {} from non-masternode {}", sig, signer);
        return Err(VerifyError::NotAMasternode {
            signature: sig.to_string(),
            signer,
        });
    }
    Ok(())
}
