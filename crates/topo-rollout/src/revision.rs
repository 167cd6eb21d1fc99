//! Revision hashing.
//!
//! A member's revision identifies the part of the workload spec baked into
//! it at creation: the image and the environment. Changing either means
//! existing members are out of date and must be replaced. Secret
//! references are hashed by name and key, never by resolved value, so a
//! rotated secret does not trigger a rollout on its own.

use sha2::{Digest, Sha256};

use topo_state::{EnvValue, WorkloadSpec};

const REVISION_LEN: usize = 12;

/// Short, stable hash of the image and environment of a workload.
pub fn revision_hash(spec: &WorkloadSpec) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"image\0");
    hasher.update(spec.image.as_bytes());
    // BTreeMap iteration is sorted, so the hash is order-independent.
    for (name, value) in &spec.env {
        hasher.update(b"\0env\0");
        hasher.update(name.as_bytes());
        match value {
            EnvValue::Literal(v) => {
                hasher.update(b"\0lit\0");
                hasher.update(v.as_bytes());
            }
            EnvValue::Secret { secret_ref } => {
                hasher.update(b"\0secret\0");
                hasher.update(secret_ref.name.as_bytes());
                hasher.update(b"/");
                hasher.update(secret_ref.key.as_bytes());
            }
        }
    }
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(REVISION_LEN);
    digest
}
