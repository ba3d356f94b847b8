//! Fresh ESP key material.

use rand::Rng;

use crate::model::KeyMaterial;

/// AES-256-GCM key plus the 32-bit salt rfc4106 expects.
const KEY_BYTES: usize = 36;
const MAX_REQID: u32 = 100_000;

impl KeyMaterial {
    pub fn generate<R: Rng>(rng: &mut R) -> Self {
        Self {
            encryption_key: random_hex(rng, KEY_BYTES),
            spi4: random_hex(rng, 4),
            spi6: random_hex(rng, 4),
            reqid: rng.gen_range(1..=MAX_REQID),
        }
    }
}

fn random_hex<R: Rng>(rng: &mut R, len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rng.fill(bytes.as_mut_slice());
    format!("0x{}", hex::encode(bytes))
}
