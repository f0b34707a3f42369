use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::addr::Addr;
use crate::cipher::{gen_key_pair_with, PublicKey, SecretKey};

/// convenience method for unit test code: a key pair derived from a seed, the same seed
///  generating the same pair and different seeds different pairs
pub fn test_key_pair(seed: u64) -> (PublicKey, SecretKey) {
    gen_key_pair_with(&mut StdRng::seed_from_u64(seed))
}

pub fn test_pk(n: u64) -> PublicKey {
    test_key_pair(n).0
}

pub fn test_addr(n: u64, port: u16) -> Addr {
    Addr::new(test_pk(n), port)
}
