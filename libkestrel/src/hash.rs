use std::hash::BuildHasher;
use std::hash::Hasher;

/// The hasher we use for all content-keyed maps. Fixed-seed so that shard assignment (and with
/// it, anything that might observe map ordering) is stable from run to run.
pub(crate) type FoldState = foldhash::fast::FixedState;

pub(crate) type HashMap<K, V> = hashbrown::HashMap<K, V, FoldState>;

pub(crate) fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut hasher = FoldState::default().build_hasher();
    hasher.write(bytes);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable_and_content_keyed() {
        assert_eq!(hash_bytes(b"abc"), hash_bytes(b"abc"));
        assert_ne!(hash_bytes(b"abc"), hash_bytes(b"abd"));
    }
}
