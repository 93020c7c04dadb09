//! Deduplication of `SHF_MERGE | SHF_STRINGS` section contents. Each mergeable input section is
//! split at NUL terminators into pieces which are interned in a per-output-section concurrent
//! map. When several files contribute the same string, the file with the lowest priority number
//! claims authorship and the piece is laid out exactly once.

use crate::error::Result;
use crate::hash::HashMap;
use crate::hash::hash_bytes;
use anyhow::bail;
use colosseum::sync::Arena;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

const NUM_SHARDS: usize = 16;

pub(crate) const UNASSIGNED: u64 = u64::MAX;

pub(crate) struct StringPiece<'data> {
    pub(crate) data: &'data [u8],

    /// Claim key of the mergeable section that owns this piece: file priority in the high 32
    /// bits, the section's ordinal within that file in the low 32. `UNASSIGNED` until a live
    /// section claims it; lower priorities win the compare-exchange race.
    claim: AtomicU64,

    /// Layout position. First the offset within the claiming section's slice of the output, then
    /// (once section offsets are known) the offset within the merged output section.
    pub(crate) offset: AtomicU64,

    /// Strictest alignment requested by any inserter.
    pub(crate) alignment: AtomicU64,
}

impl<'data> StringPiece<'data> {
    fn new(data: &'data [u8], alignment: u64) -> Self {
        Self {
            data,
            claim: AtomicU64::new(UNASSIGNED),
            offset: AtomicU64::new(UNASSIGNED),
            alignment: AtomicU64::new(alignment.max(1)),
        }
    }

    /// Attempts to claim authorship of this piece for `key`. The current claimant keeps the
    /// piece unless its file priority is higher (numerically) than the candidate's.
    pub(crate) fn claim_for(&self, key: u64) {
        let mut current = self.claim.load(Ordering::Relaxed);
        while current >> 32 > key >> 32 {
            match self
                .claim
                .compare_exchange_weak(current, key, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    pub(crate) fn claimed_by(&self, key: u64) -> bool {
        self.claim.load(Ordering::Relaxed) == key
    }
}

/// The concurrent content-keyed intern map for one merged output section.
pub(crate) struct MergeMap<'data> {
    shards: Vec<Mutex<HashMap<&'data [u8], &'data StringPiece<'data>>>>,
}

impl<'data> MergeMap<'data> {
    pub(crate) fn new() -> Self {
        let mut shards = Vec::with_capacity(NUM_SHARDS);
        shards.resize_with(NUM_SHARDS, || Mutex::new(HashMap::default()));
        Self { shards }
    }

    pub(crate) fn insert(
        &self,
        data: &'data [u8],
        alignment: u64,
        arena: &'data Arena<StringPiece<'data>>,
    ) -> &'data StringPiece<'data> {
        let shard = &self.shards[(hash_bytes(data) as usize) % NUM_SHARDS];
        let mut map = shard.lock().unwrap();
        let piece = *map
            .entry(data)
            .or_insert_with(|| &*arena.alloc(StringPiece::new(data, alignment)));
        piece.alignment.fetch_max(alignment.max(1), Ordering::Relaxed);
        piece
    }
}

/// A mergeable input section: the pieces it contributed together with their offsets within the
/// original section data, so that relocations into the section can be redirected to pieces.
pub(crate) struct MergeableSection<'data> {
    /// Index of the parent merged output section within the link context.
    pub(crate) merged_id: u32,

    pub(crate) sh_addralign: u64,

    /// `(piece, offset of the piece within the input section)`, in input order.
    pub(crate) pieces: Vec<(&'data StringPiece<'data>, u32)>,

    /// Total bytes of pieces this section won, once local offsets are assigned.
    pub(crate) size: AtomicU64,

    /// Offset of this section's slice within the parent merged section.
    pub(crate) offset: AtomicU64,

    /// Cleared when the section is discarded, e.g. because its COMDAT group lost.
    pub(crate) is_alive: std::sync::atomic::AtomicBool,
}

/// A reference to a deduplicated string piece, attached to relocations and symbols that point
/// into mergeable sections.
#[derive(Clone, Copy)]
pub(crate) struct PieceRef<'data> {
    pub(crate) piece: &'data StringPiece<'data>,

    /// Index of the merged output section the piece lives in.
    pub(crate) merged_id: u32,

    /// Offset of the referenced location within the piece.
    pub(crate) addend: u64,
}

/// Builds the claim key for the mergeable section with ordinal `ordinal` in a file with the
/// given priority.
pub(crate) fn claim_key(priority: u32, ordinal: usize) -> u64 {
    (u64::from(priority) << 32) | ordinal as u64
}

impl<'data> MergeableSection<'data> {
    /// Splits `data` at NUL terminators and interns each piece. Fails if the final string is
    /// unterminated, since we'd otherwise silently merge garbage.
    pub(crate) fn split(
        data: &'data [u8],
        merged_id: u32,
        sh_addralign: u64,
        map: &MergeMap<'data>,
        arena: &'data Arena<StringPiece<'data>>,
    ) -> Result<Self> {
        let mut pieces = Vec::new();
        let mut rest = data;
        let mut offset = 0u32;
        while !rest.is_empty() {
            let Some(end) = memchr::memchr(0, rest) else {
                bail!("string is not null terminated");
            };
            let piece_data = &rest[..=end];
            pieces.push((map.insert(piece_data, sh_addralign, arena), offset));
            offset += piece_data.len() as u32;
            rest = &rest[end + 1..];
        }
        Ok(Self {
            merged_id,
            sh_addralign: sh_addralign.max(1),
            pieces,
            size: AtomicU64::new(0),
            offset: AtomicU64::new(0),
            is_alive: std::sync::atomic::AtomicBool::new(true),
        })
    }

    /// Finds the piece containing `offset` within the original section data. Returns the piece
    /// and the remaining offset into it.
    pub(crate) fn piece_at(&self, offset: u64) -> Option<(&'data StringPiece<'data>, u64)> {
        let index = match self
            .pieces
            .binary_search_by_key(&offset, |(_, off)| u64::from(*off))
        {
            Ok(i) => i,
            Err(0) => return None,
            Err(i) => i - 1,
        };
        let (piece, piece_offset) = self.pieces[index];
        let addend = offset - u64::from(piece_offset);
        (addend < piece.data.len() as u64).then_some((piece, addend))
    }

    /// First parallel pass: race to claim authorship of every piece.
    pub(crate) fn claim_pieces(&self, key: u64) {
        for (piece, _) in &self.pieces {
            piece.claim_for(key);
        }
    }

    /// Second parallel pass: lay out the pieces this section won, accumulating from zero.
    pub(crate) fn assign_local_offsets(&self, key: u64) {
        let mut offset = 0u64;
        for (piece, _) in &self.pieces {
            if piece.claimed_by(key) && piece.offset.load(Ordering::Relaxed) == UNASSIGNED {
                offset = crate::elf::align_to(offset, piece.alignment.load(Ordering::Relaxed));
                piece.offset.store(offset, Ordering::Relaxed);
                offset += piece.data.len() as u64;
            }
        }
        self.size.store(offset, Ordering::Relaxed);
    }

    /// Final parallel pass, after the serial prefix sum has placed this section within its
    /// parent: rebase won pieces so that their offsets are relative to the merged section.
    pub(crate) fn rebase_piece_offsets(&self, key: u64) {
        let base = self.offset.load(Ordering::Relaxed);
        for (piece, _) in &self.pieces {
            if piece.claimed_by(key) {
                let local = piece.offset.load(Ordering::Relaxed);
                debug_assert_ne!(local, UNASSIGNED);
                piece.offset.store(base + local, Ordering::Relaxed);
            }
        }
    }
}

/// Hands out stable IDs for merged output sections during the parallel parse, together with the
/// piece intern map for each. The maps have to exist while parsing is still running, which is
/// why they're arena-allocated rather than owned by the link context.
pub(crate) struct MergedRegistry<'data> {
    inner: Mutex<MergedRegistryInner<'data>>,
}

struct MergedRegistryInner<'data> {
    map: HashMap<Vec<u8>, u32>,
    defs: Vec<crate::output_sections::SectionDef>,
    maps: Vec<&'data MergeMap<'data>>,
}

impl<'data> MergedRegistry<'data> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(MergedRegistryInner {
                map: HashMap::default(),
                defs: Vec::new(),
                maps: Vec::new(),
            }),
        }
    }

    pub(crate) fn get_instance(
        &self,
        name: &[u8],
        sh_type: u32,
        sh_flags: u64,
        sh_entsize: u64,
        arena: &'data Arena<MergeMap<'data>>,
    ) -> (u32, &'data MergeMap<'data>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&id) = inner.map.get(name) {
            return (id, inner.maps[id as usize]);
        }
        let id = inner.defs.len() as u32;
        let map = &*arena.alloc(MergeMap::new());
        inner.map.insert(name.to_vec(), id);
        inner.defs.push(crate::output_sections::SectionDef {
            name: name.to_vec(),
            sh_type,
            sh_flags,
            sh_entsize,
        });
        inner.maps.push(map);
        (id, map)
    }

    pub(crate) fn into_defs(self) -> Vec<crate::output_sections::SectionDef> {
        self.inner.into_inner().unwrap().defs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_and_piece_lookup() {
        let arena = Arena::new();
        let map = MergeMap::new();
        let msec = MergeableSection::split(b"hi\0world\0", 0, 1, &map, &arena).unwrap();
        assert_eq!(msec.pieces.len(), 2);
        assert_eq!(msec.pieces[0].0.data, b"hi\0");
        assert_eq!(msec.pieces[1].0.data, b"world\0");

        let (piece, addend) = msec.piece_at(3).unwrap();
        assert_eq!(piece.data, b"world\0");
        assert_eq!(addend, 0);
        let (piece, addend) = msec.piece_at(7).unwrap();
        assert_eq!(piece.data, b"world\0");
        assert_eq!(addend, 4);
        assert!(msec.piece_at(100).is_none());
    }

    #[test]
    fn test_unterminated_string_is_an_error() {
        let arena = Arena::new();
        let map = MergeMap::new();
        assert!(MergeableSection::split(b"oops", 0, 1, &map, &arena).is_err());
    }

    #[test]
    fn test_identical_content_interns_once() {
        let arena = Arena::new();
        let map = MergeMap::new();
        let a = MergeableSection::split(b"shared\0", 0, 1, &map, &arena).unwrap();
        let b = MergeableSection::split(b"shared\0only\0", 0, 1, &map, &arena).unwrap();
        assert!(std::ptr::eq(a.pieces[0].0, b.pieces[0].0));
    }

    #[test]
    fn test_lowest_priority_file_claims_authorship() {
        let arena = Arena::new();
        let map = MergeMap::new();
        let low = MergeableSection::split(b"s\0", 0, 1, &map, &arena).unwrap();
        let high = MergeableSection::split(b"s\0", 0, 1, &map, &arena).unwrap();
        let low_key = claim_key(2, 0);
        let high_key = claim_key(9, 0);

        // Higher priority number claims first; the lower one must still win.
        high.claim_pieces(high_key);
        low.claim_pieces(low_key);
        assert!(low.pieces[0].0.claimed_by(low_key));

        low.assign_local_offsets(low_key);
        high.assign_local_offsets(high_key);
        assert_eq!(low.size.load(Ordering::Relaxed), 2);
        assert_eq!(high.size.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_offsets_respect_alignment() {
        let arena = Arena::new();
        let map = MergeMap::new();
        let msec = MergeableSection::split(b"abc\0wxyz\0", 0, 4, &map, &arena).unwrap();
        let key = claim_key(1, 0);
        msec.claim_pieces(key);
        msec.assign_local_offsets(key);
        assert_eq!(msec.pieces[0].0.offset.load(Ordering::Relaxed), 0);
        // Second piece starts at the next multiple of four after the first's four bytes.
        assert_eq!(msec.pieces[1].0.offset.load(Ordering::Relaxed), 4);
        assert_eq!(msec.size.load(Ordering::Relaxed), 9);

        msec.offset.store(16, Ordering::Relaxed);
        msec.rebase_piece_offsets(key);
        assert_eq!(msec.pieces[0].0.offset.load(Ordering::Relaxed), 16);
        assert_eq!(msec.pieces[1].0.offset.load(Ordering::Relaxed), 20);
    }
}
