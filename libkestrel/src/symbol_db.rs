//! The process-wide symbol intern table. Every global symbol name maps to exactly one `Symbol`
//! which lives for the whole link. Files race to claim definitions during resolution; the winner
//! is decided by a total order on (definition strength, file priority).

use crate::hash::HashMap;
use crate::hash::hash_bytes;
use crate::output_sections::ChunkId;
use crate::parsing::InputRef;
use bitflags::bitflags;
use colosseum::sync::Arena;
use std::fmt::Display;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;

/// Number of intern-table shards. Must be a power of two. Contention on any one shard is rare
/// since symbols spread by name hash.
const NUM_SHARDS: usize = 64;

pub(crate) struct SymbolDb<'data> {
    shards: Vec<Mutex<HashMap<&'data [u8], &'data Symbol<'data>>>>,
    arena: &'data Arena<Symbol<'data>>,

    /// Storage for names invented by the linker itself (`__start_X`, …), which don't live in
    /// any input file's string table.
    names: &'data Arena<Vec<u8>>,
}

bitflags! {
    /// Capability bits accumulated while scanning relocations. Each bit requests an entry in one
    /// of the dynamic tables for the symbol.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct NeedsFlags: u16 {
        const GOT = 1 << 0;
        const PLT = 1 << 1;
        const COPYREL = 1 << 2;
        const TLSGD = 1 << 3;
        const TLSLD = 1 << 4;
        const GOTTPOFF = 1 << 5;
        const DYNSYM = 1 << 6;
    }
}

/// Where a symbol's value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SymbolPlacement {
    Undefined,

    /// Defined in section `section_index` of the owning file.
    Section(u32),

    /// An absolute value (SHN_ABS), or an undefined weak that was forced to zero.
    Absolute,

    /// A common symbol that hasn't yet been assigned backing storage.
    Common,

    /// Defined by the linker at the bounds of an output chunk.
    OutputChunk(ChunkId),
}

/// The resolved definition of a symbol. Copied out of the lock wherever it's read, so it's kept
/// small and `Copy`.
#[derive(Clone, Copy)]
pub(crate) struct SymbolDef<'data> {
    /// The defining input file. `None` means undefined.
    pub(crate) file: Option<InputRef<'data>>,

    pub(crate) placement: SymbolPlacement,

    /// Total order used during resolution: lower wins. Encodes the strength tier in the high
    /// bits and the file priority in the low bits.
    pub(crate) rank: u64,

    pub(crate) value: u64,
    pub(crate) size: u64,

    /// Index of the symbol within the defining file's symbol table.
    pub(crate) sym_idx: u32,

    pub(crate) sym_type: u8,
    pub(crate) is_weak: bool,
    pub(crate) visibility: u8,

    /// Version index within the defining shared object.
    pub(crate) ver_idx: u16,

    /// Whether references must go through the dynamic loader (definition lives in a DSO).
    pub(crate) is_imported: bool,

    /// Whether the symbol is visible to the dynamic loader.
    pub(crate) is_exported: bool,

    /// Set once a copy relocation has been allocated; `value` then holds the offset within the
    /// copy-relocation section.
    pub(crate) has_copyrel: bool,

    /// Whether the copy relocation lives in `.bss.rel.ro` rather than `.bss`.
    pub(crate) copyrel_readonly: bool,
}

impl Default for SymbolDef<'_> {
    fn default() -> Self {
        Self {
            file: None,
            placement: SymbolPlacement::Undefined,
            rank: u64::MAX,
            value: 0,
            size: 0,
            sym_idx: 0,
            sym_type: 0,
            is_weak: false,
            visibility: object::elf::STV_DEFAULT,
            ver_idx: 0,
            is_imported: false,
            is_exported: false,
            has_copyrel: false,
            copyrel_readonly: false,
        }
    }
}

pub(crate) struct Symbol<'data> {
    pub(crate) name: &'data [u8],

    def: Mutex<SymbolDef<'data>>,

    /// Guarded separately from `def` because flag updates happen on the relocation-scanning hot
    /// path where we don't want to contend with anything else.
    flags: Mutex<NeedsFlags>,

    pub(crate) traced: AtomicBool,

    // Indices into the dynamic tables, -1 until assigned by the serial allocation pass.
    pub(crate) dynsym_idx: AtomicI64,
    pub(crate) got_idx: AtomicI64,
    pub(crate) plt_idx: AtomicI64,
    pub(crate) gotplt_idx: AtomicI64,
    pub(crate) tlsgd_idx: AtomicI64,
    pub(crate) tlsld_idx: AtomicI64,
    pub(crate) gottpoff_idx: AtomicI64,
}

impl<'data> Symbol<'data> {
    fn new(name: &'data [u8]) -> Self {
        Self {
            name,
            def: Mutex::new(SymbolDef::default()),
            flags: Mutex::new(NeedsFlags::empty()),
            traced: AtomicBool::new(false),
            dynsym_idx: AtomicI64::new(-1),
            got_idx: AtomicI64::new(-1),
            plt_idx: AtomicI64::new(-1),
            gotplt_idx: AtomicI64::new(-1),
            tlsgd_idx: AtomicI64::new(-1),
            tlsld_idx: AtomicI64::new(-1),
            gottpoff_idx: AtomicI64::new(-1),
        }
    }

    pub(crate) fn def(&self) -> SymbolDef<'data> {
        *self.def.lock().unwrap()
    }

    pub(crate) fn update_def(&self, update: impl FnOnce(&mut SymbolDef<'data>)) {
        update(&mut self.def.lock().unwrap());
    }

    /// Offers `candidate` as the definition for this symbol. The candidate wins if its rank is
    /// strictly lower than the current definition's.
    pub(crate) fn resolve_to(&self, candidate: SymbolDef<'data>) {
        let mut def = self.def.lock().unwrap();
        if candidate.rank < def.rank {
            *def = candidate;
        }
        if self.traced.load(Ordering::Relaxed) {
            if let Some(file) = candidate.file {
                eprintln!("kestrel: trace-symbol: {file}: offers {self}");
            }
        }
    }

    pub(crate) fn set_flags(&self, flags: NeedsFlags) {
        *self.flags.lock().unwrap() |= flags;
    }

    pub(crate) fn flags(&self) -> NeedsFlags {
        *self.flags.lock().unwrap()
    }

    pub(crate) fn index(&self, field: &AtomicI64) -> Option<u64> {
        let value = field.load(Ordering::Relaxed);
        (value >= 0).then_some(value as u64)
    }
}

impl Display for Symbol<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&String::from_utf8_lossy(self.name), f)
    }
}

/// Computes the strength tier used for resolution ranking. Lower is stronger. Definitions from
/// archive members rank below equivalent definitions from directly listed objects, and shared
/// library definitions rank below any in-process definition.
pub(crate) fn resolution_tier(is_dso: bool, is_in_lib: bool, is_weak: bool, is_common: bool) -> u64 {
    if is_dso {
        return 6;
    }
    let strength = if is_common {
        4
    } else if is_weak {
        2
    } else {
        0
    };
    strength + u64::from(is_in_lib)
}

pub(crate) fn resolution_rank(tier: u64, priority: u32) -> u64 {
    (tier << 32) | u64::from(priority)
}

impl<'data> SymbolDb<'data> {
    pub(crate) fn new(
        arena: &'data Arena<Symbol<'data>>,
        names: &'data Arena<Vec<u8>>,
    ) -> Self {
        let mut shards = Vec::with_capacity(NUM_SHARDS);
        shards.resize_with(NUM_SHARDS, || Mutex::new(HashMap::default()));
        Self {
            shards,
            arena,
            names,
        }
    }

    /// Returns the canonical `Symbol` for `name`, creating it if this is the first time the name
    /// has been seen.
    pub(crate) fn intern(&self, name: &'data [u8]) -> &'data Symbol<'data> {
        let shard = &self.shards[(hash_bytes(name) as usize) & (NUM_SHARDS - 1)];
        let mut map = shard.lock().unwrap();
        map.entry(name)
            .or_insert_with(|| &*self.arena.alloc(Symbol::new(name)))
    }

    /// Interns a name that doesn't outlive the caller by copying it into the name arena first.
    pub(crate) fn intern_owned(&self, name: &[u8]) -> &'data Symbol<'data> {
        if let Some(sym) = self.get(name) {
            return sym;
        }
        let stored: &'data [u8] = self.names.alloc(name.to_vec()).as_slice();
        self.intern(stored)
    }

    /// Looks a name up without interning it.
    pub(crate) fn get(&self, name: &[u8]) -> Option<&'data Symbol<'data>> {
        let shard = &self.shards[(hash_bytes(name) as usize) & (NUM_SHARDS - 1)];
        shard.lock().unwrap().get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::iter::IntoParallelIterator;
    use rayon::iter::ParallelIterator;

    #[test]
    fn test_intern_returns_same_symbol() {
        let arena = Arena::new();
        let names = Arena::new();
        let db = SymbolDb::new(&arena, &names);
        let a = db.intern(b"foo");
        let b = db.intern(b"foo");
        assert!(std::ptr::eq(a, b));
        assert!(!std::ptr::eq(a, db.intern(b"bar")));
        assert!(db.get(b"foo").is_some());
        assert!(db.get(b"baz").is_none());
    }

    #[test]
    fn test_concurrent_interning_is_stable() {
        let arena = Arena::new();
        let names = Arena::new();
        let db = SymbolDb::new(&arena, &names);
        let ptrs: Vec<usize> = (0..1000)
            .into_par_iter()
            .map(|i| db.intern(if i % 2 == 0 { b"even" } else { b"odd" }) as *const _ as usize)
            .collect();
        let even = db.intern(b"even") as *const _ as usize;
        let odd = db.intern(b"odd") as *const _ as usize;
        for (i, p) in ptrs.iter().enumerate() {
            assert_eq!(*p, if i % 2 == 0 { even } else { odd });
        }
    }

    #[test]
    fn test_resolution_rank_ordering() {
        let strong_obj = resolution_rank(resolution_tier(false, false, false, false), 10);
        let strong_lib = resolution_rank(resolution_tier(false, true, false, false), 5);
        let weak_obj = resolution_rank(resolution_tier(false, false, true, false), 1);
        let common_obj = resolution_rank(resolution_tier(false, false, false, true), 1);
        let dso = resolution_rank(resolution_tier(true, false, false, false), 1);

        // Strong beats weak beats common beats DSO, regardless of priority.
        assert!(strong_obj < weak_obj);
        assert!(weak_obj < common_obj);
        assert!(common_obj < dso);

        // A directly listed object beats an archive member of the same strength.
        assert!(strong_obj < strong_lib);

        // Ties at the same tier go to the lower priority number.
        let a = resolution_rank(0, 3);
        let b = resolution_rank(0, 4);
        assert!(a < b);
    }
}
