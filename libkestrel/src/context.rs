//! The link context: the two surviving input collections, the symbol database, and every output
//! chunk. Passes receive this rather than reaching for globals, which keeps initialisation
//! linear and lets tests build small contexts by hand.

use crate::args::Args;
use crate::diagnostics::DiagnosticSink;
use crate::elf;
use crate::output_sections::ChunkId;
use crate::output_sections::SectionDef;
use crate::output_sections::SectionHdr;
use crate::parsing::InputRef;
use crate::parsing::InputSection;
use crate::parsing::ObjectFile;
use crate::parsing::SectionSlot;
use crate::parsing::SharedFile;
use crate::strtab::StringTableBuilder;
use crate::symbol_db::Symbol;
use crate::symbol_db::SymbolDb;
use crate::symbol_db::SymbolPlacement;
use std::sync::atomic::Ordering;

/// A member of an output section: one input section identified by its owning file and section
/// index.
#[derive(Clone, Copy)]
pub(crate) struct SectionRef<'data> {
    pub(crate) file: &'data ObjectFile<'data>,
    pub(crate) index: u32,
}

impl<'data> SectionRef<'data> {
    pub(crate) fn get(&self) -> &'data InputSection<'data> {
        match &self.file.sections[self.index as usize] {
            SectionSlot::Regular(section) => section,
            _ => unreachable!("SectionRef always points at a regular section"),
        }
    }
}

pub(crate) struct OutputSection<'data> {
    pub(crate) hdr: SectionHdr,
    pub(crate) members: Vec<SectionRef<'data>>,
}

pub(crate) struct MergedSection {
    pub(crate) hdr: SectionHdr,
}

/// A planned `.symtab` entry. Addresses are resolved at write time.
pub(crate) struct PlannedSym<'data> {
    pub(crate) name_offset: u32,
    pub(crate) st_info: u8,
    pub(crate) st_other: u8,
    pub(crate) size: u64,
    pub(crate) target: SymTarget<'data>,
}

pub(crate) enum SymTarget<'data> {
    /// A local defined in an input section; value is the offset within that section.
    Section {
        file: &'data ObjectFile<'data>,
        shndx: u32,
        value: u64,
    },
    Global(&'data Symbol<'data>),
    Absolute(u64),
}

/// One slot in `.got`. The slot count per entry varies: TLSGD and TLSLD occupy two slots.
pub(crate) enum GotEntry<'data> {
    Got(&'data Symbol<'data>),
    TlsGd(&'data Symbol<'data>),
    TlsLd,
    GotTpOff(&'data Symbol<'data>),
}

impl GotEntry<'_> {
    pub(crate) fn num_slots(&self) -> u64 {
        match self {
            GotEntry::Got(_) | GotEntry::GotTpOff(_) => 1,
            GotEntry::TlsGd(_) | GotEntry::TlsLd => 2,
        }
    }
}

/// A planned `.dynamic` entry. Values that depend on final addresses are resolved at write
/// time; planning the list early fixes the section's size.
pub(crate) enum DynEntry {
    Val(u32, u64),
    Addr(u32, ChunkId),
    Size(u32, ChunkId),
    SymbolAddr(u32, Vec<u8>),
}

/// All output chunks plus the state feeding them. Section sizes are fixed during layout,
/// offsets and addresses during offset assignment.
pub(crate) struct OutputChunks<'data> {
    pub(crate) ehdr: SectionHdr,
    pub(crate) phdr: SectionHdr,
    pub(crate) shdr: SectionHdr,
    pub(crate) interp: SectionHdr,
    pub(crate) got: SectionHdr,
    pub(crate) plt: SectionHdr,
    pub(crate) gotplt: SectionHdr,
    pub(crate) pltgot: SectionHdr,
    pub(crate) relplt: SectionHdr,
    pub(crate) reldyn: SectionHdr,
    pub(crate) dynamic: SectionHdr,
    pub(crate) dynsym_hdr: SectionHdr,
    pub(crate) dynstr_hdr: SectionHdr,
    pub(crate) hash: SectionHdr,
    pub(crate) gnu_hash: SectionHdr,
    pub(crate) versym_hdr: SectionHdr,
    pub(crate) verneed_hdr: SectionHdr,
    pub(crate) copyrel: SectionHdr,
    pub(crate) copyrel_relro: SectionHdr,
    pub(crate) common: SectionHdr,
    pub(crate) eh_frame_hdr: SectionHdr,
    pub(crate) buildid: SectionHdr,
    pub(crate) symtab: SectionHdr,
    pub(crate) strtab_hdr: SectionHdr,
    pub(crate) shstrtab_hdr: SectionHdr,

    pub(crate) regular: Vec<OutputSection<'data>>,
    pub(crate) merged: Vec<MergedSection>,

    /// The chunks that actually appear in the output, in layout order.
    pub(crate) chunks: Vec<ChunkId>,

    /// Planned program headers; addresses are materialised from the chunk headers at write
    /// time.
    pub(crate) segments: Vec<crate::layout::SegmentPlan>,

    pub(crate) got_entries: Vec<GotEntry<'data>>,
    pub(crate) plt_symbols: Vec<&'data Symbol<'data>>,
    pub(crate) pltgot_symbols: Vec<&'data Symbol<'data>>,

    /// `.dynsym` contents; entry 0 is the implicit null symbol.
    pub(crate) dynsym: Vec<&'data Symbol<'data>>,
    pub(crate) dynstr: StringTableBuilder,

    /// `.gnu.version` contents, parallel to `dynsym` (with the null entry at index 0).
    pub(crate) versym: Vec<u16>,
    pub(crate) verneed: Vec<u8>,
    pub(crate) verneed_count: u32,

    /// Number of `.rela.dyn` entries, fixed when dynamic tables are allocated.
    pub(crate) reldyn_count: u64,

    pub(crate) gnu_hash_nbuckets: u32,

    /// Index of the first hashed (defined) symbol in `.dynsym`.
    pub(crate) gnu_hash_symndx: u32,

    pub(crate) dynamic_entries: Vec<DynEntry>,

    /// Symbols that were the representative of a copy relocation, one `.rela.dyn` COPY entry
    /// each.
    pub(crate) copyrel_symbols: Vec<&'data Symbol<'data>>,

    /// `.symtab` contents, planned once sizes are needed and materialised at write time when
    /// addresses exist. Locals precede globals as the format requires.
    pub(crate) symtab_locals: Vec<PlannedSym<'data>>,
    pub(crate) symtab_globals: Vec<PlannedSym<'data>>,
    pub(crate) strtab: StringTableBuilder,
    pub(crate) shstrtab: StringTableBuilder,

    /// Bounds of the `PT_TLS` segment, once known. TPOFF values are relative to `tls_end`.
    pub(crate) tls_begin: u64,
    pub(crate) tls_end: u64,
}

impl<'data> OutputChunks<'data> {
    pub(crate) fn new(regular_defs: Vec<SectionDef>, merged_defs: Vec<SectionDef>) -> Self {
        let a = u64::from(object::elf::SHF_ALLOC);
        let w = u64::from(object::elf::SHF_WRITE);
        let x = u64::from(object::elf::SHF_EXECINSTR);

        let hdr = |name: &[u8], sh_type, sh_flags, align, entsize| {
            let mut h = SectionHdr::new(name, sh_type, sh_flags);
            h.sh_addralign = align;
            h.sh_entsize = entsize;
            h
        };

        let regular = regular_defs
            .into_iter()
            .map(|def| OutputSection {
                hdr: SectionHdr::new(&def.name, def.sh_type, def.sh_flags),
                members: Vec::new(),
            })
            .collect();
        let merged = merged_defs
            .into_iter()
            .map(|def| {
                let mut h = SectionHdr::new(&def.name, def.sh_type, def.sh_flags);
                h.sh_entsize = def.sh_entsize;
                MergedSection { hdr: h }
            })
            .collect();

        Self {
            ehdr: hdr(b"", object::elf::SHT_NULL, a, 8, 0),
            phdr: hdr(b"", object::elf::SHT_NULL, a, 8, 0),
            shdr: hdr(b"", object::elf::SHT_NULL, 0, 8, 0),
            interp: hdr(b".interp", object::elf::SHT_PROGBITS, a, 1, 0),
            got: hdr(b".got", object::elf::SHT_PROGBITS, a | w, 8, 8),
            plt: hdr(b".plt", object::elf::SHT_PROGBITS, a | x, 16, 16),
            gotplt: hdr(b".got.plt", object::elf::SHT_PROGBITS, a | w, 8, 8),
            pltgot: hdr(b".plt.got", object::elf::SHT_PROGBITS, a | x, 8, 8),
            relplt: hdr(
                b".rela.plt",
                object::elf::SHT_RELA,
                a,
                8,
                size_of::<elf::Rela>() as u64,
            ),
            reldyn: hdr(
                b".rela.dyn",
                object::elf::SHT_RELA,
                a,
                8,
                size_of::<elf::Rela>() as u64,
            ),
            dynamic: hdr(
                b".dynamic",
                object::elf::SHT_DYNAMIC,
                a | w,
                8,
                size_of::<elf::DynamicEntry>() as u64,
            ),
            dynsym_hdr: hdr(
                b".dynsym",
                object::elf::SHT_DYNSYM,
                a,
                8,
                size_of::<elf::Sym>() as u64,
            ),
            dynstr_hdr: hdr(b".dynstr", object::elf::SHT_STRTAB, a, 1, 0),
            hash: hdr(b".hash", object::elf::SHT_HASH, a, 4, 4),
            gnu_hash: hdr(b".gnu.hash", object::elf::SHT_GNU_HASH, a, 8, 0),
            versym_hdr: hdr(b".gnu.version", object::elf::SHT_GNU_VERSYM, a, 2, 2),
            verneed_hdr: hdr(b".gnu.version_r", object::elf::SHT_GNU_VERNEED, a, 8, 0),
            copyrel: hdr(b".bss", object::elf::SHT_NOBITS, a | w, 64, 0),
            copyrel_relro: hdr(b".bss.rel.ro", object::elf::SHT_NOBITS, a | w, 64, 0),
            common: hdr(b".common", object::elf::SHT_NOBITS, a | w, 1, 0),
            eh_frame_hdr: hdr(b".eh_frame_hdr", object::elf::SHT_PROGBITS, a, 4, 0),
            buildid: hdr(b".note.gnu.build-id", object::elf::SHT_NOTE, a, 4, 0),
            symtab: hdr(
                b".symtab",
                object::elf::SHT_SYMTAB,
                0,
                8,
                size_of::<elf::Sym>() as u64,
            ),
            strtab_hdr: hdr(b".strtab", object::elf::SHT_STRTAB, 0, 1, 0),
            shstrtab_hdr: hdr(b".shstrtab", object::elf::SHT_STRTAB, 0, 1, 0),
            regular,
            merged,
            chunks: Vec::new(),
            segments: Vec::new(),
            got_entries: Vec::new(),
            plt_symbols: Vec::new(),
            pltgot_symbols: Vec::new(),
            dynsym: Vec::new(),
            dynstr: StringTableBuilder::new(),
            versym: Vec::new(),
            verneed: Vec::new(),
            verneed_count: 0,
            reldyn_count: 0,
            gnu_hash_nbuckets: 1,
            gnu_hash_symndx: 1,
            dynamic_entries: Vec::new(),
            copyrel_symbols: Vec::new(),
            symtab_locals: Vec::new(),
            symtab_globals: Vec::new(),
            strtab: StringTableBuilder::new(),
            shstrtab: StringTableBuilder::new(),
            tls_begin: 0,
            tls_end: 0,
        }
    }

    pub(crate) fn hdr(&self, id: ChunkId) -> &SectionHdr {
        match id {
            ChunkId::Ehdr => &self.ehdr,
            ChunkId::Phdr => &self.phdr,
            ChunkId::Shdr => &self.shdr,
            ChunkId::Interp => &self.interp,
            ChunkId::Got => &self.got,
            ChunkId::Plt => &self.plt,
            ChunkId::GotPlt => &self.gotplt,
            ChunkId::PltGot => &self.pltgot,
            ChunkId::RelPlt => &self.relplt,
            ChunkId::RelDyn => &self.reldyn,
            ChunkId::Dynamic => &self.dynamic,
            ChunkId::Dynsym => &self.dynsym_hdr,
            ChunkId::Dynstr => &self.dynstr_hdr,
            ChunkId::Hash => &self.hash,
            ChunkId::GnuHash => &self.gnu_hash,
            ChunkId::Versym => &self.versym_hdr,
            ChunkId::Verneed => &self.verneed_hdr,
            ChunkId::Copyrel => &self.copyrel,
            ChunkId::CopyrelRelro => &self.copyrel_relro,
            ChunkId::Common => &self.common,
            ChunkId::EhFrameHdr => &self.eh_frame_hdr,
            ChunkId::BuildId => &self.buildid,
            ChunkId::Symtab => &self.symtab,
            ChunkId::Strtab => &self.strtab_hdr,
            ChunkId::Shstrtab => &self.shstrtab_hdr,
            ChunkId::Regular(i) => &self.regular[i as usize].hdr,
            ChunkId::Merged(i) => &self.merged[i as usize].hdr,
        }
    }

    pub(crate) fn hdr_mut(&mut self, id: ChunkId) -> &mut SectionHdr {
        match id {
            ChunkId::Ehdr => &mut self.ehdr,
            ChunkId::Phdr => &mut self.phdr,
            ChunkId::Shdr => &mut self.shdr,
            ChunkId::Interp => &mut self.interp,
            ChunkId::Got => &mut self.got,
            ChunkId::Plt => &mut self.plt,
            ChunkId::GotPlt => &mut self.gotplt,
            ChunkId::PltGot => &mut self.pltgot,
            ChunkId::RelPlt => &mut self.relplt,
            ChunkId::RelDyn => &mut self.reldyn,
            ChunkId::Dynamic => &mut self.dynamic,
            ChunkId::Dynsym => &mut self.dynsym_hdr,
            ChunkId::Dynstr => &mut self.dynstr_hdr,
            ChunkId::Hash => &mut self.hash,
            ChunkId::GnuHash => &mut self.gnu_hash,
            ChunkId::Versym => &mut self.versym_hdr,
            ChunkId::Verneed => &mut self.verneed_hdr,
            ChunkId::Copyrel => &mut self.copyrel,
            ChunkId::CopyrelRelro => &mut self.copyrel_relro,
            ChunkId::Common => &mut self.common,
            ChunkId::EhFrameHdr => &mut self.eh_frame_hdr,
            ChunkId::BuildId => &mut self.buildid,
            ChunkId::Symtab => &mut self.symtab,
            ChunkId::Strtab => &mut self.strtab_hdr,
            ChunkId::Shstrtab => &mut self.shstrtab_hdr,
            ChunkId::Regular(i) => &mut self.regular[i as usize].hdr,
            ChunkId::Merged(i) => &mut self.merged[i as usize].hdr,
        }
    }
}

pub(crate) struct LinkContext<'a, 'data> {
    pub(crate) args: &'a Args,
    pub(crate) symbol_db: &'a SymbolDb<'data>,
    pub(crate) diag: &'a DiagnosticSink,

    pub(crate) objs: Vec<&'data ObjectFile<'data>>,
    pub(crate) dsos: Vec<&'data SharedFile<'data>>,

    pub(crate) out: OutputChunks<'data>,

    /// Symbols defined by the linker itself (`_end`, `__start_X`, …). They have no owning input
    /// file, so passes that aggregate by file pick them up from here.
    pub(crate) synthetic_symbols: Vec<&'data Symbol<'data>>,

    /// The resolved entry symbol name (`-e`, then linker script ENTRY, then `_start`).
    pub(crate) entry_name: String,
}

impl<'data> LinkContext<'_, 'data> {
    /// Whether the output carries dynamic sections (`.dynamic`, `.dynsym`, …).
    pub(crate) fn is_dynamic_output(&self) -> bool {
        !self.args.is_static
            && (self.args.is_shared() || self.args.pie || !self.dsos.is_empty())
    }

    /// How many `.rela.dyn` entries a GOT entry produces. Sizing and writing both go through
    /// here so they can't disagree.
    pub(crate) fn dyn_reloc_count(&self, entry: &GotEntry) -> u64 {
        match entry {
            GotEntry::Got(sym) => {
                let imported = sym.def().is_imported;
                u64::from(imported || self.args.is_relocatable())
            }
            GotEntry::GotTpOff(sym) => {
                u64::from(sym.def().is_imported || self.args.is_shared())
            }
            GotEntry::TlsGd(_) => 2,
            GotEntry::TlsLd => 1,
        }
    }

    /// The address of a symbol's definition. Imported functions resolve to their PLT entry so
    /// that address comparisons agree across the process; imported data resolves to its copy
    /// relocation; anything else imported or undefined resolves to zero.
    pub(crate) fn symbol_addr(&self, sym: &Symbol<'data>) -> u64 {
        let def = sym.def();
        if def.is_imported && !def.has_copyrel {
            if sym.index(&sym.plt_idx).is_some() {
                return self.plt_addr(sym);
            }
            return 0;
        }
        match def.placement {
            SymbolPlacement::Undefined => 0,
            SymbolPlacement::Absolute => {
                if def.is_imported {
                    0
                } else {
                    def.value
                }
            }
            SymbolPlacement::Common => 0,
            SymbolPlacement::OutputChunk(id) => self.out.hdr(id).sh_addr + def.value,
            SymbolPlacement::Section(shndx) => {
                let Some(InputRef::Object(file)) = def.file else {
                    return 0;
                };
                match &file.sections[shndx as usize] {
                    SectionSlot::Regular(isec) => {
                        if !isec.alive() {
                            return 0;
                        }
                        let osec = &self.out.regular[isec.output_section as usize];
                        osec.hdr.sh_addr + isec.offset.load(Ordering::Relaxed) + def.value
                    }
                    SectionSlot::Merge(_) => {
                        match file.sym_pieces.get(def.sym_idx as usize) {
                            Some(Some(piece_ref)) => {
                                let merged = &self.out.merged[piece_ref.merged_id as usize];
                                merged.hdr.sh_addr
                                    + piece_ref.piece.offset.load(Ordering::Relaxed)
                                    + piece_ref.addend
                            }
                            _ => 0,
                        }
                    }
                    SectionSlot::Discard => 0,
                }
            }
        }
    }

    pub(crate) fn got_addr(&self, sym: &Symbol<'data>) -> u64 {
        let idx = sym.index(&sym.got_idx).expect("GOT entry was never allocated");
        self.out.got.sh_addr + idx * elf::GOT_ENTRY_SIZE
    }

    pub(crate) fn plt_addr(&self, sym: &Symbol<'data>) -> u64 {
        let idx = sym.index(&sym.plt_idx).expect("PLT entry was never allocated");
        if sym.index(&sym.got_idx).is_some() {
            self.out.pltgot.sh_addr + idx * 8
        } else {
            self.out.plt.sh_addr + idx * elf::PLT_ENTRY_SIZE
        }
    }

    pub(crate) fn tlsgd_addr(&self, sym: &Symbol<'data>) -> u64 {
        let idx = sym
            .index(&sym.tlsgd_idx)
            .expect("TLSGD entry was never allocated");
        self.out.got.sh_addr + idx * elf::GOT_ENTRY_SIZE
    }

    pub(crate) fn tlsld_addr(&self, sym: &Symbol<'data>) -> u64 {
        let idx = sym
            .index(&sym.tlsld_idx)
            .expect("TLSLD entry was never allocated");
        self.out.got.sh_addr + idx * elf::GOT_ENTRY_SIZE
    }

    pub(crate) fn gottpoff_addr(&self, sym: &Symbol<'data>) -> u64 {
        let idx = sym
            .index(&sym.gottpoff_idx)
            .expect("GOTTPOFF entry was never allocated");
        self.out.got.sh_addr + idx * elf::GOT_ENTRY_SIZE
    }
}
