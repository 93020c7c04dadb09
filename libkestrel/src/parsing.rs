//! Parsed representations of input files: relocatable objects and shared objects. Parsing runs
//! on background tasks during ingestion, so everything here builds owned values; the driver
//! moves them into an arena once ingestion joins, after which all access is through shared
//! references and interior mutability.

use crate::args::Args;
use crate::comdat::ComdatGroup;
use crate::comdat::ComdatRegistry;
use crate::diagnostics::DiagnosticSink;
use crate::elf;
use crate::elf::LE;
use crate::error::Context as _;
use crate::error::LinkError;
use crate::error::Result;
use crate::output_sections::FLAG_MASK;
use crate::output_sections::SectionRegistry;
use crate::output_sections::output_section_name;
use crate::string_merging::MergeMap;
use crate::string_merging::MergeableSection;
use crate::string_merging::MergedRegistry;
use crate::string_merging::PieceRef;
use crate::string_merging::StringPiece;
use crate::symbol_db::NeedsFlags;
use crate::symbol_db::Symbol;
use crate::symbol_db::SymbolDb;
use crate::symbol_db::SymbolDef;
use crate::symbol_db::SymbolPlacement;
use crate::symbol_db::resolution_rank;
use crate::symbol_db::resolution_tier;
use anyhow::anyhow;
use colosseum::sync::Arena;
use object::read::elf::SectionHeader as _;
use object::read::elf::Sym as _;
use std::fmt::Display;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// Shared lookup tables used while parsing files in parallel.
pub(crate) struct ParseResources<'a, 'data> {
    pub(crate) symbol_db: &'a SymbolDb<'data>,
    pub(crate) comdats: &'a ComdatRegistry<'data>,
    pub(crate) sections_registry: &'a SectionRegistry,
    pub(crate) merged_registry: &'a MergedRegistry<'data>,
    pub(crate) piece_arena: &'data Arena<StringPiece<'data>>,
    pub(crate) merge_map_arena: &'data Arena<MergeMap<'data>>,
}

/// A reference to either kind of input file.
#[derive(Clone, Copy)]
pub(crate) enum InputRef<'data> {
    Object(&'data ObjectFile<'data>),
    Shared(&'data SharedFile<'data>),
}

impl<'data> InputRef<'data> {
    pub(crate) fn is_alive(self) -> &'data AtomicBool {
        match self {
            InputRef::Object(o) => &o.is_alive,
            InputRef::Shared(s) => &s.is_alive,
        }
    }
}

impl Display for InputRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InputRef::Object(o) => Display::fmt(&o.name, f),
            InputRef::Shared(s) => write!(f, "{}", s.path.display()),
        }
    }
}

/// What became of each input section header.
pub(crate) enum SectionSlot<'data> {
    /// Not propagated to the output: symbol tables, relocation sections, group metadata, …
    Discard,

    Regular(InputSection<'data>),

    Merge(MergeableSection<'data>),
}

pub(crate) struct InputSection<'data> {
    pub(crate) shdr: &'data elf::SectionHeader,
    pub(crate) name: &'data [u8],

    /// Section bytes; empty for `SHT_NOBITS`.
    pub(crate) data: &'data [u8],

    /// ID of the output section this section was binned into.
    pub(crate) output_section: u32,

    /// Offset within the output section, assigned during layout.
    pub(crate) offset: AtomicU64,

    /// Cleared when the section is discarded by COMDAT deduplication, GC or ICF.
    pub(crate) is_alive: AtomicBool,

    pub(crate) relocations: &'data [elf::Rela],

    /// For each relocation, the string piece it targets if the target lies in one of this file's
    /// mergeable sections.
    pub(crate) rel_pieces: Vec<Option<PieceRef<'data>>>,
}

impl InputSection<'_> {
    pub(crate) fn alive(&self) -> bool {
        self.is_alive.load(Ordering::Relaxed)
    }

    pub(crate) fn sh_flags(&self) -> u64 {
        self.shdr.sh_flags.get(LE)
    }

    pub(crate) fn sh_size(&self) -> u64 {
        self.shdr.sh_size.get(LE)
    }

    pub(crate) fn sh_addralign(&self) -> u64 {
        self.shdr.sh_addralign.get(LE).max(1)
    }

    pub(crate) fn is_nobits(&self) -> bool {
        self.shdr.sh_type.get(LE) == object::elf::SHT_NOBITS
    }
}

pub(crate) struct ObjectFile<'data> {
    /// Name used in diagnostics, e.g. `main.o` or `libx.a(bar.o)`.
    pub(crate) name: String,

    pub(crate) file: elf::File<'data>,

    pub(crate) sections: Vec<SectionSlot<'data>>,

    /// COMDAT groups defined by this file, with the member section indices of each.
    pub(crate) comdat_groups: Vec<(&'data ComdatGroup, Vec<u32>)>,

    /// Interned global symbols, indexed by `symbol index - first_global`.
    pub(crate) globals: Vec<&'data Symbol<'data>>,

    /// For every symbol that is defined inside one of this file's mergeable sections, the piece
    /// its value falls in. Indexed by symbol index.
    pub(crate) sym_pieces: Vec<Option<PieceRef<'data>>>,

    /// Assigned once inputs are finalised: listed objects first, then archive members, then
    /// shared objects. Lower numbers take precedence during resolution.
    pub(crate) priority: u32,

    pub(crate) is_alive: AtomicBool,

    /// Whether this object came out of an archive that wasn't under `--whole-archive`.
    pub(crate) is_in_lib: bool,

}

impl Display for ObjectFile<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.name, f)
    }
}

impl<'data> ObjectFile<'data> {
    pub(crate) fn parse(
        data: &'data [u8],
        name: String,
        is_in_lib: bool,
        res: &ParseResources<'_, 'data>,
    ) -> Result<Self> {
        let file = elf::File::parse(data, false)
            .map_err(|e| anyhow!(LinkError::MalformedElf {
                path: PathBuf::from(&name),
                reason: format!("{e:#}"),
            }))?;

        let num_sections = file.sections.len();
        let mut sections = Vec::with_capacity(num_sections);
        let mut comdat_groups = Vec::new();

        for (section_index, shdr) in file.sections.enumerate() {
            let slot = match shdr.sh_type.get(LE) {
                object::elf::SHT_GROUP => {
                    if let Some(group) = parse_group(&file, shdr, res)? {
                        comdat_groups.push(group);
                    }
                    SectionSlot::Discard
                }
                object::elf::SHT_NULL
                | object::elf::SHT_SYMTAB
                | object::elf::SHT_STRTAB
                | object::elf::SHT_RELA
                | object::elf::SHT_REL
                | object::elf::SHT_SYMTAB_SHNDX => SectionSlot::Discard,
                sh_type => {
                    let sh_flags = shdr.sh_flags.get(LE);
                    let section_name = file.section_name(shdr)?;
                    if sh_flags & u64::from(object::elf::SHF_EXCLUDE) != 0 {
                        SectionSlot::Discard
                    } else if sh_flags & u64::from(object::elf::SHF_MERGE) != 0
                        && sh_flags & u64::from(object::elf::SHF_STRINGS) != 0
                        && sh_flags & u64::from(object::elf::SHF_WRITE) == 0
                    {
                        let (merged_id, map) = res.merged_registry.get_instance(
                            output_section_name(section_name),
                            sh_type,
                            sh_flags & FLAG_MASK,
                            shdr.sh_entsize.get(LE),
                            res.merge_map_arena,
                        );
                        let section_data = file.section_data(shdr).with_context(|| {
                            format!("{name}: invalid mergeable section {section_index:?}")
                        })?;
                        SectionSlot::Merge(
                            MergeableSection::split(
                                section_data,
                                merged_id,
                                shdr.sh_addralign.get(LE),
                                map,
                                res.piece_arena,
                            )
                            .with_context(|| {
                                format!(
                                    "{name}:({})",
                                    String::from_utf8_lossy(section_name)
                                )
                            })?,
                        )
                    } else {
                        let output_section = res.sections_registry.get_instance(
                            output_section_name(section_name),
                            if sh_type == object::elf::SHT_NOBITS {
                                object::elf::SHT_NOBITS
                            } else {
                                sh_type
                            },
                            sh_flags & FLAG_MASK,
                            0,
                        );
                        let section_data = if sh_type == object::elf::SHT_NOBITS {
                            &[]
                        } else {
                            file.section_data(shdr).with_context(|| {
                                format!("{name}: invalid section {section_index:?}")
                            })?
                        };
                        SectionSlot::Regular(InputSection {
                            shdr,
                            name: section_name,
                            data: section_data,
                            output_section,
                            offset: AtomicU64::new(0),
                            is_alive: AtomicBool::new(true),
                            relocations: &[],
                            rel_pieces: Vec::new(),
                        })
                    }
                }
            };
            sections.push(slot);
        }

        // Attach relocations to the sections they apply to.
        for shdr in file.sections.iter() {
            if shdr.sh_type.get(LE) != object::elf::SHT_RELA {
                continue;
            }
            let target = shdr.sh_info.get(LE) as usize;
            let relocations: &[elf::Rela] = shdr
                .data_as_array(LE, data)
                .map_err(|_| anyhow!("{name}: invalid relocation section"))?;
            if let Some(SectionSlot::Regular(target_section)) = sections.get_mut(target) {
                target_section.relocations = relocations;
            }
        }

        // Redirect relocations whose target lies in a mergeable section of this file to the
        // deduplicated piece.
        let elf_syms = file.symbols.symbols();
        let mut rel_piece_updates = Vec::new();
        for (index, slot) in sections.iter().enumerate() {
            let SectionSlot::Regular(section) = slot else {
                continue;
            };
            if section.relocations.is_empty() {
                continue;
            }
            let rel_pieces: Vec<Option<PieceRef<'data>>> = section
                .relocations
                .iter()
                .map(|rel| {
                    let sym_index = rel.r_sym(LE, false) as usize;
                    let esym = elf_syms.get(sym_index)?;
                    let shndx = esym.st_shndx(LE) as usize;
                    let SectionSlot::Merge(msec) = sections.get(shndx)? else {
                        return None;
                    };
                    let target =
                        esym.st_value(LE).wrapping_add(rel.r_addend.get(LE) as u64);
                    let (piece, addend) = msec.piece_at(target)?;
                    Some(PieceRef {
                        piece,
                        merged_id: msec.merged_id,
                        addend,
                    })
                })
                .collect();
            if rel_pieces.iter().any(Option::is_some) {
                rel_piece_updates.push((index, rel_pieces));
            }
        }
        for (index, rel_pieces) in rel_piece_updates {
            let SectionSlot::Regular(section) = &mut sections[index] else {
                unreachable!();
            };
            section.rel_pieces = rel_pieces;
        }

        // Piece references for symbols defined inside mergeable sections.
        let sym_pieces: Vec<Option<PieceRef<'data>>> = elf_syms
            .iter()
            .map(|esym| {
                let shndx = esym.st_shndx(LE) as usize;
                let SectionSlot::Merge(msec) = sections.get(shndx)? else {
                    return None;
                };
                let (piece, addend) = msec.piece_at(esym.st_value(LE))?;
                Some(PieceRef {
                    piece,
                    merged_id: msec.merged_id,
                    addend,
                })
            })
            .collect();

        // Intern the global symbols.
        let globals: Vec<&'data Symbol<'data>> = (file.first_global..elf_syms.len())
            .map(|i| -> Result<&'data Symbol<'data>> {
                let sym_name = file.symbol_name(&elf_syms[i])?;
                Ok(res.symbol_db.intern(sym_name))
            })
            .collect::<Result<_>>()?;

        Ok(Self {
            name,
            file,
            sections,
            comdat_groups,
            globals,
            sym_pieces,
            priority: 0,
            // Everything starts dead. Seeds are marked live through the same compare-exchange
            // as the reachability walk, which is the sole de-duplication.
            is_alive: AtomicBool::new(false),
            is_in_lib,
        })
    }

    pub(crate) fn elf_syms(&self) -> &'data [elf::Sym] {
        self.file.symbols.symbols()
    }

    pub(crate) fn first_global(&self) -> usize {
        self.file.first_global
    }

    /// The interned symbol for a global symbol index.
    pub(crate) fn global(&self, sym_index: usize) -> &'data Symbol<'data> {
        self.globals[sym_index - self.file.first_global]
    }

    pub(crate) fn regular_section(&self, index: usize) -> Option<&InputSection<'data>> {
        match self.sections.get(index) {
            Some(SectionSlot::Regular(section)) => Some(section),
            _ => None,
        }
    }

    /// Registers this file's definitions with the symbol table. Called for every object,
    /// including archive members that may never be loaded.
    pub(crate) fn resolve_symbols(&'data self) {
        let elf_syms = self.elf_syms();
        for i in self.first_global()..elf_syms.len() {
            let esym = &elf_syms[i];
            if esym.is_undefined(LE) {
                continue;
            }
            let shndx = esym.st_shndx(LE);
            let is_common = esym.is_common(LE);
            let placement = if is_common {
                SymbolPlacement::Common
            } else if shndx == object::elf::SHN_ABS || shndx >= object::elf::SHN_LORESERVE {
                SymbolPlacement::Absolute
            } else {
                SymbolPlacement::Section(u32::from(shndx))
            };
            let is_weak = esym.st_bind() == object::elf::STB_WEAK;
            let tier = resolution_tier(false, self.is_in_lib, is_weak, is_common);
            self.global(i).resolve_to(SymbolDef {
                file: Some(InputRef::Object(self)),
                placement,
                rank: resolution_rank(tier, self.priority),
                value: esym.st_value(LE),
                size: esym.st_size(LE),
                sym_idx: i as u32,
                sym_type: esym.st_type(),
                is_weak,
                visibility: esym.st_visibility(),
                ver_idx: 0,
                is_imported: false,
                is_exported: false,
                has_copyrel: false,
                copyrel_readonly: false,
            });
        }
    }

    /// Marks the files this object's undefined references resolve into, feeding newly activated
    /// objects back to the caller. The compare-exchange is the sole de-duplication: a file joins
    /// the frontier at most once.
    pub(crate) fn mark_live_objects(&self, mut activate: impl FnMut(&'data ObjectFile<'data>)) {
        let elf_syms = self.elf_syms();
        for i in self.first_global()..elf_syms.len() {
            if !elf_syms[i].is_undefined(LE) {
                continue;
            }
            let sym = self.global(i);
            let Some(file) = sym.def().file else {
                continue;
            };
            if file
                .is_alive()
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if let InputRef::Object(obj) = file {
                    activate(obj);
                }
            }
        }
    }

    pub(crate) fn resolve_comdat_groups(&self) {
        for (group, _) in &self.comdat_groups {
            group.claim(self.priority);
        }
    }

    /// Kills the member sections of every COMDAT group that some lower-priority file won.
    pub(crate) fn eliminate_duplicate_comdat_groups(&self) {
        for (group, members) in &self.comdat_groups {
            if group.owned_by(self.priority) {
                continue;
            }
            for &member in members {
                match self.sections.get(member as usize) {
                    Some(SectionSlot::Regular(section)) => {
                        section.is_alive.store(false, Ordering::Relaxed);
                    }
                    Some(SectionSlot::Merge(msec)) => {
                        msec.is_alive.store(false, Ordering::Relaxed);
                    }
                    _ => {}
                }
            }
        }
    }

    /// Weak references that never found a definition become absolute zeros.
    pub(crate) fn handle_undefined_weak_symbols(&'data self) {
        let elf_syms = self.elf_syms();
        for i in self.first_global()..elf_syms.len() {
            let esym = &elf_syms[i];
            if !esym.is_undefined(LE) || esym.st_bind() != object::elf::STB_WEAK {
                continue;
            }
            let sym = self.global(i);
            sym.update_def(|def| {
                if def.placement == SymbolPlacement::Undefined {
                    def.file = Some(InputRef::Object(self));
                    def.placement = SymbolPlacement::Absolute;
                    def.value = 0;
                    def.is_weak = true;
                    def.sym_idx = i as u32;
                }
            });
        }
    }

    /// For shared-object output, remaining undefined globals are imports rather than errors.
    pub(crate) fn claim_unresolved_symbols(&'data self) {
        let elf_syms = self.elf_syms();
        for i in self.first_global()..elf_syms.len() {
            let esym = &elf_syms[i];
            if !esym.is_undefined(LE) {
                continue;
            }
            let sym = self.global(i);
            let mut claimed = false;
            sym.update_def(|def| {
                if def.placement == SymbolPlacement::Undefined {
                    def.file = Some(InputRef::Object(self));
                    def.placement = SymbolPlacement::Absolute;
                    def.value = 0;
                    def.sym_idx = i as u32;
                    def.is_imported = true;
                    claimed = true;
                }
            });
            if claimed {
                sym.set_flags(NeedsFlags::DYNSYM);
            }
        }
    }

    /// Reports strong definitions that lost resolution to another live file.
    pub(crate) fn check_duplicate_symbols(&'data self, sink: &DiagnosticSink) {
        let elf_syms = self.elf_syms();
        for i in self.first_global()..elf_syms.len() {
            let esym = &elf_syms[i];
            if esym.is_undefined(LE) || esym.st_bind() == object::elf::STB_WEAK {
                continue;
            }
            let shndx = esym.st_shndx(LE);
            let is_eliminated = !esym.is_common(LE)
                && shndx != object::elf::SHN_ABS
                && shndx < object::elf::SHN_LORESERVE
                && !matches!(
                    self.sections.get(shndx as usize),
                    Some(SectionSlot::Regular(s)) if s.alive()
                )
                && !matches!(
                    self.sections.get(shndx as usize),
                    Some(SectionSlot::Merge(m)) if m.is_alive.load(Ordering::Relaxed)
                );
            if is_eliminated {
                continue;
            }
            let sym = self.global(i);
            let def = sym.def();
            let winner_is_self = matches!(def.file, Some(InputRef::Object(o)) if std::ptr::eq(o, self));
            if !winner_is_self {
                if let Some(winner) = def.file {
                    sink.error(anyhow!(LinkError::DuplicateSymbol {
                        name: sym.to_string(),
                        file_a: self.name.clone(),
                        file_b: winner.to_string(),
                    }));
                }
            }
        }
    }

    /// Decides import/export per symbol for shared-object output, honouring `-Bsymbolic`.
    pub(crate) fn compute_visibility(&'data self, args: &Args) {
        let elf_syms = self.elf_syms();
        for i in self.first_global()..elf_syms.len() {
            let sym = self.global(i);
            let def = sym.def();
            if !matches!(def.file, Some(InputRef::Object(o)) if std::ptr::eq(o, self)) {
                continue;
            }
            let mut visibility = def.visibility;
            let bsymbolic = args.b_symbolic
                || (args.b_symbolic_functions && def.sym_type == object::elf::STT_FUNC);
            if visibility == object::elf::STV_DEFAULT && bsymbolic {
                visibility = object::elf::STV_PROTECTED;
            }
            let (is_imported, is_exported) = match visibility {
                object::elf::STV_DEFAULT => (true, true),
                object::elf::STV_PROTECTED => (false, true),
                _ => (false, false),
            };
            sym.update_def(|def| {
                def.is_imported = is_imported;
                def.is_exported = is_exported;
            });
        }
    }
}

fn parse_group<'data>(
    file: &elf::File<'data>,
    shdr: &'data elf::SectionHeader,
    res: &ParseResources<'_, 'data>,
) -> Result<Option<(&'data ComdatGroup, Vec<u32>)>> {
    let entries: &[object::U32Bytes<object::LittleEndian>] = shdr
        .data_as_array(LE, file.data)
        .map_err(|_| anyhow!("invalid SHT_GROUP section"))?;
    let Some((flags, members)) = entries.split_first() else {
        return Ok(None);
    };
    if flags.get(LE) & object::elf::GRP_COMDAT == 0 {
        return Ok(None);
    }
    let signature_index = shdr.sh_info.get(LE) as usize;
    let signature_sym = file
        .symbols
        .symbol(object::SymbolIndex(signature_index))
        .context("SHT_GROUP signature symbol is out of range")?;
    let signature = file.symbol_name(signature_sym)?;
    let group = res.comdats.intern(signature);
    Ok(Some((
        group,
        members.iter().map(|m| m.get(LE)).collect(),
    )))
}

pub(crate) struct SharedFile<'data> {
    pub(crate) path: PathBuf,
    pub(crate) soname: String,

    pub(crate) file: elf::File<'data>,

    /// Interned symbols for the dynamic symbol table, indexed by `symbol index - first_global`.
    pub(crate) globals: Vec<&'data Symbol<'data>>,

    /// The subset of `globals` that the shared object itself leaves undefined. Any of these that
    /// our image defines must be exported.
    pub(crate) undefs: Vec<&'data Symbol<'data>>,

    /// Version names defined by this object, indexed by version index.
    version_names: Vec<&'data [u8]>,

    pub(crate) priority: u32,
    pub(crate) is_alive: AtomicBool,
    pub(crate) as_needed: bool,
}

impl Display for SharedFile<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

impl<'data> SharedFile<'data> {
    pub(crate) fn parse(
        data: &'data [u8],
        path: PathBuf,
        as_needed: bool,
        res: &ParseResources<'_, 'data>,
    ) -> Result<Self> {
        let file = elf::File::parse(data, true).map_err(|e| {
            anyhow!(LinkError::MalformedElf {
                path: path.clone(),
                reason: format!("{e:#}"),
            })
        })?;

        let soname = read_soname(&file)?.unwrap_or_else(|| {
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        });

        let version_names = read_version_names(&file)?;

        let elf_syms = file.symbols.symbols();
        let mut globals = Vec::with_capacity(elf_syms.len() - file.first_global.min(elf_syms.len()));
        let mut undefs = Vec::new();
        for i in file.first_global..elf_syms.len() {
            let sym = res.symbol_db.intern(file.symbol_name(&elf_syms[i])?);
            globals.push(sym);
            if elf_syms[i].is_undefined(LE) {
                undefs.push(sym);
            }
        }

        Ok(Self {
            path,
            soname,
            file,
            globals,
            undefs,
            version_names,
            priority: 0,
            is_alive: AtomicBool::new(false),
            as_needed,
        })
    }

    pub(crate) fn elf_syms(&self) -> &'data [elf::Sym] {
        self.file.symbols.symbols()
    }

    pub(crate) fn global(&self, sym_index: usize) -> &'data Symbol<'data> {
        self.globals[sym_index - self.file.first_global]
    }

    /// The version index for a dynamic symbol, with the hidden bit stripped.
    pub(crate) fn ver_idx(&self, sym_index: usize) -> u16 {
        self.file
            .versym
            .get(sym_index)
            .map_or(0, |v| v.0.get(LE) & object::elf::VERSYM_VERSION)
    }

    pub(crate) fn version_name(&self, ver_idx: u16) -> &'data [u8] {
        self.version_names
            .get(usize::from(ver_idx))
            .copied()
            .unwrap_or_default()
    }

    /// Definitions from shared libraries are weak imports: they lose to any in-process
    /// definition regardless of file priority.
    pub(crate) fn resolve_symbols(&'data self) {
        let elf_syms = self.elf_syms();
        for i in self.file.first_global..elf_syms.len() {
            let esym = &elf_syms[i];
            if esym.is_undefined(LE) {
                continue;
            }
            let tier = resolution_tier(true, false, true, false);
            self.global(i).resolve_to(SymbolDef {
                file: Some(InputRef::Shared(self)),
                placement: SymbolPlacement::Absolute,
                rank: resolution_rank(tier, self.priority),
                value: esym.st_value(LE),
                size: esym.st_size(LE),
                sym_idx: i as u32,
                sym_type: esym.st_type(),
                is_weak: true,
                visibility: esym.st_visibility(),
                ver_idx: self.ver_idx(i),
                is_imported: true,
                is_exported: false,
                has_copyrel: false,
                copyrel_readonly: false,
            });
        }
    }

    /// Other dynamic symbols that live at the same address as `sym`. A copy relocation against
    /// one alias must satisfy all of them.
    pub(crate) fn find_aliases(&self, value: u64) -> Vec<(usize, &'data Symbol<'data>)> {
        let elf_syms = self.elf_syms();
        let mut aliases = Vec::new();
        for i in self.file.first_global..elf_syms.len() {
            let esym = &elf_syms[i];
            if !esym.is_undefined(LE)
                && esym.st_value(LE) == value
                && matches!(
                    esym.st_type(),
                    object::elf::STT_OBJECT | object::elf::STT_FUNC | object::elf::STT_NOTYPE
                )
            {
                aliases.push((i, self.global(i)));
            }
        }
        aliases
    }

    /// Whether `value` falls inside a read-only loadable segment of the shared object. Decides
    /// whether a copy relocation goes to `.bss.rel.ro` or `.bss`.
    pub(crate) fn is_readonly(&self, value: u64) -> bool {
        use object::read::elf::FileHeader as _;
        let Ok(header) = elf::FileHeader::parse(self.file.data) else {
            return false;
        };
        let Ok(phdrs) = header.program_headers(LE, self.file.data) else {
            return false;
        };
        for phdr in phdrs {
            if phdr.p_type.get(LE) == object::elf::PT_LOAD
                && phdr.p_flags.get(LE) & object::elf::PF_W == 0
            {
                let start = phdr.p_vaddr.get(LE);
                let end = start + phdr.p_memsz.get(LE);
                if (start..end).contains(&value) {
                    return true;
                }
            }
        }
        false
    }
}

fn read_soname(file: &elf::File<'_>) -> Result<Option<String>> {
    use object::read::elf::Dyn as _;
    for (index, shdr) in file.sections.enumerate() {
        if shdr.sh_type.get(LE) != object::elf::SHT_DYNAMIC {
            continue;
        }
        let Some((entries, strings_index)) = shdr.dynamic(LE, file.data)? else {
            continue;
        };
        let strings = file.sections.strings(LE, file.data, strings_index)?;
        for entry in entries {
            if entry.d_tag.get(LE) == u64::from(object::elf::DT_SONAME) {
                let name = entry.string(LE, strings).map_err(|_| {
                    anyhow!("invalid DT_SONAME in section {index:?}")
                })?;
                return Ok(Some(String::from_utf8_lossy(name).into_owned()));
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::comdat::ComdatGroup;
    use crate::string_merging::MergeMap;
    use crate::string_merging::StringPiece;
    use crate::symbol_db::Symbol;
    use colosseum::sync::Arena;

    /// Everything a parsing test needs, owned in one place so tests stay short. The arenas are
    /// leaked, giving the parsed data a `'static` lifetime, which keeps test code free of
    /// self-referential setup.
    pub(crate) struct TestArenas {
        pub(crate) symbols: &'static Arena<Symbol<'static>>,
        pub(crate) names: &'static Arena<Vec<u8>>,
        pub(crate) pieces: &'static Arena<StringPiece<'static>>,
        pub(crate) merge_maps: &'static Arena<MergeMap<'static>>,
        pub(crate) comdats: &'static Arena<ComdatGroup>,
        pub(crate) bytes: &'static Arena<Vec<u8>>,
        pub(crate) objects: &'static Arena<ObjectFile<'static>>,
    }

    impl TestArenas {
        pub(crate) fn new() -> Self {
            Self {
                symbols: Box::leak(Box::new(Arena::new())),
                names: Box::leak(Box::new(Arena::new())),
                pieces: Box::leak(Box::new(Arena::new())),
                merge_maps: Box::leak(Box::new(Arena::new())),
                comdats: Box::leak(Box::new(Arena::new())),
                bytes: Box::leak(Box::new(Arena::new())),
                objects: Box::leak(Box::new(Arena::new())),
            }
        }
    }

    pub(crate) struct TestWorld {
        pub(crate) arenas: TestArenas,
        pub(crate) symbol_db: &'static SymbolDb<'static>,
        pub(crate) comdat_registry: &'static ComdatRegistry<'static>,
        pub(crate) sections_registry: &'static SectionRegistry,
        pub(crate) merged_registry: &'static MergedRegistry<'static>,
    }

    impl TestWorld {
        pub(crate) fn new() -> Self {
            let arenas = TestArenas::new();
            let symbol_db: &'static SymbolDb<'static> =
                Box::leak(Box::new(SymbolDb::new(arenas.symbols, arenas.names)));
            let comdat_registry: &'static ComdatRegistry<'static> =
                Box::leak(Box::new(ComdatRegistry::new(arenas.comdats)));
            let sections_registry: &'static SectionRegistry =
                Box::leak(Box::new(SectionRegistry::default()));
            let merged_registry: &'static MergedRegistry<'static> =
                Box::leak(Box::new(MergedRegistry::new()));
            Self {
                arenas,
                symbol_db,
                comdat_registry,
                sections_registry,
                merged_registry,
            }
        }

        pub(crate) fn resources(&self) -> ParseResources<'static, 'static> {
            ParseResources {
                symbol_db: self.symbol_db,
                comdats: self.comdat_registry,
                sections_registry: self.sections_registry,
                merged_registry: self.merged_registry,
                piece_arena: self.arenas.pieces,
                merge_map_arena: self.arenas.merge_maps,
            }
        }

        /// Parses object bytes, placing them and the resulting file in leaked arenas.
        pub(crate) fn add_object(
            &self,
            bytes: Vec<u8>,
            name: &str,
            is_in_lib: bool,
            priority: u32,
        ) -> &'static ObjectFile<'static> {
            let data: &'static [u8] = self.arenas.bytes.alloc(bytes).as_slice();
            let mut obj =
                ObjectFile::parse(data, name.to_owned(), is_in_lib, &self.resources()).unwrap();
            obj.priority = priority;
            &*self.arenas.objects.alloc(obj)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::test_support::TestWorld;
    use crate::test_elf::ObjBuilder;
    use crate::test_elf::SEC_DATA;
    use crate::test_elf::SEC_MERGE_STRINGS;
    use crate::test_elf::SEC_TEXT;

    #[test]
    fn test_parse_sections_and_symbols() {
        let world = TestWorld::new();
        let mut builder = ObjBuilder::new();
        let text = builder.section(b".text", object::elf::SHT_PROGBITS, SEC_TEXT, &[0x90; 8]);
        builder.section(b".data", object::elf::SHT_PROGBITS, SEC_DATA, &[1, 2, 3]);
        builder.global(b"foo", Some(text), 4, 0);
        builder.global(b"bar", None, 0, 0);
        let obj = world.add_object(builder.build(), "a.o", false, 1);

        // Null section plus our two, then symtab/strtab/shstrtab discarded.
        assert!(matches!(obj.sections[1], SectionSlot::Regular(_)));
        assert!(matches!(obj.sections[2], SectionSlot::Regular(_)));
        assert!(matches!(obj.sections[0], SectionSlot::Discard));
        assert_eq!(obj.globals.len(), 2);

        let section = obj.regular_section(1).unwrap();
        assert_eq!(section.name, b".text");
        assert_eq!(section.data, &[0x90; 8]);
        assert!(section.alive());
    }

    #[test]
    fn test_parse_redirects_string_relocations_to_pieces() {
        let world = TestWorld::new();
        let mut builder = ObjBuilder::new();
        let text = builder.section(b".text", object::elf::SHT_PROGBITS, SEC_TEXT, &[0; 8]);
        let strings = builder.section(
            b".rodata.str1.1",
            object::elf::SHT_PROGBITS,
            SEC_MERGE_STRINGS,
            b"hi\0world\0",
        );
        let strings_sym = builder.section_symbol(strings);
        builder.reloc(
            text,
            crate::test_elf::BuilderReloc {
                offset: 2,
                r_type: object::elf::R_X86_64_PC32,
                symbol: strings_sym,
                addend: 3,
            },
        );
        let obj = world.add_object(builder.build(), "strings.o", false, 1);

        assert!(matches!(obj.sections[2], SectionSlot::Merge(_)));
        let text_section = obj.regular_section(1).unwrap();
        assert_eq!(text_section.relocations.len(), 1);
        let piece_ref = text_section.rel_pieces[0].as_ref().unwrap();
        assert_eq!(piece_ref.piece.data, b"world\0");
        assert_eq!(piece_ref.addend, 0);
    }

    #[test]
    fn test_comdat_groups_deduplicate() {
        let world = TestWorld::new();

        let build = |content: &[u8]| {
            let mut builder = ObjBuilder::new();
            let text =
                builder.section(b".text.inline", object::elf::SHT_PROGBITS, SEC_TEXT, content);
            let sig = builder.global(b"_Z6inlinev", Some(text), 0, 0);
            builder.comdat_group(sig, vec![text]);
            builder.build()
        };

        let a = world.add_object(build(&[0xc3; 4]), "a.o", false, 1);
        let b = world.add_object(build(&[0xc3; 4]), "b.o", false, 2);
        assert_eq!(a.comdat_groups.len(), 1);

        a.resolve_comdat_groups();
        b.resolve_comdat_groups();
        a.eliminate_duplicate_comdat_groups();
        b.eliminate_duplicate_comdat_groups();

        // The lower-priority file keeps its copy; the other is zeroed out.
        assert!(a.regular_section(1).unwrap().alive());
        assert!(!b.regular_section(1).unwrap().alive());
    }
}

fn read_version_names<'data>(file: &elf::File<'data>) -> Result<Vec<&'data [u8]>> {
    let mut names: Vec<&'data [u8]> = vec![b""; 2];
    for shdr in file.sections.iter() {
        if shdr.sh_type.get(LE) != object::elf::SHT_GNU_VERDEF {
            continue;
        }
        let Some((mut iter, strings_index)) = shdr.gnu_verdef(LE, file.data)? else {
            continue;
        };
        let strings = file.sections.strings(LE, file.data, strings_index)?;
        while let Some((verdef, mut aux_iter)) = iter.next()? {
            let index = usize::from(verdef.vd_ndx.get(LE) & object::elf::VERSYM_VERSION);
            let name = match aux_iter.next()? {
                Some(aux) => strings.get(aux.vda_name.get(LE)).unwrap_or_default(),
                None => b"",
            };
            if names.len() <= index {
                names.resize(index + 1, b"");
            }
            names[index] = name;
        }
    }
    Ok(names)
}
