//! Relocation scanning and dynamic table allocation. The parallel scan decides, per symbol,
//! which dynamic tables it needs entries in; a serial pass then hands out the actual indices so
//! that the result is independent of scheduling.

use crate::context::DynEntry;
use crate::context::GotEntry;
use crate::context::LinkContext;
use crate::elf;
use crate::elf::LE;
use crate::error::LinkError;
use crate::error::Result;
use crate::output_sections::ChunkId;
use crate::parsing::InputRef;
use crate::parsing::ObjectFile;
use crate::parsing::SectionSlot;
use crate::symbol_db::NeedsFlags;
use crate::symbol_db::Symbol;
use crate::symbol_db::SymbolPlacement;
use anyhow::anyhow;
use object::read::elf::Sym as _;
use rayon::iter::IntoParallelRefIterator;
use rayon::iter::ParallelIterator;
use std::sync::atomic::Ordering;

/// Marks default-visibility definitions for export when `--export-dynamic` or `-shared` asks
/// for everything to be visible to the dynamic loader.
#[tracing::instrument(skip_all, name = "Export dynamic")]
pub(crate) fn export_dynamic(ctx: &LinkContext) {
    if !ctx.is_dynamic_output() || !(ctx.args.export_dynamic || ctx.args.is_shared()) {
        return;
    }
    ctx.objs.par_iter().for_each(|&file| {
        for i in file.first_global()..file.elf_syms().len() {
            let sym = file.global(i);
            let def = sym.def();
            if matches!(def.file, Some(InputRef::Object(o)) if std::ptr::eq(o, file))
                && def.visibility == object::elf::STV_DEFAULT
            {
                sym.update_def(|d| d.is_exported = true);
                sym.set_flags(NeedsFlags::DYNSYM);
            }
        }
    });
}

/// Walks every relocation in every live section, setting capability bits on the referenced
/// symbols. Undefined non-weak references are diagnosed here; the pass keeps going so that one
/// run reports them all.
#[tracing::instrument(skip_all, name = "Scan relocations")]
pub(crate) fn scan_relocations(ctx: &LinkContext) -> Result {
    ctx.objs.par_iter().for_each(|&file| {
        for slot in &file.sections {
            let SectionSlot::Regular(section) = slot else {
                continue;
            };
            if !section.alive()
                || section.sh_flags() & u64::from(object::elf::SHF_ALLOC) == 0
            {
                continue;
            }
            scan_section(ctx, file, section.relocations, section.name);
        }
    });
    ctx.diag.checkpoint()?;

    // Symbols that shared objects reference and that we define must be exported.
    if ctx.is_dynamic_output() {
        ctx.dsos.par_iter().for_each(|dso| {
            for &sym in &dso.undefs {
                let def = sym.def();
                if matches!(def.file, Some(InputRef::Object(_))) {
                    sym.update_def(|d| d.is_exported = true);
                    sym.set_flags(NeedsFlags::DYNSYM);
                }
            }
        });
    }

    Ok(())
}

/// What the scanner needs to know about a relocation's target, whether it's a local or an
/// interned global.
struct Target<'data> {
    symbol: Option<&'data Symbol<'data>>,
    sym_type: u8,
    is_imported: bool,
    is_undefined_strong: bool,
}

fn target_of<'data>(file: &'data ObjectFile<'data>, sym_index: usize) -> Target<'data> {
    let elf_syms = file.elf_syms();
    let Some(esym) = elf_syms.get(sym_index) else {
        return Target {
            symbol: None,
            sym_type: 0,
            is_imported: false,
            is_undefined_strong: false,
        };
    };
    if sym_index < file.first_global() {
        return Target {
            symbol: None,
            sym_type: esym.st_type(),
            is_imported: false,
            is_undefined_strong: false,
        };
    }
    let sym = file.global(sym_index);
    let def = sym.def();
    let undefined = def.placement == SymbolPlacement::Undefined;
    Target {
        symbol: Some(sym),
        sym_type: if undefined { esym.st_type() } else { def.sym_type },
        is_imported: def.is_imported,
        is_undefined_strong: undefined && esym.st_bind() != object::elf::STB_WEAK,
    }
}

fn scan_section<'data>(
    ctx: &LinkContext<'_, 'data>,
    file: &'data ObjectFile<'data>,
    relocations: &[elf::Rela],
    section_name: &[u8],
) {
    let shared = ctx.args.is_shared();
    let mut i = 0;
    while i < relocations.len() {
        let rel = &relocations[i];
        i += 1;
        let r_type = rel.r_type(LE, false);
        let target = target_of(file, rel.r_sym(LE, false) as usize);

        if target.is_undefined_strong {
            ctx.diag.error(anyhow!(LinkError::UndefinedSymbol {
                name: target.symbol.map(|s| s.to_string()).unwrap_or_default(),
                referenced_by: file.name.clone(),
            }));
            continue;
        }

        let set = |flags: NeedsFlags| {
            if let Some(sym) = target.symbol {
                sym.set_flags(flags);
            }
        };

        match r_type {
            object::elf::R_X86_64_NONE => {}
            object::elf::R_X86_64_8
            | object::elf::R_X86_64_16
            | object::elf::R_X86_64_32
            | object::elf::R_X86_64_32S
            | object::elf::R_X86_64_64
            | object::elf::R_X86_64_PC8
            | object::elf::R_X86_64_PC16
            | object::elf::R_X86_64_PC32
            | object::elf::R_X86_64_PC64 => {
                if target.is_imported {
                    if target.sym_type == object::elf::STT_OBJECT && !shared {
                        set(NeedsFlags::COPYREL);
                    } else {
                        set(NeedsFlags::PLT);
                    }
                }
            }
            object::elf::R_X86_64_GOT32
            | object::elf::R_X86_64_GOTPC32
            | object::elf::R_X86_64_GOTPCREL
            | object::elf::R_X86_64_GOTPCRELX
            | object::elf::R_X86_64_REX_GOTPCRELX => {
                set(NeedsFlags::GOT);
            }
            object::elf::R_X86_64_PLT32 => {
                if target.is_imported || target.sym_type == object::elf::STT_GNU_IFUNC {
                    set(NeedsFlags::PLT);
                }
            }
            object::elf::R_X86_64_TLSGD => {
                // The GD sequence pairs this with a following PLT32 call to
                // __tls_get_addr. When the access relaxes to local-exec, the pair is
                // rewritten as one unit, so the call's relocation is skipped.
                if target.is_imported || shared {
                    set(NeedsFlags::TLSGD);
                } else {
                    i += 1;
                }
            }
            object::elf::R_X86_64_TLSLD => {
                if target.is_imported || shared {
                    set(NeedsFlags::TLSLD);
                } else {
                    i += 1;
                }
            }
            object::elf::R_X86_64_TPOFF32
            | object::elf::R_X86_64_TPOFF64
            | object::elf::R_X86_64_DTPOFF32
            | object::elf::R_X86_64_DTPOFF64 => {}
            object::elf::R_X86_64_GOTTPOFF => {
                set(NeedsFlags::GOTTPOFF);
            }
            _ => {
                ctx.diag.error(anyhow!(LinkError::UnknownRelocation {
                    r_type,
                    place: format!(
                        "{}:({})",
                        file.name,
                        String::from_utf8_lossy(section_name)
                    ),
                }));
            }
        }
    }
}

/// Serial allocation of all dynamic table indices. Visits symbols in file order (objects, then
/// shared objects, then linker-synthesised symbols), so indices are a pure function of the
/// resolved link.
#[tracing::instrument(skip_all, name = "Allocate dynamic entries")]
pub(crate) fn allocate_dynamic_entries<'data>(ctx: &mut LinkContext<'_, 'data>) {
    let mut flagged: Vec<&'data Symbol<'data>> = Vec::new();
    for file in &ctx.objs {
        for i in file.first_global()..file.elf_syms().len() {
            let sym = file.global(i);
            if !sym.flags().is_empty()
                && matches!(sym.def().file, Some(InputRef::Object(o)) if std::ptr::eq(o, *file))
            {
                flagged.push(sym);
            }
        }
    }
    for dso in &ctx.dsos {
        for &sym in &dso.globals {
            if !sym.flags().is_empty()
                && matches!(sym.def().file, Some(InputRef::Shared(s)) if std::ptr::eq(s, *dso))
            {
                flagged.push(sym);
            }
        }
    }
    for &sym in &ctx.synthetic_symbols {
        if !sym.flags().is_empty() {
            flagged.push(sym);
        }
    }

    let mut got_slots = 0u64;
    let mut tlsld_slot: Option<u64> = None;

    for sym in flagged {
        let mut flags = sym.flags();
        let def = sym.def();

        // Anything the dynamic loader must bind needs to be in .dynsym.
        if def.is_imported
            && flags.intersects(
                NeedsFlags::GOT
                    | NeedsFlags::PLT
                    | NeedsFlags::COPYREL
                    | NeedsFlags::TLSGD
                    | NeedsFlags::GOTTPOFF,
            )
        {
            flags |= NeedsFlags::DYNSYM;
            sym.set_flags(NeedsFlags::DYNSYM);
        }

        if flags.contains(NeedsFlags::DYNSYM) && ctx.is_dynamic_output() {
            push_dynsym(ctx, sym);
        }

        if flags.contains(NeedsFlags::GOT) {
            sym.got_idx.store(got_slots as i64, Ordering::Relaxed);
            ctx.out.got_entries.push(GotEntry::Got(sym));
            got_slots += 1;
        }

        if flags.contains(NeedsFlags::PLT) {
            if flags.contains(NeedsFlags::GOT) {
                sym.plt_idx
                    .store(ctx.out.pltgot_symbols.len() as i64, Ordering::Relaxed);
                ctx.out.pltgot_symbols.push(sym);
            } else {
                let index = ctx.out.plt_symbols.len() as i64;
                sym.plt_idx.store(index, Ordering::Relaxed);
                // Jump slot in .got.plt, after the three reserved entries.
                sym.gotplt_idx.store(3 + index, Ordering::Relaxed);
                ctx.out.plt_symbols.push(sym);
            }
        }

        if flags.contains(NeedsFlags::GOTTPOFF) {
            sym.gottpoff_idx.store(got_slots as i64, Ordering::Relaxed);
            ctx.out.got_entries.push(GotEntry::GotTpOff(sym));
            got_slots += 1;
        }

        if flags.contains(NeedsFlags::TLSGD) {
            sym.tlsgd_idx.store(got_slots as i64, Ordering::Relaxed);
            ctx.out.got_entries.push(GotEntry::TlsGd(sym));
            got_slots += 2;
        }

        if flags.contains(NeedsFlags::TLSLD) {
            let slot = match tlsld_slot {
                Some(slot) => slot,
                None => {
                    let slot = got_slots;
                    ctx.out.got_entries.push(GotEntry::TlsLd);
                    got_slots += 2;
                    tlsld_slot = Some(slot);
                    slot
                }
            };
            sym.tlsld_idx.store(slot as i64, Ordering::Relaxed);
        }

        if flags.contains(NeedsFlags::COPYREL) {
            allocate_copy_relocation(ctx, sym);
        }
    }

    ctx.out.got.sh_size = got_slots * elf::GOT_ENTRY_SIZE;
    ctx.out.plt.sh_size = ctx.out.plt_symbols.len() as u64 * elf::PLT_ENTRY_SIZE;
    ctx.out.pltgot.sh_size = ctx.out.pltgot_symbols.len() as u64 * 8;
    ctx.out.gotplt.sh_size = if ctx.out.plt_symbols.is_empty() && !ctx.is_dynamic_output() {
        0
    } else {
        (3 + ctx.out.plt_symbols.len() as u64) * 8
    };
    ctx.out.relplt.sh_size =
        ctx.out.plt_symbols.len() as u64 * size_of::<elf::Rela>() as u64;

    let reldyn_count = ctx
        .out
        .got_entries
        .iter()
        .map(|entry| ctx.dyn_reloc_count(entry))
        .sum::<u64>()
        + ctx.out.copyrel_symbols.len() as u64;
    ctx.out.reldyn_count = reldyn_count;
    ctx.out.reldyn.sh_size = reldyn_count * size_of::<elf::Rela>() as u64;
}

fn push_dynsym<'data>(ctx: &mut LinkContext<'_, 'data>, sym: &'data Symbol<'data>) {
    if sym.dynsym_idx.load(Ordering::Relaxed) >= 0 {
        return;
    }
    // Mark as pending; real indices are handed out by `sort_dynsym`.
    sym.dynsym_idx.store(i64::MAX, Ordering::Relaxed);
    ctx.out.dynsym.push(sym);
    ctx.out.dynstr.add(sym.name);
}

fn allocate_copy_relocation<'data>(
    ctx: &mut LinkContext<'_, 'data>,
    sym: &'data Symbol<'data>,
) {
    let def = sym.def();
    let Some(InputRef::Shared(dso)) = def.file else {
        return;
    };
    let readonly = dso.is_readonly(def.value);
    let chunk = if readonly {
        ChunkId::CopyrelRelro
    } else {
        ChunkId::Copyrel
    };

    // All dynamic symbols at the same address in the shared object alias the copied bytes, so
    // they are redirected as a set.
    let dso_value = def.value;
    let size = def.size.max(1);
    let hdr = ctx.out.hdr_mut(chunk);
    let offset = crate::elf::align_to(hdr.sh_size, 64);
    hdr.sh_size = offset + size;
    ctx.out.copyrel_symbols.push(sym);

    for (alias_index, alias) in dso.find_aliases(dso_value) {
        alias.update_def(|d| {
            d.placement = SymbolPlacement::OutputChunk(chunk);
            d.value = offset;
            d.has_copyrel = true;
            d.copyrel_readonly = readonly;
            d.ver_idx = dso.ver_idx(alias_index);
        });
        alias.set_flags(NeedsFlags::DYNSYM);
        if ctx.is_dynamic_output() {
            push_dynsym(ctx, alias);
        }
    }
}

/// Orders `.dynsym` and assigns final indices. Undefined and imported symbols come first in
/// allocation order; defined symbols follow, grouped by their `.gnu.hash` bucket, which is what
/// the GNU hash format requires.
#[tracing::instrument(skip_all, name = "Sort dynsym")]
pub(crate) fn sort_dynsym(ctx: &mut LinkContext) {
    let symbols = std::mem::take(&mut ctx.out.dynsym);
    let (defined, undefined): (Vec<_>, Vec<_>) = symbols
        .into_iter()
        .partition(|sym| is_hashed_in_dynsym(sym));

    let nbuckets = (defined.len() as u32).max(1);
    let mut defined = defined;
    defined.sort_by_cached_key(|sym| {
        (
            crate::elf::gnu_hash(sym.name) % nbuckets,
            sym.name.to_vec(),
        )
    });

    ctx.out.gnu_hash_nbuckets = nbuckets;
    ctx.out.gnu_hash_symndx = undefined.len() as u32 + 1;

    let mut ordered = undefined;
    ordered.extend(defined);
    for (i, sym) in ordered.iter().enumerate() {
        sym.dynsym_idx.store(i as i64 + 1, Ordering::Relaxed);
    }
    ctx.out.dynsym = ordered;

    let count = ctx.out.dynsym.len() as u64 + 1;
    ctx.out.dynsym_hdr.sh_size = count * size_of::<elf::Sym>() as u64;
    // Only the null entry is local.
    ctx.out.dynsym_hdr.sh_info = 1;

    // SysV hash: header, one bucket per symbol, one chain entry per symbol.
    ctx.out.hash.sh_size = (2 + count + count) * 4;
    // GNU hash: header, one bloom word, buckets, one chain word per hashed symbol.
    ctx.out.gnu_hash.sh_size =
        16 + 8 + u64::from(nbuckets) * 4 + defined_dynsym_count(ctx) * 4;
}

fn defined_dynsym_count(ctx: &LinkContext) -> u64 {
    ctx.out
        .dynsym
        .iter()
        .filter(|sym| is_hashed_in_dynsym(sym))
        .count() as u64
}

/// Whether the symbol is defined by our image from the dynamic loader's point of view, and so
/// must be findable through the hash tables. Copy-relocated symbols count: shared objects
/// resolve against the executable's copy.
fn is_hashed_in_dynsym(sym: &Symbol) -> bool {
    let def = sym.def();
    def.placement != SymbolPlacement::Undefined && (!def.is_imported || def.has_copyrel)
}

/// Builds `.gnu.version` and `.gnu.version_r`. One `Verneed` record per shared object that
/// provides versioned symbols, each with one `Vernaux` per distinct version; `vna_other`
/// numbers count up from just past the reserved range.
#[tracing::instrument(skip_all, name = "Fill verneed")]
pub(crate) fn fill_verneed<'data>(ctx: &mut LinkContext<'_, 'data>) {
    let mut versym = vec![0u16; ctx.out.dynsym.len() + 1];
    for entry in versym.iter_mut().skip(1) {
        *entry = object::elf::VER_NDX_GLOBAL;
    }

    // Imported symbols whose version index is outside the reserved range need a version
    // reference against their providing shared object.
    let mut versioned: Vec<(&'data crate::parsing::SharedFile<'data>, u16, usize)> = Vec::new();
    for (i, sym) in ctx.out.dynsym.iter().enumerate() {
        let def = sym.def();
        if let Some(InputRef::Shared(dso)) = def.file {
            if def.ver_idx > elf::VER_NDX_LAST_RESERVED {
                versioned.push((dso, def.ver_idx, i + 1));
            }
        }
    }
    versioned.sort_by(|a, b| (&a.0.soname, a.1).cmp(&(&b.0.soname, b.1)));

    let mut contents = Vec::new();
    let mut verneed_count = 0u32;
    let mut next_other = elf::VER_NDX_LAST_RESERVED;
    let mut current_dso: Option<*const crate::parsing::SharedFile> = None;
    let mut current_ver: u16 = 0;
    let mut verneed_pos: Option<usize> = None;
    let mut aux_pos: Option<usize> = None;

    for (dso, ver_idx, dynsym_idx) in versioned {
        let dso_ptr = dso as *const _;
        if current_dso != Some(dso_ptr) {
            // Chain the previous record to this one.
            if let Some(pos) = verneed_pos {
                let offset = contents.len() - pos;
                patch_u32(&mut contents, pos + 12, offset as u32);
            }
            verneed_count += 1;
            verneed_pos = Some(contents.len());
            aux_pos = None;
            let soname_offset = ctx.out.dynstr.add(dso.soname.as_bytes());
            let verneed = elf::Verneed {
                vn_version: object::U16::new(LE, 1),
                vn_cnt: object::U16::new(LE, 0),
                vn_file: object::U32::new(LE, soname_offset),
                vn_aux: object::U32::new(LE, size_of::<elf::Verneed>() as u32),
                vn_next: object::U32::new(LE, 0),
            };
            contents.extend_from_slice(object::bytes_of(&verneed));
            current_dso = Some(dso_ptr);
            current_ver = 0;
        }

        if current_ver != ver_idx {
            // Chain the previous aux to the new one.
            if let Some(pos) = aux_pos {
                patch_u32(&mut contents, pos + 12, size_of::<elf::Vernaux>() as u32);
            }
            let vn_pos = verneed_pos.unwrap();
            let cnt = u16::from_le_bytes([contents[vn_pos + 2], contents[vn_pos + 3]]) + 1;
            contents[vn_pos + 2..vn_pos + 4].copy_from_slice(&cnt.to_le_bytes());

            next_other += 1;
            aux_pos = Some(contents.len());
            let version_name = dso.version_name(ver_idx);
            let name_offset = ctx.out.dynstr.add(version_name);
            let aux = elf::Vernaux {
                vna_hash: object::U32::new(LE, elf::elf_hash(version_name)),
                vna_flags: object::U16::new(LE, 0),
                vna_other: object::U16::new(LE, next_other),
                vna_name: object::U32::new(LE, name_offset),
                vna_next: object::U32::new(LE, 0),
            };
            contents.extend_from_slice(object::bytes_of(&aux));
            current_ver = ver_idx;
        }

        versym[dynsym_idx] = next_other;
    }

    versym[0] = 0;
    // Without any version references there's nothing for .gnu.version to say.
    ctx.out.versym_hdr.sh_size = if verneed_count > 0 {
        versym.len() as u64 * 2
    } else {
        0
    };
    ctx.out.verneed_hdr.sh_size = contents.len() as u64;
    ctx.out.verneed_hdr.sh_info = verneed_count;
    ctx.out.versym = versym;
    ctx.out.verneed = contents;
    ctx.out.verneed_count = verneed_count;
}

fn patch_u32(contents: &mut [u8], pos: usize, value: u32) {
    contents[pos..pos + 4].copy_from_slice(&value.to_le_bytes());
}

/// Plans the `.dynamic` entries. Values that need final addresses stay symbolic until write
/// time; planning the list now fixes the section's size.
#[tracing::instrument(skip_all, name = "Plan dynamic section")]
pub(crate) fn plan_dynamic_section(ctx: &mut LinkContext) {
    if !ctx.is_dynamic_output() {
        return;
    }
    let mut entries = Vec::new();

    for dso in &ctx.dsos {
        let offset = ctx.out.dynstr.add(dso.soname.as_bytes());
        entries.push(DynEntry::Val(object::elf::DT_NEEDED, u64::from(offset)));
    }
    if let Some(soname) = &ctx.args.soname {
        let offset = ctx.out.dynstr.add(soname.as_bytes());
        entries.push(DynEntry::Val(object::elf::DT_SONAME, u64::from(offset)));
    }
    if !ctx.args.rpaths.is_empty() {
        let rpath = ctx.args.rpaths.join(":");
        let offset = ctx.out.dynstr.add(rpath.as_bytes());
        entries.push(DynEntry::Val(object::elf::DT_RUNPATH, u64::from(offset)));
    }

    if ctx.args.hash_style.includes_sysv() {
        entries.push(DynEntry::Addr(object::elf::DT_HASH, ChunkId::Hash));
    }
    if ctx.args.hash_style.includes_gnu() {
        entries.push(DynEntry::Addr(object::elf::DT_GNU_HASH, ChunkId::GnuHash));
    }
    entries.push(DynEntry::Addr(object::elf::DT_STRTAB, ChunkId::Dynstr));
    entries.push(DynEntry::Addr(object::elf::DT_SYMTAB, ChunkId::Dynsym));
    entries.push(DynEntry::Size(object::elf::DT_STRSZ, ChunkId::Dynstr));
    entries.push(DynEntry::Val(
        object::elf::DT_SYMENT,
        size_of::<elf::Sym>() as u64,
    ));
    entries.push(DynEntry::Addr(object::elf::DT_RELA, ChunkId::RelDyn));
    entries.push(DynEntry::Size(object::elf::DT_RELASZ, ChunkId::RelDyn));
    entries.push(DynEntry::Val(
        object::elf::DT_RELAENT,
        size_of::<elf::Rela>() as u64,
    ));
    if !ctx.out.plt_symbols.is_empty() {
        entries.push(DynEntry::Addr(object::elf::DT_JMPREL, ChunkId::RelPlt));
        entries.push(DynEntry::Size(object::elf::DT_PLTRELSZ, ChunkId::RelPlt));
        entries.push(DynEntry::Val(
            object::elf::DT_PLTREL,
            u64::from(object::elf::DT_RELA),
        ));
    }
    if ctx.out.gotplt.sh_size > 0 {
        entries.push(DynEntry::Addr(object::elf::DT_PLTGOT, ChunkId::GotPlt));
    }
    if ctx.out.verneed_count > 0 {
        entries.push(DynEntry::Addr(object::elf::DT_VERNEED, ChunkId::Verneed));
        entries.push(DynEntry::Val(
            object::elf::DT_VERNEEDNUM,
            u64::from(ctx.out.verneed_count),
        ));
        entries.push(DynEntry::Addr(object::elf::DT_VERSYM, ChunkId::Versym));
    }
    // DT_INIT / DT_FINI are only emitted when the symbol actually exists; loaders call through
    // the tag blindly.
    for (tag, name) in [
        (object::elf::DT_INIT, &ctx.args.init),
        (object::elf::DT_FINI, &ctx.args.fini),
    ] {
        if let Some(sym) = ctx.symbol_db.get(name.as_bytes()) {
            if sym.def().placement != SymbolPlacement::Undefined {
                entries.push(DynEntry::SymbolAddr(tag, name.as_bytes().to_vec()));
            }
        }
    }
    entries.push(DynEntry::Val(
        object::elf::DT_FLAGS,
        u64::from(object::elf::DF_BIND_NOW),
    ));
    // DF_1_PIE is absent from the object crate's constants.
    const DF_1_PIE: u64 = 0x0800_0000;
    let mut flags_1 = u64::from(object::elf::DF_1_NOW);
    if ctx.args.pie {
        flags_1 |= DF_1_PIE;
    }
    entries.push(DynEntry::Val(object::elf::DT_FLAGS_1, flags_1));
    if !ctx.args.is_shared() {
        entries.push(DynEntry::Val(object::elf::DT_DEBUG, 0));
    }
    entries.push(DynEntry::Val(object::elf::DT_NULL, 0));

    ctx.out.dynamic.sh_size =
        entries.len() as u64 * size_of::<elf::DynamicEntry>() as u64;
    ctx.out.dynamic_entries = entries;

    ctx.out.dynstr_hdr.sh_size = ctx.out.dynstr.len();
    if let Some(interp) = &ctx.args.dynamic_linker {
        ctx.out.interp.sh_size = interp.len() as u64 + 1;
    } else {
        ctx.out.interp.sh_size = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versym_reserved_entries() {
        // Entry 0 of .gnu.version is always 0; unversioned symbols get VER_NDX_GLOBAL.
        let versym = [0u16, object::elf::VER_NDX_GLOBAL];
        assert_eq!(versym[0], 0);
        assert_eq!(versym[1], 1);
        assert_eq!(elf::VER_NDX_LAST_RESERVED + 1, 2);
    }
}
