//! Writes every chunk into the output image. Chunks are written in parallel; within a chunk,
//! input sections are copied then patched by the relocation applier.

use crate::context::DynEntry;
use crate::context::GotEntry;
use crate::context::LinkContext;
use crate::context::PlannedSym;
use crate::context::SymTarget;
use crate::elf;
use crate::elf::LE;
use crate::elf::align_to;
use crate::error::LinkError;
use crate::error::Result;
use crate::output_sections::ChunkId;
use crate::output_sections::ChunkKind;
use crate::parsing::InputSection;
use crate::parsing::ObjectFile;
use crate::parsing::SectionSlot;
use crate::symbol_db::Symbol;
use crate::symbol_db::SymbolPlacement;
use crate::x86_64;
use crate::x86_64::RelValue;
use anyhow::anyhow;
use object::U16;
use object::U32;
use object::U64;
use object::read::elf::Sym as _;
use rayon::iter::IntoParallelIterator;
use rayon::iter::ParallelIterator;
use std::sync::atomic::Ordering;

/// Plans `.symtab` / `.strtab`. Local symbols from every file come first, then the globals each
/// file won, then the linker-synthesised symbols.
#[tracing::instrument(skip_all, name = "Compute symtab")]
pub(crate) fn compute_symtab<'data>(ctx: &mut LinkContext<'_, 'data>) {
    if ctx.args.strip_all {
        return;
    }
    let mut locals: Vec<PlannedSym<'data>> = Vec::new();
    let mut globals: Vec<PlannedSym<'data>> = Vec::new();

    for &file in &ctx.objs {
        let elf_syms = file.elf_syms();
        for (i, esym) in elf_syms.iter().enumerate().skip(1) {
            if i >= file.first_global() {
                break;
            }
            if matches!(
                esym.st_type(),
                object::elf::STT_SECTION | object::elf::STT_FILE
            ) {
                continue;
            }
            let Ok(name) = file.file.symbol_name(esym) else {
                continue;
            };
            if name.is_empty() {
                continue;
            }
            let shndx = esym.st_shndx(LE);
            let target = if shndx == object::elf::SHN_ABS {
                SymTarget::Absolute(esym.st_value(LE))
            } else {
                match file.sections.get(usize::from(shndx)) {
                    Some(SectionSlot::Regular(section)) if section.alive() => SymTarget::Section {
                        file,
                        shndx: u32::from(shndx),
                        value: esym.st_value(LE),
                    },
                    _ => continue,
                }
            };
            locals.push(PlannedSym {
                name_offset: ctx.out.strtab.add(name),
                st_info: esym.st_info,
                st_other: esym.st_other,
                size: esym.st_size(LE),
                target,
            });
        }

        for i in file.first_global()..elf_syms.len() {
            let sym = file.global(i);
            let def = sym.def();
            if !matches!(def.file, Some(crate::parsing::InputRef::Object(o)) if std::ptr::eq(o, file))
            {
                continue;
            }
            let bind = if def.is_weak {
                object::elf::STB_WEAK
            } else {
                object::elf::STB_GLOBAL
            };
            globals.push(PlannedSym {
                name_offset: ctx.out.strtab.add(sym.name),
                st_info: (bind << 4) | def.sym_type,
                st_other: def.visibility,
                size: def.size,
                target: SymTarget::Global(sym),
            });
        }
    }

    for &sym in &ctx.synthetic_symbols {
        globals.push(PlannedSym {
            name_offset: ctx.out.strtab.add(sym.name),
            st_info: object::elf::STB_GLOBAL << 4,
            st_other: object::elf::STV_DEFAULT,
            size: 0,
            target: SymTarget::Global(sym),
        });
    }

    let count = 1 + locals.len() as u64 + globals.len() as u64;
    ctx.out.symtab.sh_size = count * size_of::<elf::Sym>() as u64;
    ctx.out.symtab.sh_info = 1 + locals.len() as u32;
    ctx.out.strtab_hdr.sh_size = ctx.out.strtab.len();
    ctx.out.symtab_locals = locals;
    ctx.out.symtab_globals = globals;
}

/// Records the bounds of the TLS segment. TPOFF values are computed relative to `tls_end`.
pub(crate) fn compute_tls_bounds(ctx: &mut LinkContext) {
    let mut begin = 0u64;
    let mut end = 0u64;
    let mut align = 1u64;
    for &id in &ctx.out.chunks {
        let hdr = ctx.out.hdr(id);
        if hdr.sh_flags & u64::from(object::elf::SHF_TLS) == 0 || !hdr.is_alloc() {
            continue;
        }
        if begin == 0 {
            begin = hdr.sh_addr;
        }
        end = end.max(hdr.sh_addr + hdr.sh_size);
        align = align.max(hdr.sh_addralign);
    }
    ctx.out.tls_begin = begin;
    ctx.out.tls_end = align_to(end, align);
}

/// Sizes `.eh_frame_hdr` from the FDE count of the surviving `.eh_frame` sections.
pub(crate) fn compute_eh_frame_hdr_size(ctx: &mut LinkContext) {
    if !ctx.args.eh_frame_hdr {
        ctx.out.eh_frame_hdr.sh_size = 0;
        return;
    }
    let count = eh_frame_records(ctx)
        .filter(|record| record.is_fde)
        .count() as u64;
    ctx.out.eh_frame_hdr.sh_size = 12 + 8 * count;
}

/// The top-level write: split the buffer into per-chunk windows and fill them in parallel.
/// Gaps between chunks stay zero, which the split enforces by construction.
#[tracing::instrument(skip_all, name = "Copy chunks")]
pub(crate) fn write_output(ctx: &LinkContext, buffer: &mut [u8]) -> Result {
    let chunk_buffers = split_output(ctx, buffer);
    chunk_buffers
        .into_par_iter()
        .for_each(|(id, out)| copy_chunk(ctx, id, out));
    ctx.diag.checkpoint()
}

fn split_output<'out>(
    ctx: &LinkContext,
    buffer: &'out mut [u8],
) -> Vec<(ChunkId, &'out mut [u8])> {
    let mut result = Vec::with_capacity(ctx.out.chunks.len());
    let mut rest = buffer;
    let mut pos = 0u64;
    for &id in &ctx.out.chunks {
        let hdr = ctx.out.hdr(id);
        if hdr.is_nobits() || hdr.sh_size == 0 {
            continue;
        }
        let gap = (hdr.sh_offset - pos) as usize;
        let (padding, after_padding) = rest.split_at_mut(gap);
        // Gaps between chunks are zero-filled.
        padding.fill(0);
        let (chunk, after_chunk) = after_padding.split_at_mut(hdr.sh_size as usize);
        rest = after_chunk;
        pos = hdr.sh_offset + hdr.sh_size;
        result.push((id, chunk));
    }
    rest.fill(0);
    result
}

fn copy_chunk(ctx: &LinkContext, id: ChunkId, out: &mut [u8]) {
    match id {
        ChunkId::Ehdr => write_ehdr(ctx, out),
        ChunkId::Phdr => write_phdrs(ctx, out),
        ChunkId::Shdr => write_shdrs(ctx, out),
        ChunkId::Interp => {
            if let Some(interp) = &ctx.args.dynamic_linker {
                out[..interp.len()].copy_from_slice(interp.as_bytes());
                out[interp.len()] = 0;
            }
        }
        ChunkId::Got => write_got(ctx, out),
        ChunkId::GotPlt => write_gotplt(ctx, out),
        ChunkId::Plt => write_plt(ctx, out),
        ChunkId::PltGot => write_pltgot(ctx, out),
        ChunkId::RelPlt => write_relplt(ctx, out),
        ChunkId::RelDyn => write_reldyn(ctx, out),
        ChunkId::Dynamic => write_dynamic(ctx, out),
        ChunkId::Dynsym => write_dynsym(ctx, out),
        ChunkId::Dynstr => out.copy_from_slice(ctx.out.dynstr.contents()),
        ChunkId::Hash => write_hash(ctx, out),
        ChunkId::GnuHash => write_gnu_hash(ctx, out),
        ChunkId::Versym => {
            for (i, &v) in ctx.out.versym.iter().enumerate() {
                out[i * 2..i * 2 + 2].copy_from_slice(&v.to_le_bytes());
            }
        }
        ChunkId::Verneed => out.copy_from_slice(&ctx.out.verneed),
        ChunkId::EhFrameHdr => write_eh_frame_hdr(ctx, out),
        ChunkId::BuildId => write_build_id_header(ctx, out),
        ChunkId::Symtab => write_symtab(ctx, out),
        ChunkId::Strtab => out.copy_from_slice(ctx.out.strtab.contents()),
        ChunkId::Shstrtab => out.copy_from_slice(ctx.out.shstrtab.contents()),
        ChunkId::Copyrel | ChunkId::CopyrelRelro | ChunkId::Common => {}
        ChunkId::Regular(index) => copy_regular_section(ctx, index, out),
        ChunkId::Merged(index) => copy_merged_section(ctx, index, out),
    }
}

fn write_pod<T: object::Pod>(out: &mut [u8], offset: usize, value: &T) {
    let bytes = object::bytes_of(value);
    out[offset..offset + bytes.len()].copy_from_slice(bytes);
}

fn write_ehdr(ctx: &LinkContext, out: &mut [u8]) {
    let entry_addr = ctx
        .symbol_db
        .get(ctx.entry_name.as_bytes())
        .map_or(0, |sym| ctx.symbol_addr(sym));

    let e_type = if ctx.args.is_relocatable() {
        object::elf::ET_DYN
    } else {
        object::elf::ET_EXEC
    };

    let header = elf::FileHeader {
        e_ident: object::elf::Ident {
            magic: object::elf::ELFMAG,
            class: object::elf::ELFCLASS64,
            data: object::elf::ELFDATA2LSB,
            version: object::elf::EV_CURRENT,
            os_abi: object::elf::ELFOSABI_SYSV,
            abi_version: 0,
            padding: [0; 7],
        },
        e_type: U16::new(LE, e_type),
        e_machine: U16::new(LE, object::elf::EM_X86_64),
        e_version: U32::new(LE, u32::from(object::elf::EV_CURRENT)),
        e_entry: U64::new(LE, entry_addr),
        e_phoff: U64::new(LE, ctx.out.phdr.sh_offset),
        e_shoff: U64::new(LE, ctx.out.shdr.sh_offset),
        e_flags: U32::new(LE, 0),
        e_ehsize: U16::new(LE, size_of::<elf::FileHeader>() as u16),
        e_phentsize: U16::new(LE, size_of::<elf::ProgramHeader>() as u16),
        e_phnum: U16::new(LE, ctx.out.segments.len() as u16),
        e_shentsize: U16::new(LE, size_of::<elf::SectionHeader>() as u16),
        e_shnum: U16::new(LE, (ctx.out.shdr.sh_size / 64) as u16),
        e_shstrndx: U16::new(LE, ctx.out.shstrtab_hdr.shndx as u16),
    };
    write_pod(out, 0, &header);
}

fn write_phdrs(ctx: &LinkContext, out: &mut [u8]) {
    for (i, plan) in ctx.out.segments.iter().enumerate() {
        let mut phdr = elf::ProgramHeader {
            p_type: U32::new(LE, plan.p_type),
            p_flags: U32::new(LE, plan.p_flags),
            p_offset: U64::new(LE, 0),
            p_vaddr: U64::new(LE, 0),
            p_paddr: U64::new(LE, 0),
            p_filesz: U64::new(LE, 0),
            p_memsz: U64::new(LE, 0),
            p_align: U64::new(LE, if plan.p_type == object::elf::PT_LOAD {
                elf::PAGE_SIZE
            } else {
                0x10
            }),
        };
        if plan.first_chunk != usize::MAX {
            let covered: Vec<&crate::output_sections::SectionHdr> = ctx.out.chunks
                [plan.first_chunk..=plan.last_chunk]
                .iter()
                .map(|&id| ctx.out.hdr(id))
                .collect();
            let first = covered.first().unwrap();
            let file_end = covered.iter().map(|h| h.file_end()).max().unwrap();
            let mem_end = covered
                .iter()
                .filter(|h| h.is_alloc())
                .map(|h| h.sh_addr + h.sh_size)
                .max()
                .unwrap_or(first.sh_addr);
            let align = covered
                .iter()
                .map(|h| h.sh_addralign)
                .max()
                .unwrap_or(1);

            phdr.p_offset = U64::new(LE, first.sh_offset);
            phdr.p_vaddr = U64::new(LE, first.sh_addr);
            phdr.p_paddr = U64::new(LE, first.sh_addr);
            phdr.p_filesz = U64::new(LE, file_end - first.sh_offset);
            phdr.p_memsz = U64::new(LE, mem_end - first.sh_addr);
            if plan.p_type == object::elf::PT_TLS {
                phdr.p_align = U64::new(LE, align);
            }
        }
        write_pod(out, i * size_of::<elf::ProgramHeader>(), &phdr);
    }
}

fn write_shdrs(ctx: &LinkContext, out: &mut [u8]) {
    // Index 0 stays all-zero.
    let mut offset = size_of::<elf::SectionHeader>();
    for &id in &ctx.out.chunks {
        if id.kind() == ChunkKind::Header {
            continue;
        }
        let hdr = ctx.out.hdr(id);
        let (sh_link, sh_info) = section_links(ctx, id);
        let shdr = elf::SectionHeader {
            sh_name: U32::new(LE, ctx.out.shstrtab.get(&hdr.name)),
            sh_type: U32::new(LE, hdr.sh_type),
            sh_flags: U64::new(LE, hdr.sh_flags),
            sh_addr: U64::new(LE, hdr.sh_addr),
            sh_offset: U64::new(LE, hdr.sh_offset),
            sh_size: U64::new(LE, hdr.sh_size),
            sh_link: U32::new(LE, sh_link),
            sh_info: U32::new(LE, sh_info),
            sh_addralign: U64::new(LE, hdr.sh_addralign),
            sh_entsize: U64::new(LE, hdr.sh_entsize),
        };
        write_pod(out, offset, &shdr);
        offset += size_of::<elf::SectionHeader>();
    }
}

fn section_links(ctx: &LinkContext, id: ChunkId) -> (u32, u32) {
    match id {
        ChunkId::Dynsym => (ctx.out.dynstr_hdr.shndx, ctx.out.dynsym_hdr.sh_info),
        ChunkId::Symtab => (ctx.out.strtab_hdr.shndx, ctx.out.symtab.sh_info),
        ChunkId::RelPlt => (ctx.out.dynsym_hdr.shndx, ctx.out.gotplt.shndx),
        ChunkId::RelDyn => (ctx.out.dynsym_hdr.shndx, 0),
        ChunkId::Dynamic => (ctx.out.dynstr_hdr.shndx, 0),
        ChunkId::Hash | ChunkId::GnuHash | ChunkId::Versym => (ctx.out.dynsym_hdr.shndx, 0),
        ChunkId::Verneed => (ctx.out.dynstr_hdr.shndx, ctx.out.verneed_hdr.sh_info),
        _ => {
            let hdr = ctx.out.hdr(id);
            (hdr.sh_link, hdr.sh_info)
        }
    }
}

fn write_got(ctx: &LinkContext, out: &mut [u8]) {
    let mut slot = 0usize;
    let mut write_slot = |slot: usize, value: u64| {
        out[slot * 8..slot * 8 + 8].copy_from_slice(&value.to_le_bytes());
    };
    for entry in &ctx.out.got_entries {
        match entry {
            GotEntry::Got(sym) => {
                let def = sym.def();
                let value = if def.is_imported { 0 } else { ctx.symbol_addr(sym) };
                write_slot(slot, value);
            }
            GotEntry::GotTpOff(sym) => {
                let def = sym.def();
                let value = if def.is_imported || ctx.args.is_shared() {
                    0
                } else {
                    ctx.symbol_addr(sym).wrapping_sub(ctx.out.tls_end)
                };
                write_slot(slot, value);
            }
            GotEntry::TlsGd(_) | GotEntry::TlsLd => {
                write_slot(slot, 0);
                write_slot(slot + 1, 0);
            }
        }
        slot += entry.num_slots() as usize;
    }
}

fn write_gotplt(ctx: &LinkContext, out: &mut [u8]) {
    // Slot 0 holds the address of .dynamic; 1 and 2 are reserved for the loader. Jump slots
    // are filled by the loader through .rela.plt.
    out[..8].copy_from_slice(&ctx.out.dynamic.sh_addr.to_le_bytes());
}

fn write_plt(ctx: &LinkContext, out: &mut [u8]) {
    for (i, sym) in ctx.out.plt_symbols.iter().enumerate() {
        let entry_offset = i * elf::PLT_ENTRY_SIZE as usize;
        let entry_addr = ctx.out.plt.sh_addr + entry_offset as u64;
        let slot_index = sym.index(&sym.gotplt_idx).unwrap_or(0);
        let slot_addr = ctx.out.gotplt.sh_addr + slot_index * 8;
        out[entry_offset..entry_offset + 16].copy_from_slice(&x86_64::PLT_ENTRY_TEMPLATE);
        let disp = slot_addr.wrapping_sub(entry_addr + x86_64::PLT_JMP_END) as u32;
        out[entry_offset + x86_64::PLT_JMP_DISP_OFFSET
            ..entry_offset + x86_64::PLT_JMP_DISP_OFFSET + 4]
            .copy_from_slice(&disp.to_le_bytes());
    }
}

fn write_pltgot(ctx: &LinkContext, out: &mut [u8]) {
    for (i, sym) in ctx.out.pltgot_symbols.iter().enumerate() {
        let entry_offset = i * 8;
        let entry_addr = ctx.out.pltgot.sh_addr + entry_offset as u64;
        let slot_addr = ctx.got_addr(sym);
        out[entry_offset..entry_offset + 8].copy_from_slice(&x86_64::PLTGOT_ENTRY_TEMPLATE);
        let disp = slot_addr.wrapping_sub(entry_addr + 6) as u32;
        out[entry_offset + 2..entry_offset + 6].copy_from_slice(&disp.to_le_bytes());
    }
}

fn make_rela(r_offset: u64, sym: u64, r_type: u32, addend: i64) -> elf::Rela {
    elf::Rela {
        r_offset: U64::new(LE, r_offset),
        r_info: U64::new(LE, (sym << 32) | u64::from(r_type)),
        r_addend: object::I64::new(LE, addend),
    }
}

fn write_relplt(ctx: &LinkContext, out: &mut [u8]) {
    for (i, sym) in ctx.out.plt_symbols.iter().enumerate() {
        let def = sym.def();
        let slot_index = sym.index(&sym.gotplt_idx).unwrap_or(0);
        let slot_addr = ctx.out.gotplt.sh_addr + slot_index * 8;
        let rela = if def.is_imported {
            let dynsym_idx = sym.index(&sym.dynsym_idx).unwrap_or(0);
            make_rela(slot_addr, dynsym_idx, object::elf::R_X86_64_JUMP_SLOT, 0)
        } else {
            // A locally defined ifunc: the loader runs the resolver and stores the result.
            // `symbol_addr` only redirects imported symbols to their PLT, so this is the
            // resolver's own address.
            make_rela(
                slot_addr,
                0,
                object::elf::R_X86_64_IRELATIVE,
                ctx.symbol_addr(sym) as i64,
            )
        };
        write_pod(out, i * size_of::<elf::Rela>(), &rela);
    }
}

fn write_reldyn(ctx: &LinkContext, out: &mut [u8]) {
    let mut index = 0usize;
    let mut push = |rela: elf::Rela| {
        write_pod(out, index * size_of::<elf::Rela>(), &rela);
        index += 1;
    };

    let mut slot = 0u64;
    for entry in &ctx.out.got_entries {
        let slot_addr = ctx.out.got.sh_addr + slot * 8;
        match entry {
            GotEntry::Got(sym) => {
                let def = sym.def();
                if def.is_imported {
                    let dynsym_idx = sym.index(&sym.dynsym_idx).unwrap_or(0);
                    push(make_rela(
                        slot_addr,
                        dynsym_idx,
                        object::elf::R_X86_64_GLOB_DAT,
                        0,
                    ));
                } else if ctx.args.is_relocatable() {
                    push(make_rela(
                        slot_addr,
                        0,
                        object::elf::R_X86_64_RELATIVE,
                        ctx.symbol_addr(sym) as i64,
                    ));
                }
            }
            GotEntry::GotTpOff(sym) => {
                let def = sym.def();
                if def.is_imported {
                    let dynsym_idx = sym.index(&sym.dynsym_idx).unwrap_or(0);
                    push(make_rela(
                        slot_addr,
                        dynsym_idx,
                        object::elf::R_X86_64_TPOFF64,
                        0,
                    ));
                } else if ctx.args.is_shared() {
                    let offset = ctx.symbol_addr(sym).wrapping_sub(ctx.out.tls_begin);
                    push(make_rela(
                        slot_addr,
                        0,
                        object::elf::R_X86_64_TPOFF64,
                        offset as i64,
                    ));
                }
            }
            GotEntry::TlsGd(sym) => {
                let dynsym_idx = sym.index(&sym.dynsym_idx).unwrap_or(0);
                push(make_rela(
                    slot_addr,
                    dynsym_idx,
                    object::elf::R_X86_64_DTPMOD64,
                    0,
                ));
                push(make_rela(
                    slot_addr + 8,
                    dynsym_idx,
                    object::elf::R_X86_64_DTPOFF64,
                    0,
                ));
            }
            GotEntry::TlsLd => {
                push(make_rela(slot_addr, 0, object::elf::R_X86_64_DTPMOD64, 0));
            }
        }
        slot += entry.num_slots();
    }

    for sym in &ctx.out.copyrel_symbols {
        let dynsym_idx = sym.index(&sym.dynsym_idx).unwrap_or(0);
        push(make_rela(
            ctx.symbol_addr(sym),
            dynsym_idx,
            object::elf::R_X86_64_COPY,
            0,
        ));
    }
}

fn write_dynamic(ctx: &LinkContext, out: &mut [u8]) {
    for (i, entry) in ctx.out.dynamic_entries.iter().enumerate() {
        let (tag, value) = match entry {
            DynEntry::Val(tag, value) => (*tag, *value),
            DynEntry::Addr(tag, id) => (*tag, ctx.out.hdr(*id).sh_addr),
            DynEntry::Size(tag, id) => (*tag, ctx.out.hdr(*id).sh_size),
            DynEntry::SymbolAddr(tag, name) => (
                *tag,
                ctx.symbol_db
                    .get(name)
                    .map_or(0, |sym| ctx.symbol_addr(sym)),
            ),
        };
        let dyn_entry = elf::DynamicEntry {
            d_tag: U64::new(LE, u64::from(tag)),
            d_val: U64::new(LE, value),
        };
        write_pod(out, i * size_of::<elf::DynamicEntry>(), &dyn_entry);
    }
}

/// The symbol table entry fields shared by `.dynsym` and `.symtab`.
fn symbol_shndx_and_value(ctx: &LinkContext, sym: &Symbol) -> (u16, u64) {
    let def = sym.def();
    if def.is_imported && !def.has_copyrel {
        return (object::elf::SHN_UNDEF, 0);
    }
    match def.placement {
        SymbolPlacement::Undefined | SymbolPlacement::Common => (object::elf::SHN_UNDEF, 0),
        SymbolPlacement::Absolute => (object::elf::SHN_ABS, def.value),
        SymbolPlacement::OutputChunk(id) => {
            let hdr = ctx.out.hdr(id);
            (hdr.shndx as u16, hdr.sh_addr + def.value)
        }
        SymbolPlacement::Section(shndx) => {
            let Some(crate::parsing::InputRef::Object(file)) = def.file else {
                return (object::elf::SHN_UNDEF, 0);
            };
            match &file.sections[shndx as usize] {
                SectionSlot::Regular(isec) if isec.alive() => {
                    let osec = &ctx.out.regular[isec.output_section as usize];
                    (
                        osec.hdr.shndx as u16,
                        osec.hdr.sh_addr + isec.offset.load(Ordering::Relaxed) + def.value,
                    )
                }
                SectionSlot::Merge(_) => match file.sym_pieces.get(def.sym_idx as usize) {
                    Some(Some(piece_ref)) => {
                        let merged = &ctx.out.merged[piece_ref.merged_id as usize];
                        (
                            merged.hdr.shndx as u16,
                            merged.hdr.sh_addr
                                + piece_ref.piece.offset.load(Ordering::Relaxed)
                                + piece_ref.addend,
                        )
                    }
                    _ => (object::elf::SHN_UNDEF, 0),
                },
                _ => (object::elf::SHN_UNDEF, 0),
            }
        }
    }
}

fn write_dynsym(ctx: &LinkContext, out: &mut [u8]) {
    for (i, sym) in ctx.out.dynsym.iter().enumerate() {
        let def = sym.def();
        let (shndx, value) = symbol_shndx_and_value(ctx, sym);
        let bind = if def.is_weak && !def.is_imported {
            object::elf::STB_WEAK
        } else {
            object::elf::STB_GLOBAL
        };
        let entry = elf::Sym {
            st_name: U32::new(LE, ctx.out.dynstr.get(sym.name)),
            st_info: (bind << 4) | def.sym_type,
            st_other: def.visibility,
            st_shndx: U16::new(LE, shndx),
            st_value: U64::new(LE, value),
            st_size: U64::new(LE, def.size),
        };
        write_pod(out, (i + 1) * size_of::<elf::Sym>(), &entry);
    }
}

fn write_symtab(ctx: &LinkContext, out: &mut [u8]) {
    let mut offset = size_of::<elf::Sym>();
    for planned in ctx
        .out
        .symtab_locals
        .iter()
        .chain(ctx.out.symtab_globals.iter())
    {
        let (shndx, value) = match &planned.target {
            SymTarget::Absolute(value) => (object::elf::SHN_ABS, *value),
            SymTarget::Global(sym) => symbol_shndx_and_value(ctx, sym),
            SymTarget::Section { file, shndx, value } => {
                match &file.sections[*shndx as usize] {
                    SectionSlot::Regular(isec) if isec.alive() => {
                        let osec = &ctx.out.regular[isec.output_section as usize];
                        (
                            osec.hdr.shndx as u16,
                            osec.hdr.sh_addr + isec.offset.load(Ordering::Relaxed) + value,
                        )
                    }
                    _ => (object::elf::SHN_UNDEF, 0),
                }
            }
        };
        let entry = elf::Sym {
            st_name: U32::new(LE, planned.name_offset),
            st_info: planned.st_info,
            st_other: planned.st_other,
            st_shndx: U16::new(LE, shndx),
            st_value: U64::new(LE, value),
            st_size: U64::new(LE, planned.size),
        };
        write_pod(out, offset, &entry);
        offset += size_of::<elf::Sym>();
    }
}

fn write_hash(ctx: &LinkContext, out: &mut [u8]) {
    let count = ctx.out.dynsym.len() as u32 + 1;
    let nbuckets = count;
    let mut write_word = |index: usize, value: u32| {
        out[index * 4..index * 4 + 4].copy_from_slice(&value.to_le_bytes());
    };
    write_word(0, nbuckets);
    write_word(1, count);
    let mut buckets = vec![0u32; nbuckets as usize];
    let mut chains = vec![0u32; count as usize];
    for (i, sym) in ctx.out.dynsym.iter().enumerate() {
        let index = i as u32 + 1;
        let bucket = (elf::elf_hash(sym.name) % nbuckets) as usize;
        chains[index as usize] = buckets[bucket];
        buckets[bucket] = index;
    }
    for (i, &b) in buckets.iter().enumerate() {
        write_word(2 + i, b);
    }
    for (i, &c) in chains.iter().enumerate() {
        write_word(2 + nbuckets as usize + i, c);
    }
}

fn write_gnu_hash(ctx: &LinkContext, out: &mut [u8]) {
    let nbuckets = ctx.out.gnu_hash_nbuckets;
    let symndx = ctx.out.gnu_hash_symndx;
    let header = elf::GnuHashHeader {
        bucket_count: U32::new(LE, nbuckets),
        symbol_base: U32::new(LE, symndx),
        bloom_count: U32::new(LE, 1),
        bloom_shift: U32::new(LE, 6),
    };
    write_pod(out, 0, &header);

    let hashed: Vec<(u32, usize)> = ctx
        .out
        .dynsym
        .iter()
        .enumerate()
        .filter(|(i, _)| (*i as u32 + 1) >= symndx)
        .map(|(i, sym)| (elf::gnu_hash(sym.name), i + 1))
        .collect();

    let mut bloom = 0u64;
    for (hash, _) in &hashed {
        bloom |= 1u64 << (hash % 64);
        bloom |= 1u64 << ((hash >> 6) % 64);
    }
    out[16..24].copy_from_slice(&bloom.to_le_bytes());

    let buckets_offset = 24;
    let chains_offset = buckets_offset + nbuckets as usize * 4;
    let mut buckets = vec![0u32; nbuckets as usize];
    let mut chains = vec![0u32; hashed.len()];
    for (pos, (hash, dynsym_index)) in hashed.iter().enumerate() {
        let bucket = (hash % nbuckets) as usize;
        if buckets[bucket] == 0 {
            buckets[bucket] = *dynsym_index as u32;
        }
        let last_in_bucket = hashed
            .get(pos + 1)
            .is_none_or(|(next_hash, _)| next_hash % nbuckets != hash % nbuckets);
        chains[pos] = (hash & !1) | u32::from(last_in_bucket);
    }
    for (i, &b) in buckets.iter().enumerate() {
        out[buckets_offset + i * 4..buckets_offset + i * 4 + 4]
            .copy_from_slice(&b.to_le_bytes());
    }
    for (i, &c) in chains.iter().enumerate() {
        out[chains_offset + i * 4..chains_offset + i * 4 + 4].copy_from_slice(&c.to_le_bytes());
    }
}

fn write_build_id_header(ctx: &LinkContext, out: &mut [u8]) {
    let desc_size = ctx.out.buildid.sh_size as usize - 16;
    let note = elf::NoteHeader {
        n_namesz: U32::new(LE, 4),
        n_descsz: U32::new(LE, desc_size as u32),
        n_type: U32::new(LE, object::elf::NT_GNU_BUILD_ID),
    };
    write_pod(out, 0, &note);
    out[12..16].copy_from_slice(b"GNU\0");
    // The digest itself is patched in after the whole image has been written.
}

struct EhFrameRecord<'data> {
    file: &'data ObjectFile<'data>,
    section_index: u32,
    /// Offset of the record within its input section.
    record_offset: u64,
    is_fde: bool,
}

fn eh_frame_records<'a, 'data>(
    ctx: &'a LinkContext<'_, 'data>,
) -> impl Iterator<Item = EhFrameRecord<'data>> + 'a {
    ctx.out
        .regular
        .iter()
        .filter(|osec| osec.hdr.name == b".eh_frame")
        .flat_map(|osec| osec.members.iter())
        .flat_map(|member| {
            let isec = member.get();
            let mut records = Vec::new();
            let data = isec.data;
            let mut pos = 0usize;
            while pos + 8 <= data.len() {
                let len = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap());
                if len == 0 || len == u32::MAX {
                    break;
                }
                let cie_ptr = u32::from_le_bytes(data[pos + 4..pos + 8].try_into().unwrap());
                records.push(EhFrameRecord {
                    file: member.file,
                    section_index: member.index,
                    record_offset: pos as u64,
                    is_fde: cie_ptr != 0,
                });
                pos += 4 + len as usize;
            }
            records
        })
}

/// Builds `.eh_frame_hdr`: a binary-search table of (pc, fde) pairs. The initial-location
/// value of each FDE is recovered from the relocation that targets it, which sidesteps any
/// dependency on the order chunks are written in.
fn write_eh_frame_hdr(ctx: &LinkContext, out: &mut [u8]) {
    let hdr_addr = ctx.out.eh_frame_hdr.sh_addr;
    let Some(eh_frame_osec) = ctx
        .out
        .regular
        .iter()
        .find(|osec| osec.hdr.name == b".eh_frame")
    else {
        return;
    };
    let eh_frame_addr = eh_frame_osec.hdr.sh_addr;

    let mut entries: Vec<(i64, i64)> = Vec::new();
    for record in eh_frame_records(ctx) {
        if !record.is_fde {
            continue;
        }
        let Some(isec) = record.file.regular_section(record.section_index as usize) else {
            continue;
        };
        let field_offset = record.record_offset + 8;
        let fde_addr =
            eh_frame_addr + isec.offset.load(Ordering::Relaxed) + record.record_offset;
        let field_addr = fde_addr + 8;
        let pc = match initial_location(ctx, record.file, isec, field_offset) {
            Some(pc) => pc,
            None => {
                let raw = i32::from_le_bytes(
                    isec.data[field_offset as usize..field_offset as usize + 4]
                        .try_into()
                        .unwrap(),
                );
                field_addr.wrapping_add_signed(i64::from(raw))
            }
        };
        entries.push(((pc as i64) - hdr_addr as i64, (fde_addr as i64) - hdr_addr as i64));
    }
    entries.sort_unstable();

    out[0] = 1; // version
    out[1] = 0x1b; // eh_frame_ptr: pcrel sdata4
    out[2] = 0x03; // fde_count: udata4
    out[3] = 0x3b; // table: datarel sdata4
    let eh_frame_ptr = (eh_frame_addr as i64 - (hdr_addr as i64 + 4)) as i32;
    out[4..8].copy_from_slice(&eh_frame_ptr.to_le_bytes());
    out[8..12].copy_from_slice(&(entries.len() as u32).to_le_bytes());
    for (i, (pc, fde)) in entries.iter().enumerate() {
        let base = 12 + i * 8;
        out[base..base + 4].copy_from_slice(&(*pc as i32).to_le_bytes());
        out[base + 4..base + 8].copy_from_slice(&(*fde as i32).to_le_bytes());
    }
}

/// Computes S + A for the relocation at `field_offset` within the section, i.e. the value a
/// PC-relative relocation there will resolve the field to point at.
fn initial_location<'a, 'data>(
    ctx: &LinkContext<'a, 'data>,
    file: &ObjectFile<'data>,
    isec: &InputSection,
    field_offset: u64,
) -> Option<u64> {
    let rel_index = isec
        .relocations
        .binary_search_by_key(&field_offset, |rel| rel.r_offset.get(LE))
        .ok()?;
    let rel = &isec.relocations[rel_index];
    let sym_index = rel.r_sym(LE, false) as usize;
    let addend = rel.r_addend.get(LE);
    let s = if sym_index < file.first_global() {
        local_symbol_addr(ctx, file, sym_index)?
    } else {
        ctx.symbol_addr(file.global(sym_index))
    };
    Some(s.wrapping_add_signed(addend))
}

fn local_symbol_addr<'a, 'data>(
    ctx: &LinkContext<'a, 'data>,
    file: &ObjectFile<'data>,
    sym_index: usize,
) -> Option<u64> {
    let esym = file.elf_syms().get(sym_index)?;
    let shndx = esym.st_shndx(LE);
    if shndx == object::elf::SHN_ABS {
        return Some(esym.st_value(LE));
    }
    if let Some(Some(piece_ref)) = file.sym_pieces.get(sym_index) {
        let merged = &ctx.out.merged[piece_ref.merged_id as usize];
        return Some(
            merged.hdr.sh_addr + piece_ref.piece.offset.load(Ordering::Relaxed) + piece_ref.addend,
        );
    }
    match file.sections.get(usize::from(shndx))? {
        SectionSlot::Regular(section) if section.alive() => {
            let osec = &ctx.out.regular[section.output_section as usize];
            Some(osec.hdr.sh_addr + section.offset.load(Ordering::Relaxed) + esym.st_value(LE))
        }
        _ => None,
    }
}

fn copy_merged_section(ctx: &LinkContext, index: u32, out: &mut [u8]) {
    for &file in &ctx.objs {
        for (ordinal, slot) in file.sections.iter().enumerate() {
            let SectionSlot::Merge(msec) = slot else {
                continue;
            };
            if msec.merged_id != index || !msec.is_alive.load(Ordering::Relaxed) {
                continue;
            }
            let key = crate::string_merging::claim_key(file.priority, ordinal);
            for (piece, _) in &msec.pieces {
                if piece.claimed_by(key) {
                    let offset = piece.offset.load(Ordering::Relaxed) as usize;
                    out[offset..offset + piece.data.len()].copy_from_slice(piece.data);
                }
            }
        }
    }
}

fn copy_regular_section(ctx: &LinkContext, index: u32, out: &mut [u8]) {
    let osec = &ctx.out.regular[index as usize];
    for member in &osec.members {
        let isec = member.get();
        if isec.is_nobits() || isec.data.is_empty() {
            continue;
        }
        let offset = isec.offset.load(Ordering::Relaxed) as usize;
        out[offset..offset + isec.data.len()].copy_from_slice(isec.data);
    }
    for member in &osec.members {
        let isec = member.get();
        if isec.is_nobits() {
            continue;
        }
        apply_relocations(ctx, member.file, isec, &osec.hdr, out);
    }
}

/// Applies the relocations of one input section. `out` is the whole output section's buffer;
/// the section's bytes start at its assigned offset.
fn apply_relocations<'a, 'data>(
    ctx: &LinkContext<'a, 'data>,
    file: &ObjectFile<'data>,
    isec: &InputSection,
    osec_hdr: &crate::output_sections::SectionHdr,
    out: &mut [u8],
) {
    let isec_offset = isec.offset.load(Ordering::Relaxed);
    let isec_size = isec.sh_size();
    let base_va = osec_hdr.sh_addr + isec_offset;

    let section_range = isec_offset as usize..(isec_offset + isec_size) as usize;
    let section_out = &mut out[section_range];

    let unknown = |r_type: u32| {
        ctx.diag.error(anyhow!(LinkError::UnknownRelocation {
            r_type,
            place: format!("{}:({})", file.name, String::from_utf8_lossy(isec.name)),
        }));
    };

    let mut i = 0;
    while i < isec.relocations.len() {
        let rel = &isec.relocations[i];
        let rel_index = i;
        i += 1;

        let r_type = rel.r_type(LE, false);
        let Some(info) = x86_64::relocation_info(r_type) else {
            unknown(r_type);
            continue;
        };
        if info.value == RelValue::None {
            continue;
        }

        let r_offset = rel.r_offset.get(LE);
        let addend = rel.r_addend.get(LE);
        let sym_index = rel.r_sym(LE, false) as usize;
        let global = (sym_index >= file.first_global()).then(|| file.global(sym_index));

        // Mergeable-string targets resolve through their deduplicated piece.
        let piece_ref = isec.rel_pieces.get(rel_index).copied().flatten();
        let (s, a) = if let Some(piece_ref) = piece_ref {
            let merged = &ctx.out.merged[piece_ref.merged_id as usize];
            (
                merged.hdr.sh_addr + piece_ref.piece.offset.load(Ordering::Relaxed),
                piece_ref.addend as i64,
            )
        } else if let Some(sym) = global {
            if sym.def().placement == SymbolPlacement::Undefined {
                continue;
            }
            (ctx.symbol_addr(sym), addend)
        } else {
            match local_symbol_addr(ctx, file, sym_index) {
                Some(addr) => (addr, addend),
                None => continue,
            }
        };

        let p = base_va + r_offset;
        let loc = r_offset as usize;
        if loc + usize::from(info.size) > section_out.len() {
            ctx.diag.error(anyhow!(
                "{}:({}): relocation offset {:#x} is outside the section",
                file.name,
                String::from_utf8_lossy(isec.name),
                r_offset,
            ));
            continue;
        }

        let value = match info.value {
            RelValue::None => continue,
            RelValue::Abs => s.wrapping_add_signed(a),
            RelValue::Rel => s.wrapping_add_signed(a).wrapping_sub(p),
            RelValue::PltRel => {
                let target = match global {
                    Some(sym) if sym.index(&sym.plt_idx).is_some() => ctx.plt_addr(sym),
                    _ => s,
                };
                target.wrapping_add_signed(a).wrapping_sub(p)
            }
            RelValue::GotRel => match global.and_then(|sym| sym.index(&sym.got_idx)) {
                Some(_) => {
                    let sym = global.unwrap();
                    ctx.got_addr(sym).wrapping_add_signed(a).wrapping_sub(p)
                }
                None => {
                    unknown(r_type);
                    continue;
                }
            },
            RelValue::GotBaseRel => ctx
                .out
                .gotplt
                .sh_addr
                .wrapping_add_signed(a)
                .wrapping_sub(p),
            RelValue::GotOff => match global.and_then(|sym| sym.index(&sym.got_idx)) {
                Some(_) => {
                    let sym = global.unwrap();
                    ctx.got_addr(sym)
                        .wrapping_sub(ctx.out.gotplt.sh_addr)
                        .wrapping_add_signed(a)
                }
                None => {
                    unknown(r_type);
                    continue;
                }
            },
            RelValue::TpOff => s.wrapping_add_signed(a).wrapping_sub(ctx.out.tls_end),
            RelValue::TlsGd => {
                let has_slot = global.is_some_and(|sym| sym.index(&sym.tlsgd_idx).is_some());
                if has_slot {
                    let sym = global.unwrap();
                    ctx.tlsgd_addr(sym).wrapping_add_signed(a).wrapping_sub(p)
                } else {
                    // Relax general-dynamic to local-exec. Only the canonical sequence is
                    // rewritten; anything else is refused.
                    if !x86_64::is_canonical_tlsgd(section_out, loc)
                        || loc + 12 > section_out.len()
                    {
                        unknown(r_type);
                        continue;
                    }
                    x86_64::relax_tlsgd_to_le(section_out, loc);
                    let tpoff = s
                        .wrapping_sub(ctx.out.tls_end)
                        .wrapping_add_signed(a)
                        .wrapping_add(4);
                    section_out[loc + 8..loc + 12]
                        .copy_from_slice(&(tpoff as u32).to_le_bytes());
                    i += 1; // skip the paired call relocation
                    continue;
                }
            }
            RelValue::TlsLd => {
                let has_slot = global.is_some_and(|sym| sym.index(&sym.tlsld_idx).is_some());
                if has_slot {
                    let sym = global.unwrap();
                    ctx.tlsld_addr(sym).wrapping_add_signed(a).wrapping_sub(p)
                } else {
                    if !x86_64::is_canonical_tlsld(section_out, loc)
                        || loc + 9 > section_out.len()
                    {
                        unknown(r_type);
                        continue;
                    }
                    x86_64::relax_tlsld_to_le(section_out, loc);
                    i += 1;
                    continue;
                }
            }
            RelValue::GotTpOff => match global.and_then(|sym| sym.index(&sym.gottpoff_idx)) {
                Some(_) => {
                    let sym = global.unwrap();
                    ctx.gottpoff_addr(sym)
                        .wrapping_add_signed(a)
                        .wrapping_sub(p)
                }
                None => {
                    unknown(r_type);
                    continue;
                }
            },
        };

        x86_64::write_value(&mut section_out[loc..], info.size, value);
    }
}

/// Finalisation: the build id digest is computed over the written image and patched into the
/// note section.
#[tracing::instrument(skip_all, name = "Write build id")]
pub(crate) fn write_build_id(ctx: &LinkContext, buffer: &mut [u8]) -> Result {
    let digest: Vec<u8> = match &ctx.args.build_id {
        crate::args::BuildIdOption::None => return Ok(()),
        crate::args::BuildIdOption::Fast => {
            blake3::hash(buffer).as_bytes()[..16].to_vec()
        }
        crate::args::BuildIdOption::Uuid => uuid::Uuid::new_v4().as_bytes().to_vec(),
        crate::args::BuildIdOption::Hex(bytes) => bytes.clone(),
    };
    let offset = ctx.out.buildid.sh_offset as usize + 16;
    buffer[offset..offset + digest.len()].copy_from_slice(&digest);
    Ok(())
}

/// Sizes the build id note before layout.
pub(crate) fn compute_build_id_size(ctx: &mut LinkContext) {
    let desc_len = match &ctx.args.build_id {
        crate::args::BuildIdOption::None => {
            ctx.out.buildid.sh_size = 0;
            return;
        }
        crate::args::BuildIdOption::Fast | crate::args::BuildIdOption::Uuid => 16,
        crate::args::BuildIdOption::Hex(bytes) => bytes.len(),
    };
    ctx.out.buildid.sh_size = 16 + desc_len as u64;
}

