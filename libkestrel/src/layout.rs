//! Layout: binning input sections into output sections, assigning offsets within each output
//! section, ordering chunks, and finally assigning file offsets and virtual addresses.

use crate::context::LinkContext;
use crate::context::SectionRef;
use crate::elf::PAGE_SIZE;
use crate::elf::align_to;
use crate::output_sections::ChunkId;
use crate::output_sections::ChunkKind;
use crate::output_sections::section_rank;
use crate::parsing::SectionSlot;
use crate::string_merging::claim_key;
use rayon::iter::IndexedParallelIterator;
use rayon::iter::IntoParallelRefIterator;
use rayon::iter::IntoParallelRefMutIterator;
use rayon::iter::ParallelIterator;
use std::sync::atomic::Ordering;

/// Number of slices the object list is split into for parallel binning.
const BIN_SLICES: usize = 128;

/// Block size for parallel offset assignment within one output section.
const OFFSET_BLOCK: usize = 10_000;

/// Builds the reverse edge from output sections to their member input sections. Members may
/// number in the millions, so slices of the object list are binned in parallel; the final
/// concatenation appends slices in input order so that the result is independent of thread
/// timing.
#[tracing::instrument(skip_all, name = "Bin sections")]
pub(crate) fn bin_sections(ctx: &mut LinkContext) {
    let num_osec = ctx.out.regular.len();
    let unit = ctx.objs.len().div_ceil(BIN_SLICES).max(1);
    let slices: Vec<_> = ctx.objs.chunks(unit).collect();

    let groups: Vec<Vec<Vec<SectionRef>>> = slices
        .par_iter()
        .map(|slice| {
            let mut group = vec![Vec::new(); num_osec];
            for &file in *slice {
                for (index, slot) in file.sections.iter().enumerate() {
                    if let SectionSlot::Regular(section) = slot {
                        if section.alive() {
                            group[section.output_section as usize].push(SectionRef {
                                file,
                                index: index as u32,
                            });
                        }
                    }
                }
            }
            group
        })
        .collect();

    let mut sizes = vec![0usize; num_osec];
    for group in &groups {
        for (i, members) in group.iter().enumerate() {
            sizes[i] += members.len();
        }
    }

    ctx.out
        .regular
        .par_iter_mut()
        .enumerate()
        .for_each(|(i, osec)| {
            osec.members.reserve_exact(sizes[i]);
            for group in &groups {
                osec.members.extend_from_slice(&group[i]);
            }
        });
}

/// Assigns each member section its offset within its output section, and sets the output
/// section's size and alignment. Members are processed in blocks: block-local offsets in
/// parallel, block start offsets serially, then a parallel rebase.
#[tracing::instrument(skip_all, name = "Assign section offsets")]
pub(crate) fn set_isec_offsets(ctx: &mut LinkContext) {
    ctx.out.regular.par_iter_mut().for_each(|osec| {
        if osec.members.is_empty() {
            return;
        }
        let blocks: Vec<_> = osec.members.chunks(OFFSET_BLOCK).collect();
        let mut sizes = vec![0u64; blocks.len()];
        let mut alignments = vec![1u64; blocks.len()];

        blocks
            .par_iter()
            .zip(sizes.par_iter_mut())
            .zip(alignments.par_iter_mut())
            .for_each(|((block, size), alignment)| {
                let mut offset = 0;
                let mut align = 1;
                for member in *block {
                    let section = member.get();
                    offset = align_to(offset, section.sh_addralign());
                    section.offset.store(offset, Ordering::Relaxed);
                    offset += section.sh_size();
                    align = align.max(section.sh_addralign());
                }
                *size = offset;
                *alignment = align;
            });

        let align = alignments.iter().copied().max().unwrap_or(1);
        let mut starts = vec![0u64; blocks.len()];
        for i in 1..blocks.len() {
            starts[i] = align_to(starts[i - 1] + sizes[i - 1], align);
        }

        blocks
            .par_iter()
            .zip(starts.par_iter())
            .skip(1)
            .for_each(|(block, start)| {
                for member in *block {
                    member.get().offset.fetch_add(*start, Ordering::Relaxed);
                }
            });

        osec.hdr.sh_size = starts[blocks.len() - 1] + sizes[blocks.len() - 1];
        osec.hdr.sh_addralign = align;
    });
}

/// Runs the string-merge layout: authorship claims, per-section piece offsets, the serial
/// prefix sum placing each mergeable section within its parent, and the final rebase of piece
/// offsets to be parent-relative.
#[tracing::instrument(skip_all, name = "Merge strings")]
pub(crate) fn handle_mergeable_strings(ctx: &mut LinkContext) {
    ctx.objs.par_iter().for_each(|file| {
        for (ordinal, slot) in file.sections.iter().enumerate() {
            if let SectionSlot::Merge(msec) = slot {
                if msec.is_alive.load(Ordering::Relaxed) {
                    msec.claim_pieces(claim_key(file.priority, ordinal));
                }
            }
        }
    });

    ctx.objs.par_iter().for_each(|file| {
        for (ordinal, slot) in file.sections.iter().enumerate() {
            if let SectionSlot::Merge(msec) = slot {
                if msec.is_alive.load(Ordering::Relaxed) {
                    msec.assign_local_offsets(claim_key(file.priority, ordinal));
                }
            }
        }
    });

    // Serial prefix sum across files, in priority order.
    for file in &ctx.objs {
        for slot in &file.sections {
            let SectionSlot::Merge(msec) = slot else {
                continue;
            };
            if !msec.is_alive.load(Ordering::Relaxed) {
                continue;
            }
            let parent = &mut ctx.out.merged[msec.merged_id as usize].hdr;
            let offset = align_to(parent.sh_size, msec.sh_addralign);
            msec.offset.store(offset, Ordering::Relaxed);
            parent.sh_size = offset + msec.size.load(Ordering::Relaxed);
            parent.sh_addralign = parent.sh_addralign.max(msec.sh_addralign);
        }
    }

    ctx.objs.par_iter().for_each(|file| {
        for (ordinal, slot) in file.sections.iter().enumerate() {
            if let SectionSlot::Merge(msec) = slot {
                if msec.is_alive.load(Ordering::Relaxed) {
                    msec.rebase_piece_offsets(claim_key(file.priority, ordinal));
                }
            }
        }
    });
}

/// Assembles the final chunk list. Sections created in parallel land in registry order, which
/// is scheduling-dependent, so regular and merged sections are sorted by identity first; the
/// whole list is then ordered by section rank to minimise `PT_LOAD` transitions, with the file
/// headers pinned at the front and the section header table at the back.
#[tracing::instrument(skip_all, name = "Order chunks")]
pub(crate) fn assemble_chunks(ctx: &mut LinkContext) {
    let mut body = Vec::new();

    let needs_dynamic = ctx.is_dynamic_output();

    body.push(ChunkId::Got);
    body.push(ChunkId::Plt);
    body.push(ChunkId::GotPlt);
    body.push(ChunkId::PltGot);
    body.push(ChunkId::RelPlt);
    if needs_dynamic {
        body.push(ChunkId::RelDyn);
        body.push(ChunkId::Dynamic);
        body.push(ChunkId::Dynsym);
        body.push(ChunkId::Dynstr);
        if ctx.args.hash_style.includes_sysv() {
            body.push(ChunkId::Hash);
        }
        if ctx.args.hash_style.includes_gnu() {
            body.push(ChunkId::GnuHash);
        }
        body.push(ChunkId::Versym);
        body.push(ChunkId::Verneed);
    }
    body.push(ChunkId::Shstrtab);
    if !ctx.args.strip_all {
        body.push(ChunkId::Symtab);
        body.push(ChunkId::Strtab);
    }
    if ctx.args.eh_frame_hdr {
        body.push(ChunkId::EhFrameHdr);
    }
    body.push(ChunkId::Copyrel);
    body.push(ChunkId::CopyrelRelro);
    body.push(ChunkId::Common);
    if !matches!(ctx.args.build_id, crate::args::BuildIdOption::None) {
        body.push(ChunkId::BuildId);
    }

    let mut regular_ids: Vec<u32> = (0..ctx.out.regular.len() as u32).collect();
    regular_ids.sort_by(|&a, &b| {
        let ha = &ctx.out.regular[a as usize].hdr;
        let hb = &ctx.out.regular[b as usize].hdr;
        (&ha.name, ha.sh_type, ha.sh_flags).cmp(&(&hb.name, hb.sh_type, hb.sh_flags))
    });
    body.extend(regular_ids.into_iter().map(ChunkId::Regular));

    let mut merged_ids: Vec<u32> = (0..ctx.out.merged.len() as u32).collect();
    merged_ids.sort_by(|&a, &b| {
        let ha = &ctx.out.merged[a as usize].hdr;
        let hb = &ctx.out.merged[b as usize].hdr;
        (&ha.name, ha.sh_type, ha.sh_flags).cmp(&(&hb.name, hb.sh_type, hb.sh_flags))
    });
    body.extend(merged_ids.into_iter().map(ChunkId::Merged));

    body.sort_by_key(|&id| section_rank(ctx.out.hdr(id)));

    let mut chunks = vec![ChunkId::Ehdr, ChunkId::Phdr];
    if ctx.args.needs_dynamic_sections() && !ctx.args.is_shared() && !ctx.dsos.is_empty() {
        chunks.push(ChunkId::Interp);
    }
    chunks.extend(body);
    chunks.push(ChunkId::Shdr);

    ctx.out.chunks = chunks;
}

/// Drops zero-sized chunks (headers stay) and assigns section indices to what remains.
pub(crate) fn prune_and_index_chunks(ctx: &mut LinkContext) {
    let chunks = std::mem::take(&mut ctx.out.chunks);
    let chunks: Vec<ChunkId> = chunks
        .into_iter()
        .filter(|&id| id.kind() == ChunkKind::Header || ctx.out.hdr(id).sh_size > 0)
        .collect();

    let mut shndx = 1;
    for &id in &chunks {
        if id.kind() != ChunkKind::Header {
            let name = ctx.out.hdr(id).name.clone();
            ctx.out.shstrtab.add(&name);
            ctx.out.hdr_mut(id).shndx = shndx;
            shndx += 1;
        }
    }

    ctx.out.shstrtab_hdr.sh_size = ctx.out.shstrtab.len();
    ctx.out.shdr.sh_size = u64::from(shndx) * size_of::<crate::elf::SectionHeader>() as u64;
    ctx.out.chunks = chunks;
}

/// A planned program header. The chunk range refers to `ctx.out.chunks` indices; addresses are
/// filled in from the chunk headers once offsets are assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SegmentPlan {
    pub(crate) p_type: u32,
    pub(crate) p_flags: u32,
    pub(crate) first_chunk: usize,
    pub(crate) last_chunk: usize,
}

fn chunk_prot(ctx: &LinkContext, id: ChunkId) -> u32 {
    let hdr = ctx.out.hdr(id);
    let mut prot = object::elf::PF_R;
    if hdr.sh_flags & u64::from(object::elf::SHF_WRITE) != 0 {
        prot |= object::elf::PF_W;
    }
    if hdr.sh_flags & u64::from(object::elf::SHF_EXECINSTR) != 0 {
        prot |= object::elf::PF_X;
    }
    prot
}

fn is_relro(ctx: &LinkContext, id: ChunkId) -> bool {
    match id {
        ChunkId::Dynamic | ChunkId::Got | ChunkId::CopyrelRelro => true,
        ChunkId::Regular(_) => {
            let name = &ctx.out.hdr(id).name;
            name.as_slice() == b".data.rel.ro"
                || name.as_slice() == b".init_array"
                || name.as_slice() == b".fini_array"
                || name.as_slice() == b".preinit_array"
                || name.as_slice() == b".ctors"
                || name.as_slice() == b".dtors"
        }
        _ => false,
    }
}

/// Plans the program headers from the chunk order alone, so that the header chunk can be sized
/// before file offsets exist.
pub(crate) fn plan_segments(ctx: &LinkContext) -> Vec<SegmentPlan> {
    let chunks = &ctx.out.chunks;
    let mut plans = Vec::new();

    plans.push(SegmentPlan {
        p_type: object::elf::PT_PHDR,
        p_flags: object::elf::PF_R,
        first_chunk: 1,
        last_chunk: 1,
    });

    if let Some(pos) = chunks.iter().position(|&id| id == ChunkId::Interp) {
        plans.push(SegmentPlan {
            p_type: object::elf::PT_INTERP,
            p_flags: object::elf::PF_R,
            first_chunk: pos,
            last_chunk: pos,
        });
    }

    // PT_LOAD: consecutive alloc chunks with the same protection share a segment.
    let mut load: Option<SegmentPlan> = None;
    for (pos, &id) in chunks.iter().enumerate() {
        if !ctx.out.hdr(id).is_alloc() {
            continue;
        }
        let prot = chunk_prot(ctx, id);
        match &mut load {
            Some(plan) if plan.p_flags == prot => plan.last_chunk = pos,
            _ => {
                if let Some(plan) = load.take() {
                    plans.push(plan);
                }
                load = Some(SegmentPlan {
                    p_type: object::elf::PT_LOAD,
                    p_flags: prot,
                    first_chunk: pos,
                    last_chunk: pos,
                });
            }
        }
    }
    if let Some(plan) = load.take() {
        plans.push(plan);
    }

    // PT_TLS covers the consecutive run of TLS chunks.
    let tls_range = contiguous_range(chunks, |id| {
        ctx.out.hdr(id).sh_flags & u64::from(object::elf::SHF_TLS) != 0
    });
    if let Some((first, last)) = tls_range {
        plans.push(SegmentPlan {
            p_type: object::elf::PT_TLS,
            p_flags: object::elf::PF_R,
            first_chunk: first,
            last_chunk: last,
        });
    }

    if let Some(pos) = chunks.iter().position(|&id| id == ChunkId::Dynamic) {
        plans.push(SegmentPlan {
            p_type: object::elf::PT_DYNAMIC,
            p_flags: object::elf::PF_R | object::elf::PF_W,
            first_chunk: pos,
            last_chunk: pos,
        });
    }

    if let Some(pos) = chunks.iter().position(|&id| id == ChunkId::EhFrameHdr) {
        plans.push(SegmentPlan {
            p_type: object::elf::PT_GNU_EH_FRAME,
            p_flags: object::elf::PF_R,
            first_chunk: pos,
            last_chunk: pos,
        });
    }

    let relro_range = contiguous_range(chunks, |id| is_relro(ctx, id));
    if let Some((first, last)) = relro_range {
        plans.push(SegmentPlan {
            p_type: object::elf::PT_GNU_RELRO,
            p_flags: object::elf::PF_R,
            first_chunk: first,
            last_chunk: last,
        });
    }

    // PT_GNU_STACK carries no sections; it only records that the stack isn't executable.
    plans.push(SegmentPlan {
        p_type: object::elf::PT_GNU_STACK,
        p_flags: object::elf::PF_R | object::elf::PF_W,
        first_chunk: usize::MAX,
        last_chunk: usize::MAX,
    });

    plans
}

/// The range of chunks matching the predicate, but only if they're consecutive: segments can
/// only cover a contiguous byte range, so a scattered match means no segment is emitted.
fn contiguous_range(
    chunks: &[ChunkId],
    mut predicate: impl FnMut(ChunkId) -> bool,
) -> Option<(usize, usize)> {
    let first = chunks.iter().position(|&id| predicate(id))?;
    let mut last = first;
    for (pos, &id) in chunks.iter().enumerate().skip(first + 1) {
        if predicate(id) {
            if pos != last + 1 {
                return None;
            }
            last = pos;
        }
    }
    Some((first, last))
}

/// Walks the ordered chunks assigning file offsets and virtual addresses. At a `PT_LOAD`
/// boundary the address is page-aligned; within a page, the file offset is advanced so that
/// `vaddr mod PAGE == fileoff mod PAGE` for mapped content. `SHT_NOBITS` consumes address
/// space but no file bytes; TLS bss consumes neither beyond its own segment.
#[tracing::instrument(skip_all, name = "Assign chunk offsets")]
pub(crate) fn set_osec_offsets(ctx: &mut LinkContext, segments: &[SegmentPlan]) -> u64 {
    // Chunks that start a PT_LOAD segment.
    let mut starts_new_ptload = vec![false; ctx.out.chunks.len()];
    for plan in segments {
        if plan.p_type == object::elf::PT_LOAD {
            starts_new_ptload[plan.first_chunk] = true;
        }
    }

    let mut fileoff = 0u64;
    let mut vaddr = ctx.args.image_base;

    let chunks = ctx.out.chunks.clone();
    for (pos, &id) in chunks.iter().enumerate() {
        let is_alloc = ctx.out.hdr(id).is_alloc();

        if starts_new_ptload[pos] {
            vaddr = align_to(vaddr, PAGE_SIZE);
        }

        if is_alloc {
            if vaddr % PAGE_SIZE > fileoff % PAGE_SIZE {
                fileoff += vaddr % PAGE_SIZE - fileoff % PAGE_SIZE;
            } else if vaddr % PAGE_SIZE < fileoff % PAGE_SIZE {
                fileoff = align_to(fileoff, PAGE_SIZE) + vaddr % PAGE_SIZE;
            }
        }

        let hdr = ctx.out.hdr_mut(id);
        fileoff = align_to(fileoff, hdr.sh_addralign);
        vaddr = align_to(vaddr, hdr.sh_addralign);

        hdr.sh_offset = fileoff;
        if is_alloc {
            hdr.sh_addr = vaddr;
        }

        let is_bss = hdr.is_nobits();
        if !is_bss {
            fileoff += hdr.sh_size;
        }

        let is_tbss = is_bss && hdr.sh_flags & u64::from(object::elf::SHF_TLS) != 0;
        if is_alloc && !is_tbss {
            vaddr += hdr.sh_size;
        }
    }

    fileoff
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::Args;
    use crate::context::OutputChunks;
    use crate::diagnostics::DiagnosticSink;
    use crate::output_sections::SectionDef;
    use crate::symbol_db::SymbolDb;

    fn test_ctx<'a, 'data>(
        args: &'a Args,
        db: &'a SymbolDb<'data>,
        diag: &'a DiagnosticSink,
        defs: Vec<SectionDef>,
    ) -> LinkContext<'a, 'data> {
        LinkContext {
            args,
            symbol_db: db,
            diag,
            objs: Vec::new(),
            dsos: Vec::new(),
            out: OutputChunks::new(defs, Vec::new()),
            synthetic_symbols: Vec::new(),
            entry_name: "_start".to_owned(),
        }
    }

    fn section_def(name: &[u8], sh_type: u32, sh_flags: u64) -> SectionDef {
        SectionDef {
            name: name.to_vec(),
            sh_type,
            sh_flags,
            sh_entsize: 0,
        }
    }

    #[test]
    fn test_offsets_respect_ptload_congruence() {
        let args = Args::default();
        let arena = colosseum::sync::Arena::new();
        let names = colosseum::sync::Arena::new();
        let db = SymbolDb::new(&arena, &names);
        let diag = DiagnosticSink::default();
        let a = u64::from(object::elf::SHF_ALLOC);
        let w = u64::from(object::elf::SHF_WRITE);
        let x = u64::from(object::elf::SHF_EXECINSTR);
        let mut ctx = test_ctx(
            &args,
            &db,
            &diag,
            vec![
                section_def(b".rodata", object::elf::SHT_PROGBITS, a),
                section_def(b".text", object::elf::SHT_PROGBITS, a | x),
                section_def(b".data", object::elf::SHT_PROGBITS, a | w),
                section_def(b".bss", object::elf::SHT_NOBITS, a | w),
            ],
        );
        for (i, size) in [0x123u64, 0x2000, 0x80, 0x400].into_iter().enumerate() {
            ctx.out.regular[i].hdr.sh_size = size;
            ctx.out.regular[i].hdr.sh_addralign = 16;
        }
        ctx.out.ehdr.sh_size = 64;
        ctx.out.phdr.sh_size = 56 * 4;
        ctx.out.chunks = vec![
            ChunkId::Ehdr,
            ChunkId::Phdr,
            ChunkId::Regular(0),
            ChunkId::Regular(1),
            ChunkId::Regular(2),
            ChunkId::Regular(3),
            ChunkId::Shdr,
        ];

        let segments = plan_segments(&ctx);
        let filesize = set_osec_offsets(&mut ctx, &segments);

        // Every alloc chunk keeps vaddr and file offset congruent modulo the page size.
        for &id in &ctx.out.chunks {
            let hdr = ctx.out.hdr(id);
            if hdr.is_alloc() && hdr.sh_size > 0 {
                assert_eq!(
                    hdr.sh_addr % PAGE_SIZE,
                    hdr.sh_offset % PAGE_SIZE,
                    "chunk {:?} breaks PT_LOAD congruence",
                    id
                );
            }
        }

        // Offsets must be monotonically increasing in file order, and bss takes no file bytes.
        let data = ctx.out.hdr(ChunkId::Regular(2));
        let bss = ctx.out.hdr(ChunkId::Regular(3));
        assert!(bss.sh_offset >= data.sh_offset);
        assert_eq!(bss.file_end(), bss.sh_offset);
        assert!(filesize >= data.file_end());

        // The three protection classes produce three PT_LOADs.
        let loads: Vec<_> = segments
            .iter()
            .filter(|s| s.p_type == object::elf::PT_LOAD)
            .collect();
        assert_eq!(loads.len(), 3);
    }

    #[test]
    fn test_chunk_ordering_follows_rank() {
        let args = Args::default();
        let arena = colosseum::sync::Arena::new();
        let names = colosseum::sync::Arena::new();
        let db = SymbolDb::new(&arena, &names);
        let diag = DiagnosticSink::default();
        let a = u64::from(object::elf::SHF_ALLOC);
        let w = u64::from(object::elf::SHF_WRITE);
        let x = u64::from(object::elf::SHF_EXECINSTR);
        let mut ctx = test_ctx(
            &args,
            &db,
            &diag,
            vec![
                section_def(b".bss", object::elf::SHT_NOBITS, a | w),
                section_def(b".text", object::elf::SHT_PROGBITS, a | x),
                section_def(b".rodata", object::elf::SHT_PROGBITS, a),
            ],
        );
        for osec in &mut ctx.out.regular {
            osec.hdr.sh_size = 16;
        }
        assemble_chunks(&mut ctx);

        let pos = |name: &[u8]| {
            ctx.out
                .chunks
                .iter()
                .position(|&id| ctx.out.hdr(id).name == name)
                .unwrap()
        };
        assert!(pos(b".rodata") < pos(b".text"));
        assert!(pos(b".text") < pos(b".bss"));
        assert_eq!(ctx.out.chunks[0], ChunkId::Ehdr);
        assert_eq!(ctx.out.chunks[1], ChunkId::Phdr);
        assert_eq!(*ctx.out.chunks.last().unwrap(), ChunkId::Shdr);
    }
}
