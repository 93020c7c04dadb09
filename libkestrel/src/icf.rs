//! `--icf`: identical-section folding. This implementation is deliberately conservative: only
//! read-only, relocation-free sections whose bytes match exactly are folded, and only when no
//! relocation addresses the section through a local symbol. Global symbols displaced by a fold
//! are rebound to the surviving section, which the lowest-priority file provides.

use crate::context::LinkContext;
use crate::elf::LE;
use crate::hash::HashMap;
use crate::parsing::InputRef;
use crate::parsing::ObjectFile;
use crate::parsing::SectionSlot;
use crate::symbol_db::SymbolPlacement;
use object::read::elf::Sym as _;
use rayon::iter::IntoParallelRefIterator;
use rayon::iter::ParallelIterator;
use std::sync::atomic::Ordering;

#[derive(PartialEq, Eq, Hash)]
struct FoldKey<'data> {
    content: &'data [u8],
    sh_type: u32,
    sh_flags: u64,
}

struct Candidate<'data> {
    file: &'data ObjectFile<'data>,
    index: u32,
}

#[tracing::instrument(skip_all, name = "ICF")]
pub(crate) fn icf_sections<'data>(ctx: &LinkContext<'_, 'data>) {
    // Per-file candidate collection runs in parallel; the fold decision is serial so that the
    // winner is a pure function of file priority and section index.
    let per_file: Vec<Vec<Candidate<'data>>> = ctx
        .objs
        .par_iter()
        .map(|&file| collect_candidates(file))
        .collect();

    let mut groups: HashMap<FoldKey<'data>, Candidate<'data>> = HashMap::default();
    let mut losers: Vec<(Candidate<'data>, &'data ObjectFile<'data>, u32)> = Vec::new();

    for candidates in per_file {
        for candidate in candidates {
            let SectionSlot::Regular(section) =
                &candidate.file.sections[candidate.index as usize]
            else {
                continue;
            };
            let key = FoldKey {
                content: section.data,
                sh_type: section.shdr.sh_type.get(LE),
                sh_flags: section.sh_flags(),
            };
            match groups.entry(key) {
                hashbrown::hash_map::Entry::Vacant(entry) => {
                    entry.insert(candidate);
                }
                hashbrown::hash_map::Entry::Occupied(entry) => {
                    let winner = entry.get();
                    losers.push((candidate, winner.file, winner.index));
                }
            }
        }
    }

    for (loser, winner_file, winner_index) in losers {
        let SectionSlot::Regular(section) = &loser.file.sections[loser.index as usize] else {
            continue;
        };
        section.is_alive.store(false, Ordering::Relaxed);

        // Rebind any global symbol that was defined in the folded section.
        for i in loser.file.first_global()..loser.file.elf_syms().len() {
            let sym = loser.file.global(i);
            let def = sym.def();
            if def.placement == SymbolPlacement::Section(loser.index)
                && matches!(def.file, Some(InputRef::Object(o)) if std::ptr::eq(o, loser.file))
            {
                sym.update_def(|d| {
                    d.file = Some(InputRef::Object(winner_file));
                    d.placement = SymbolPlacement::Section(winner_index);
                });
            }
        }
    }
}

/// Sections this file is willing to fold. Candidates are emitted in section order, and files
/// are visited in priority order, so the first candidate for a key is the canonical winner.
fn collect_candidates<'data>(file: &'data ObjectFile<'data>) -> Vec<Candidate<'data>> {
    // Sections addressed through local symbols can't be folded: we'd have no way to rebind the
    // references.
    let mut locally_referenced = vec![false; file.sections.len()];
    for slot in &file.sections {
        let SectionSlot::Regular(section) = slot else {
            continue;
        };
        for rel in section.relocations {
            let sym_index = rel.r_sym(LE, false) as usize;
            if sym_index < file.first_global() {
                if let Some(esym) = file.elf_syms().get(sym_index) {
                    if let Some(flag) =
                        locally_referenced.get_mut(usize::from(esym.st_shndx(LE)))
                    {
                        *flag = true;
                    }
                }
            }
        }
    }

    let mut candidates = Vec::new();
    for (index, slot) in file.sections.iter().enumerate() {
        let SectionSlot::Regular(section) = slot else {
            continue;
        };
        let flags = section.sh_flags();
        if section.alive()
            && section.relocations.is_empty()
            && flags & u64::from(object::elf::SHF_ALLOC) != 0
            && flags & u64::from(object::elf::SHF_WRITE) == 0
            && flags & u64::from(object::elf::SHF_TLS) == 0
            && !section.is_nobits()
            && !section.data.is_empty()
            && !locally_referenced[index]
        {
            candidates.push(Candidate {
                file,
                index: index as u32,
            });
        }
    }
    candidates
}
