//! `--gc-sections`: mark-and-sweep over input sections. Roots are sections the runtime reaches
//! without relocations (entry point, init/fini machinery, retained and note sections, exported
//! symbols); edges are relocations. Afterwards, unreachable allocatable sections have
//! `is_alive == false` and are skipped by every later pass.

use crate::context::LinkContext;
use crate::elf::LE;
use crate::parsing::InputRef;
use crate::parsing::ObjectFile;
use crate::parsing::SectionSlot;
use crate::symbol_db::Symbol;
use crate::symbol_db::SymbolPlacement;
use object::read::elf::Sym as _;
use rayon::iter::IntoParallelRefIterator;
use rayon::iter::ParallelIterator;
use std::sync::atomic::Ordering;

#[tracing::instrument(skip_all, name = "GC sections")]
pub(crate) fn gc_sections<'data>(ctx: &LinkContext<'_, 'data>) {
    // Everything allocatable starts dead; marking resurrects what's reachable. Non-allocatable
    // sections (debug info etc.) are not collected.
    ctx.objs.par_iter().for_each(|obj| {
        for slot in &obj.sections {
            match slot {
                SectionSlot::Regular(section) => {
                    if section.sh_flags() & u64::from(object::elf::SHF_ALLOC) != 0
                        && section.alive()
                    {
                        section.is_alive.store(false, Ordering::Relaxed);
                    }
                }
                SectionSlot::Merge(msec) => {
                    // Mergeable content survives through piece claims from live sections, so a
                    // mergeable section is retained exactly when something reaches it.
                    msec.is_alive.store(false, Ordering::Relaxed);
                }
                SectionSlot::Discard => {}
            }
        }
    });

    rayon::scope(|scope| {
        for &obj in &ctx.objs {
            scope.spawn(move |scope| {
                for (index, slot) in obj.sections.iter().enumerate() {
                    let SectionSlot::Regular(section) = slot else {
                        continue;
                    };
                    if is_root(section.name, section.shdr.sh_type.get(LE), section.sh_flags()) {
                        mark_section(obj, index, scope);
                    }
                }
            });
        }

        let mut symbol_roots: Vec<&'data Symbol<'data>> = Vec::new();
        for name in ctx.args.undefined.iter().chain([
            &ctx.entry_name,
            &ctx.args.init,
            &ctx.args.fini,
        ]) {
            if let Some(sym) = ctx.symbol_db.get(name.as_bytes()) {
                symbol_roots.push(sym);
            }
        }
        for dso in &ctx.dsos {
            symbol_roots.extend(dso.undefs.iter().copied());
        }
        if ctx.args.export_dynamic || ctx.args.is_shared() {
            for obj in &ctx.objs {
                for i in obj.first_global()..obj.elf_syms().len() {
                    let sym = obj.global(i);
                    if sym.def().visibility == object::elf::STV_DEFAULT {
                        symbol_roots.push(sym);
                    }
                }
            }
        }
        for sym in symbol_roots {
            mark_symbol_section(sym, scope);
        }
    });
}

fn is_root(name: &[u8], sh_type: u32, sh_flags: u64) -> bool {
    if sh_flags & u64::from(object::elf::SHF_GNU_RETAIN) != 0 {
        return true;
    }
    if matches!(
        sh_type,
        object::elf::SHT_NOTE
            | object::elf::SHT_INIT_ARRAY
            | object::elf::SHT_FINI_ARRAY
            | object::elf::SHT_PREINIT_ARRAY
    ) {
        return true;
    }
    [
        b".init" as &[u8],
        b".fini",
        b".ctors",
        b".dtors",
        b".preinit_array",
    ]
    .iter()
    .any(|root| name == *root || (name.starts_with(root) && name.get(root.len()) == Some(&b'.')))
}

fn mark_symbol_section<'data, 'scope>(sym: &'data Symbol<'data>, scope: &rayon::Scope<'scope>)
where
    'data: 'scope,
{
    let def = sym.def();
    if let (Some(InputRef::Object(file)), SymbolPlacement::Section(shndx)) = (def.file, def.placement)
    {
        mark_section(file, shndx as usize, scope);
    }
}

/// Resurrects one section; the compare-exchange guarantees its edges are walked exactly once.
fn mark_section<'data, 'scope>(
    file: &'data ObjectFile<'data>,
    index: usize,
    scope: &rayon::Scope<'scope>,
) where
    'data: 'scope,
{
    match file.sections.get(index) {
        Some(SectionSlot::Merge(msec)) => {
            msec.is_alive.store(true, Ordering::Relaxed);
        }
        Some(SectionSlot::Regular(section)) => {
            if section
                .is_alive
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            // COMDAT groups live and die as a unit.
            for (_, members) in &file.comdat_groups {
                if members.contains(&(index as u32)) {
                    for &member in members {
                        if member as usize != index {
                            mark_section(file, member as usize, scope);
                        }
                    }
                }
            }
            scope.spawn(move |scope| {
                let Some(SectionSlot::Regular(section)) = file.sections.get(index) else {
                    return;
                };
                for rel in section.relocations {
                    let sym_index = rel.r_sym(LE, false) as usize;
                    if sym_index < file.first_global() {
                        if let Some(esym) = file.elf_syms().get(sym_index) {
                            mark_section(file, usize::from(esym.st_shndx(LE)), scope);
                        }
                    } else {
                        mark_symbol_section(file.global(sym_index), scope);
                    }
                }
            });
        }
        _ => {}
    }
}
