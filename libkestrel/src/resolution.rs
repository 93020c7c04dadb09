//! Symbol resolution and the liveness walk that decides which archive members and as-needed
//! shared objects make it into the output.

use crate::context::LinkContext;
use crate::elf::align_to;
use crate::parsing::InputRef;
use crate::parsing::ObjectFile;
use crate::symbol_db::SymbolPlacement;
use rayon::iter::IntoParallelRefIterator;
use rayon::iter::ParallelIterator;
use std::sync::atomic::Ordering;

/// Runs `resolve_symbols` on every input, then computes the live set and prunes both
/// collections. Output is a pure function of the input set and order: ranking ties break on
/// file priority, never on scheduling.
#[tracing::instrument(skip_all, name = "Resolve symbols")]
pub(crate) fn resolve_symbols(ctx: &mut LinkContext) {
    ctx.objs.par_iter().for_each(|file| file.resolve_symbols());
    ctx.dsos.par_iter().for_each(|file| file.resolve_symbols());

    mark_live(ctx);

    ctx.objs.retain(|file| file.is_alive.load(Ordering::Relaxed));
    ctx.dsos.retain(|file| file.is_alive.load(Ordering::Relaxed));
}

/// The reachability walk. Seeds: every directly listed object, every not-as-needed shared
/// object, and whatever `--undefined` and the entry symbol resolve into. A file joins the
/// frontier if and only if its `is_alive` compare-exchange succeeds.
fn mark_live<'data>(ctx: &LinkContext<'_, 'data>) {
    let mut roots: Vec<&'data ObjectFile<'data>> = Vec::new();

    for &obj in &ctx.objs {
        if !obj.is_in_lib && mark(InputRef::Object(obj)) {
            roots.push(obj);
        }
    }
    for &dso in &ctx.dsos {
        if !dso.as_needed {
            mark(InputRef::Shared(dso));
        }
    }

    for name in ctx
        .args
        .undefined
        .iter()
        .chain(std::iter::once(&ctx.entry_name))
    {
        let Some(sym) = ctx.symbol_db.get(name.as_bytes()) else {
            continue;
        };
        if let Some(file) = sym.def().file {
            if mark(file) {
                if let InputRef::Object(obj) = file {
                    roots.push(obj);
                }
            }
        }
    }

    rayon::scope(|scope| {
        for root in roots {
            scope.spawn(move |scope| process_object(root, scope));
        }
    });
}

fn mark(file: InputRef) -> bool {
    file.is_alive()
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

fn process_object<'data, 'scope>(file: &'data ObjectFile<'data>, scope: &rayon::Scope<'scope>)
where
    'data: 'scope,
{
    file.mark_live_objects(|next| scope.spawn(move |scope| process_object(next, scope)));
}

/// Gives every common symbol that survived resolution backing storage in the common-storage
/// chunk. The common symbol's value field holds its alignment; its size is the allocation size.
#[tracing::instrument(skip_all, name = "Convert common symbols")]
pub(crate) fn convert_common_symbols(ctx: &mut LinkContext) {
    let mut offset = 0u64;
    let mut max_align = 1u64;
    for obj in &ctx.objs {
        for i in obj.first_global()..obj.elf_syms().len() {
            let sym = obj.global(i);
            let def = sym.def();
            if def.placement != SymbolPlacement::Common {
                continue;
            }
            if !matches!(def.file, Some(InputRef::Object(o)) if std::ptr::eq(o, *obj)) {
                continue;
            }
            let alignment = def.value.max(1);
            offset = align_to(offset, alignment);
            sym.update_def(|d| {
                d.placement = SymbolPlacement::OutputChunk(crate::output_sections::ChunkId::Common);
                d.value = offset;
            });
            offset += def.size;
            max_align = max_align.max(alignment);
        }
    }
    ctx.out.common.sh_size = offset;
    ctx.out.common.sh_addralign = max_align;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::Args;
    use crate::context::LinkContext;
    use crate::context::OutputChunks;
    use crate::diagnostics::DiagnosticSink;
    use crate::parsing::test_support::TestWorld;
    use crate::symbol_db::SymbolPlacement;
    use crate::test_elf::ObjBuilder;
    use crate::test_elf::SEC_TEXT;

    fn ctx_with<'a>(
        world: &TestWorld,
        args: &'a Args,
        diag: &'a DiagnosticSink,
        objs: Vec<&'static ObjectFile<'static>>,
    ) -> LinkContext<'a, 'static> {
        LinkContext {
            args,
            symbol_db: world.symbol_db,
            diag,
            objs,
            dsos: Vec::new(),
            out: OutputChunks::new(Vec::new(), Vec::new()),
            synthetic_symbols: Vec::new(),
            entry_name: "_start".to_owned(),
        }
    }

    fn defines(name: &[u8], body: &[u8]) -> Vec<u8> {
        let mut builder = ObjBuilder::new();
        let text = builder.section(b".text", object::elf::SHT_PROGBITS, SEC_TEXT, body);
        builder.global(name, Some(text), 0, body.len() as u64);
        builder.build()
    }

    #[test]
    fn test_archive_members_load_only_when_referenced() {
        let world = TestWorld::new();

        let mut main_builder = ObjBuilder::new();
        let text = main_builder.section(b".text", object::elf::SHT_PROGBITS, SEC_TEXT, &[0; 8]);
        main_builder.global(b"main", Some(text), 0, 8);
        main_builder.global(b"bar", None, 0, 0);
        let main = world.add_object(main_builder.build(), "main.o", false, 1);
        let bar = world.add_object(defines(b"bar", &[0xc3]), "libx.a(bar.o)", true, 2);
        let baz = world.add_object(defines(b"baz", &[0xc3]), "libx.a(baz.o)", true, 3);

        let args = Args::default();
        let diag = DiagnosticSink::default();
        let mut ctx = ctx_with(&world, &args, &diag, vec![main, bar, baz]);
        resolve_symbols(&mut ctx);

        assert_eq!(ctx.objs.len(), 2);
        assert!(ctx.objs.iter().any(|o| o.name == "libx.a(bar.o)"));
        assert!(!ctx.objs.iter().any(|o| o.name == "libx.a(baz.o)"));

        // Resolution totality: the undefined reference now maps to the member's definition.
        let bar_sym = world.symbol_db.get(b"bar").unwrap();
        let def = bar_sym.def();
        assert!(matches!(def.file, Some(InputRef::Object(o)) if std::ptr::eq(o, bar)));
        assert!(matches!(def.placement, SymbolPlacement::Section(_)));
    }

    #[test]
    fn test_strong_beats_weak_and_ties_break_on_priority() {
        let world = TestWorld::new();

        let mut weak_builder = ObjBuilder::new();
        let text = weak_builder.section(b".text", object::elf::SHT_PROGBITS, SEC_TEXT, &[0; 4]);
        weak_builder.global_with(
            b"foo",
            Some(text),
            0,
            4,
            object::elf::STB_WEAK,
            object::elf::STT_FUNC,
        );
        let weak = world.add_object(weak_builder.build(), "weak.o", false, 1);
        let strong = world.add_object(defines(b"foo", &[0xc3; 4]), "strong.o", false, 2);

        let args = Args::default();
        let diag = DiagnosticSink::default();
        let mut ctx = ctx_with(&world, &args, &diag, vec![weak, strong]);
        resolve_symbols(&mut ctx);

        let foo = world.symbol_db.get(b"foo").unwrap();
        assert!(
            matches!(foo.def().file, Some(InputRef::Object(o)) if std::ptr::eq(o, strong)),
            "the strong definition must win despite its higher priority number"
        );

        // Two equally strong definitions tie-break on the lower priority number.
        let dup_a = world.add_object(defines(b"dup", &[1]), "dup_a.o", false, 3);
        let dup_b = world.add_object(defines(b"dup", &[1]), "dup_b.o", false, 4);
        let mut ctx = ctx_with(&world, &args, &diag, vec![dup_a, dup_b]);
        resolve_symbols(&mut ctx);

        let dup = world.symbol_db.get(b"dup").unwrap();
        assert!(matches!(dup.def().file, Some(InputRef::Object(o)) if std::ptr::eq(o, dup_a)));

        // The losing strong definition is diagnosed as a duplicate.
        dup_b.check_duplicate_symbols(&diag);
        assert!(diag.has_errors());
        assert!(diag.checkpoint().is_err());
    }

    #[test]
    fn test_common_symbols_get_backing_storage() {
        let world = TestWorld::new();

        let mut builder = ObjBuilder::new();
        builder.section(b".text", object::elf::SHT_PROGBITS, SEC_TEXT, &[0; 4]);
        builder.common(b"shared_buf", 8, 16);
        let a = world.add_object(builder.build(), "a.o", false, 1);

        let args = Args::default();
        let diag = DiagnosticSink::default();
        let mut ctx = ctx_with(&world, &args, &diag, vec![a]);
        resolve_symbols(&mut ctx);
        convert_common_symbols(&mut ctx);

        assert_eq!(ctx.out.common.sh_size, 16);
        assert_eq!(ctx.out.common.sh_addralign, 8);
        let sym = world.symbol_db.get(b"shared_buf").unwrap();
        assert!(matches!(
            sym.def().placement,
            SymbolPlacement::OutputChunk(crate::output_sections::ChunkId::Common)
        ));
        assert_eq!(sym.def().value, 0);
    }
}
