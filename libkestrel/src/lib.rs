use crate::args::Args;
use crate::comdat::ComdatRegistry;
use crate::context::LinkContext;
use crate::context::OutputChunks;
use crate::diagnostics::DiagnosticSink;
use crate::error::Result;
use crate::input_data::FileReader;
use crate::output_file::OutputFile;
use crate::output_sections::ChunkId;
use crate::output_sections::ChunkKind;
use crate::output_sections::SectionRegistry;
use crate::parsing::ObjectFile;
use crate::parsing::ParseResources;
use crate::parsing::SharedFile;
use crate::string_merging::MergedRegistry;
use crate::symbol_db::SymbolDb;
use colosseum::sync::Arena;
use rayon::iter::IntoParallelRefIterator;
use rayon::iter::ParallelIterator;
use std::sync::atomic::Ordering;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub(crate) mod archive;
pub mod args;
pub(crate) mod comdat;
pub(crate) mod context;
pub(crate) mod diagnostics;
pub(crate) mod elf;
pub(crate) mod elf_writer;
pub mod error;
pub(crate) mod file_kind;
pub(crate) mod gc;
pub(crate) mod hash;
pub(crate) mod icf;
pub(crate) mod input_data;
pub(crate) mod layout;
pub(crate) mod linker_script;
pub(crate) mod output_file;
pub(crate) mod output_sections;
pub(crate) mod parsing;
pub(crate) mod resolution;
pub(crate) mod scan;
pub(crate) mod string_merging;
pub(crate) mod strtab;
pub(crate) mod symbol_db;
pub(crate) mod synthetic;
#[cfg(test)]
pub(crate) mod test_elf;
pub(crate) mod x86_64;

pub struct Linker {
    args: Args,
}

impl Linker {
    pub fn from_args<S: AsRef<str>, I: Iterator<Item = S>>(input: I) -> Result<Self> {
        Ok(Linker {
            args: args::parse(input)?,
        })
    }

    pub fn run(&self) -> Result {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer())
            .with(EnvFilter::from_default_env())
            .init();

        let result = link(&self.args);
        if result.is_err() {
            output_file::remove_abandoned_tmpfile();
        }
        result
    }
}

#[tracing::instrument(skip_all, name = "Link")]
fn link(args: &Args) -> Result {
    args.setup_thread_pool()?;
    output_file::install_signal_handlers();

    // Everything parsed out of the inputs lives in these arenas. Files and symbols reference
    // each other freely, so the arenas are given process lifetime; a batch linker exits as soon
    // as the output is written and the memory goes back to the OS then.
    let mmap_arena: &'static Arena<memmap2::Mmap> = Box::leak(Box::new(Arena::new()));
    let obj_arena: &'static Arena<ObjectFile> = Box::leak(Box::new(Arena::new()));
    let dso_arena: &'static Arena<SharedFile> = Box::leak(Box::new(Arena::new()));
    let symbol_arena = Box::leak(Box::new(Arena::new()));
    let name_arena = Box::leak(Box::new(Arena::new()));
    let piece_arena = Box::leak(Box::new(Arena::new()));
    let merge_map_arena = Box::leak(Box::new(Arena::new()));
    let comdat_arena = Box::leak(Box::new(Arena::new()));

    let symbol_db = SymbolDb::new(symbol_arena, name_arena);
    let comdats = ComdatRegistry::new(comdat_arena);
    let sections_registry = SectionRegistry::default();
    let merged_registry = MergedRegistry::new();

    for name in &args.trace_symbol {
        symbol_db
            .intern_owned(name.as_bytes())
            .traced
            .store(true, Ordering::Relaxed);
    }

    let (objs, dsos, entry_from_script) = {
        let res = ParseResources {
            symbol_db: &symbol_db,
            comdats: &comdats,
            sections_registry: &sections_registry,
            merged_registry: &merged_registry,
            piece_arena,
            merge_map_arena,
        };
        let mut reader = FileReader::new(args, &res, mmap_arena);
        if args.preload {
            reader.preload()?;
        }
        let (objs, dsos) = reader.read_input_files()?;
        (objs, dsos, reader.entry_from_script)
    };

    if objs.is_empty() && dsos.is_empty() {
        anyhow::bail!("no input files");
    }

    let entry_name = args
        .entry
        .clone()
        .or(entry_from_script)
        .unwrap_or_else(|| "_start".to_owned());

    // Shared objects with the same soname are the same library; the first one wins.
    let mut dsos = dsos;
    let mut seen_sonames = hashbrown::HashSet::new();
    dsos.retain(|dso| seen_sonames.insert(dso.soname.clone()));

    // Priorities decide every resolution tie: directly listed objects, then archive members,
    // then shared objects, in input order.
    let mut objs = objs;
    let mut priority = 1;
    for obj in objs.iter_mut().filter(|o| !o.is_in_lib) {
        obj.priority = priority;
        priority += 1;
    }
    for obj in objs.iter_mut().filter(|o| o.is_in_lib) {
        obj.priority = priority;
        priority += 1;
    }
    for dso in &mut dsos {
        dso.priority = priority;
        priority += 1;
    }

    let objs: Vec<&ObjectFile> = objs.into_iter().map(|o| &*obj_arena.alloc(o)).collect();
    let dsos: Vec<&SharedFile> = dsos.into_iter().map(|d| &*dso_arena.alloc(d)).collect();

    let diag = DiagnosticSink::default();
    let mut ctx = LinkContext {
        args,
        symbol_db: &symbol_db,
        diag: &diag,
        objs,
        dsos,
        out: OutputChunks::new(sections_registry.into_defs(), merged_registry.into_defs()),
        synthetic_symbols: Vec::new(),
        entry_name,
    };

    // Resolve symbols and fix the set of files included in the output.
    resolution::resolve_symbols(&mut ctx);

    if args.trace {
        for file in &ctx.objs {
            eprintln!("{}", file.name);
        }
        for dso in &ctx.dsos {
            eprintln!("{}", dso.path.display());
        }
    }

    synthetic::define_synthetic_symbols(&mut ctx);

    // Remove duplicate COMDAT groups (e.g. inline functions instantiated in many objects).
    ctx.objs
        .par_iter()
        .for_each(|file| file.resolve_comdat_groups());
    ctx.objs
        .par_iter()
        .for_each(|file| file.eliminate_duplicate_comdat_groups());

    resolution::convert_common_symbols(&mut ctx);

    if args.gc_sections {
        gc::gc_sections(&ctx);
    }
    if args.icf {
        icf::icf_sections(&ctx);
    }

    // Deduplicate mergeable string contents, then build the output section contents.
    layout::handle_mergeable_strings(&mut ctx);
    layout::bin_sections(&mut ctx);
    layout::set_isec_offsets(&mut ctx);

    // Weak references that found no definition become absolute zeros; for shared objects any
    // remaining undefined becomes an import.
    ctx.objs
        .par_iter()
        .for_each(|file| file.handle_undefined_weak_symbols());
    if args.is_shared() {
        ctx.objs
            .par_iter()
            .for_each(|file| file.claim_unresolved_symbols());
    }

    // Beyond this point no new symbols are added to the result.
    if !args.allow_multiple_definition {
        ctx.objs
            .par_iter()
            .for_each(|file| file.check_duplicate_symbols(&diag));
        diag.checkpoint()?;
    }

    if args.is_shared() {
        ctx.objs
            .par_iter()
            .for_each(|file| file.compute_visibility(args));
    }

    // Scan relocations to find which dynamic tables each symbol needs, then allocate indices.
    scan::export_dynamic(&ctx);
    scan::scan_relocations(&ctx)?;
    scan::allocate_dynamic_entries(&mut ctx);
    scan::sort_dynsym(&mut ctx);
    scan::fill_verneed(&mut ctx);
    scan::plan_dynamic_section(&mut ctx);

    elf_writer::compute_symtab(&mut ctx);
    elf_writer::compute_build_id_size(&mut ctx);
    elf_writer::compute_eh_frame_hdr_size(&mut ctx);

    // Order the chunks, assign section indices and plan program headers, then fix all file
    // offsets and addresses. Nothing moves after this.
    layout::assemble_chunks(&mut ctx);
    layout::prune_and_index_chunks(&mut ctx);

    let segments = layout::plan_segments(&ctx);
    ctx.out.ehdr.sh_size = size_of::<elf::FileHeader>() as u64;
    ctx.out.phdr.sh_size = segments.len() as u64 * size_of::<elf::ProgramHeader>() as u64;

    let filesize = layout::set_osec_offsets(&mut ctx, &segments);
    ctx.out.segments = segments;

    elf_writer::compute_tls_bounds(&mut ctx);
    synthetic::fix_synthetic_symbols(&ctx);

    // Copy everything to the output and apply relocations.
    let mut output = OutputFile::create(&args.output, filesize)?;
    elf_writer::write_output(&ctx, &mut output.buffer)?;
    elf_writer::write_build_id(&ctx, &mut output.buffer)?;
    output.close()?;

    if args.print_map {
        print_map(&ctx);
    }
    if args.print_stats {
        print_stats(&ctx);
    }

    Ok(())
}

fn print_map(ctx: &LinkContext) {
    println!("{:>18} {:>10} {:>6} section", "address", "size", "align");
    for &id in &ctx.out.chunks {
        let hdr = ctx.out.hdr(id);
        if id.kind() == ChunkKind::Header {
            continue;
        }
        println!(
            "{:>#18x} {:>#10x} {:>6} {}",
            hdr.sh_addr,
            hdr.sh_size,
            hdr.sh_addralign,
            String::from_utf8_lossy(&hdr.name),
        );
        if let ChunkId::Regular(index) = id {
            for member in &ctx.out.regular[index as usize].members {
                let isec = member.get();
                println!(
                    "{:>#18x} {:>#10x} {:>6}         {}:({})",
                    hdr.sh_addr + isec.offset.load(Ordering::Relaxed),
                    isec.sh_size(),
                    isec.sh_addralign(),
                    member.file.name,
                    String::from_utf8_lossy(isec.name),
                );
            }
        }
    }
}

fn print_stats(ctx: &LinkContext) {
    let mut defined = 0usize;
    let mut undefined = 0usize;
    let mut input_sections = 0usize;
    for file in &ctx.objs {
        let elf_syms = file.elf_syms();
        defined += file.first_global().saturating_sub(1);
        undefined += elf_syms.len().saturating_sub(file.first_global());
        input_sections += file.sections.len();
    }
    eprintln!("defined_syms={defined}");
    eprintln!("undefined_syms={undefined}");
    eprintln!("input_sections={input_sections}");
    eprintln!("output_chunks={}", ctx.out.chunks.len());
    eprintln!("num_objs={}", ctx.objs.len());
    eprintln!("num_dsos={}", ctx.dsos.len());
}
