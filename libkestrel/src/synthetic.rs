//! Linker-synthesised symbols: `_end`, `__bss_start`, `__start_X`/`__stop_X` and friends.
//! They're claimed right after resolution so that references to them don't read as undefined,
//! and their values are fixed once chunk addresses are known.

use crate::context::LinkContext;
use crate::elf::is_c_identifier;
use crate::output_sections::ChunkId;
use crate::output_sections::ChunkKind;
use crate::symbol_db::Symbol;
use crate::symbol_db::SymbolPlacement;

const SYNTHETIC_NAMES: &[&[u8]] = &[
    b"__bss_start",
    b"__ehdr_start",
    b"__rela_iplt_start",
    b"__rela_iplt_end",
    b"__init_array_start",
    b"__init_array_end",
    b"__fini_array_start",
    b"__fini_array_end",
    b"_end",
    b"end",
    b"_etext",
    b"etext",
    b"_edata",
    b"edata",
    b"_DYNAMIC",
    b"_GLOBAL_OFFSET_TABLE_",
    b"__GNU_EH_FRAME_HDR",
];

/// Claims every well-known synthetic name that no input file defined. Also synthesises
/// `__start_<name>` / `__stop_<name>` for each output section whose name is a C identifier.
#[tracing::instrument(skip_all, name = "Define synthetic symbols")]
pub(crate) fn define_synthetic_symbols<'data>(ctx: &mut LinkContext<'_, 'data>) {
    let mut names: Vec<Vec<u8>> = SYNTHETIC_NAMES.iter().map(|n| n.to_vec()).collect();

    for osec in &ctx.out.regular {
        if is_c_identifier(&osec.hdr.name) {
            for prefix in [b"__start_" as &[u8], b"__stop_"] {
                let mut name = prefix.to_vec();
                name.extend_from_slice(&osec.hdr.name);
                names.push(name);
            }
        }
    }

    for name in names {
        let sym = ctx.symbol_db.intern_owned(&name);
        let mut claimed = false;
        sym.update_def(|def| {
            if def.placement == SymbolPlacement::Undefined {
                def.placement = SymbolPlacement::OutputChunk(ChunkId::Ehdr);
                def.value = 0;
                def.rank = 0;
                claimed = true;
            }
        });
        if claimed {
            ctx.synthetic_symbols.push(sym);
        }
    }
}

/// Fixes the addresses of the claimed synthetic symbols. Must run after chunk offsets are
/// final; nothing may move afterwards.
#[tracing::instrument(skip_all, name = "Fix synthetic symbols")]
pub(crate) fn fix_synthetic_symbols(ctx: &LinkContext) {
    let chunks = &ctx.out.chunks;

    let start = |sym: &Symbol, id: ChunkId| {
        sym.update_def(|def| {
            def.placement = SymbolPlacement::OutputChunk(id);
            def.value = 0;
        });
    };
    let stop = |sym: &Symbol, id: ChunkId| {
        let size = ctx.out.hdr(id).sh_size;
        sym.update_def(|def| {
            def.placement = SymbolPlacement::OutputChunk(id);
            def.value = size;
        });
    };

    let find = |name: &[u8]| {
        ctx.synthetic_symbols
            .iter()
            .copied()
            .find(|sym| sym.name == name)
    };

    if let Some(sym) = find(b"__bss_start") {
        if let Some(&id) = chunks.iter().find(|&&id| {
            matches!(id, ChunkId::Regular(_)) && ctx.out.hdr(id).name == b".bss"
        }) {
            start(sym, id);
        }
    }

    if let Some(sym) = find(b"__ehdr_start") {
        start(sym, ChunkId::Ehdr);
    }

    if let Some(sym) = find(b"__rela_iplt_start") {
        start(sym, ChunkId::RelPlt);
    }
    if let Some(sym) = find(b"__rela_iplt_end") {
        stop(sym, ChunkId::RelPlt);
    }

    for &id in chunks {
        let hdr = ctx.out.hdr(id);
        match hdr.sh_type {
            object::elf::SHT_INIT_ARRAY => {
                if let Some(sym) = find(b"__init_array_start") {
                    start(sym, id);
                }
                if let Some(sym) = find(b"__init_array_end") {
                    stop(sym, id);
                }
            }
            object::elf::SHT_FINI_ARRAY => {
                if let Some(sym) = find(b"__fini_array_start") {
                    start(sym, id);
                }
                if let Some(sym) = find(b"__fini_array_end") {
                    stop(sym, id);
                }
            }
            _ => {}
        }
    }

    let mut last_alloc = None;
    let mut last_exec = None;
    let mut last_data = None;
    for &id in chunks {
        if id.kind() == ChunkKind::Header {
            continue;
        }
        let hdr = ctx.out.hdr(id);
        if hdr.is_alloc() {
            last_alloc = Some(id);
            if !hdr.is_nobits() {
                last_data = Some(id);
            }
        }
        if hdr.sh_flags & u64::from(object::elf::SHF_EXECINSTR) != 0 {
            last_exec = Some(id);
        }
    }
    for (names, chunk) in [
        ([b"_end" as &[u8], b"end" as &[u8]], last_alloc),
        ([b"_etext", b"etext"], last_exec),
        ([b"_edata", b"edata"], last_data),
    ] {
        if let Some(id) = chunk {
            for name in names {
                if let Some(sym) = find(name) {
                    stop(sym, id);
                }
            }
        }
    }

    if let Some(sym) = find(b"_DYNAMIC") {
        start(sym, ChunkId::Dynamic);
    }
    if let Some(sym) = find(b"_GLOBAL_OFFSET_TABLE_") {
        start(sym, ChunkId::GotPlt);
    }
    if let Some(sym) = find(b"__GNU_EH_FRAME_HDR") {
        start(sym, ChunkId::EhFrameHdr);
    }

    for (index, osec) in ctx.out.regular.iter().enumerate() {
        if !is_c_identifier(&osec.hdr.name) {
            continue;
        }
        let id = ChunkId::Regular(index as u32);
        for (prefix, at_end) in [(b"__start_" as &[u8], false), (b"__stop_", true)] {
            let mut name = prefix.to_vec();
            name.extend_from_slice(&osec.hdr.name);
            if let Some(sym) = find(&name) {
                if at_end {
                    stop(sym, id);
                } else {
                    start(sym, id);
                }
            }
        }
    }
}
