//! Identity and ordering of output sections. Input sections are assigned to output sections by
//! canonicalised name during parsing; the registries hand out stable IDs that later passes use
//! as vector indices.

use crate::hash::HashMap;
use std::sync::Mutex;

/// Identifies every chunk that can appear in the output file. Synthetic chunks are enumerated
/// directly; regular and merged sections are indexed into their registries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ChunkId {
    Ehdr,
    Phdr,
    Interp,
    Got,
    Plt,
    GotPlt,
    PltGot,
    RelPlt,
    RelDyn,
    Dynamic,
    Dynsym,
    Dynstr,
    Hash,
    GnuHash,
    Versym,
    Verneed,
    Copyrel,
    CopyrelRelro,
    Common,
    EhFrameHdr,
    BuildId,
    Symtab,
    Strtab,
    Shstrtab,
    Shdr,
    Regular(u32),
    Merged(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChunkKind {
    /// The ELF header, program headers and section headers.
    Header,

    /// Carries bytes copied from input sections.
    Regular,

    /// Content generated by the linker.
    Synthetic,
}

impl ChunkId {
    pub(crate) fn kind(self) -> ChunkKind {
        match self {
            ChunkId::Ehdr | ChunkId::Phdr | ChunkId::Shdr => ChunkKind::Header,
            ChunkId::Regular(_) | ChunkId::Merged(_) => ChunkKind::Regular,
            _ => ChunkKind::Synthetic,
        }
    }
}

/// The section header fields we manage for every output chunk. Sizes are fixed during layout;
/// offsets and addresses during offset assignment; nothing here changes once relocation
/// application begins.
#[derive(Debug, Clone, Default)]
pub(crate) struct SectionHdr {
    pub(crate) name: Vec<u8>,
    pub(crate) sh_type: u32,
    pub(crate) sh_flags: u64,
    pub(crate) sh_addralign: u64,
    pub(crate) sh_size: u64,
    pub(crate) sh_offset: u64,
    pub(crate) sh_addr: u64,
    pub(crate) sh_entsize: u64,
    pub(crate) sh_link: u32,
    pub(crate) sh_info: u32,

    /// Output section index, assigned late. Zero means "not in the section table".
    pub(crate) shndx: u32,
}

impl SectionHdr {
    pub(crate) fn new(name: &[u8], sh_type: u32, sh_flags: u64) -> Self {
        Self {
            name: name.to_vec(),
            sh_type,
            sh_flags,
            sh_addralign: 1,
            ..Default::default()
        }
    }

    pub(crate) fn is_alloc(&self) -> bool {
        self.sh_flags & u64::from(object::elf::SHF_ALLOC) != 0
    }

    pub(crate) fn is_nobits(&self) -> bool {
        self.sh_type == object::elf::SHT_NOBITS
    }

    /// End of the chunk in the file image. NOBITS chunks occupy no file bytes.
    pub(crate) fn file_end(&self) -> u64 {
        if self.is_nobits() {
            self.sh_offset
        } else {
            self.sh_offset + self.sh_size
        }
    }
}

/// Sort key that groups chunks so that the fewest possible `PT_LOAD` segments are needed:
/// note, readonly data, readonly code, writable tdata, writable tbss, writable data, writable
/// bss, then nonalloc.
pub(crate) fn section_rank(hdr: &SectionHdr) -> u32 {
    let note = hdr.sh_type == object::elf::SHT_NOTE;
    let alloc = hdr.sh_flags & u64::from(object::elf::SHF_ALLOC) != 0;
    let writable = hdr.sh_flags & u64::from(object::elf::SHF_WRITE) != 0;
    let exec = hdr.sh_flags & u64::from(object::elf::SHF_EXECINSTR) != 0;
    let tls = hdr.sh_flags & u64::from(object::elf::SHF_TLS) != 0;
    let nobits = hdr.sh_type == object::elf::SHT_NOBITS;
    (u32::from(!note) << 6)
        | (u32::from(!alloc) << 5)
        | (u32::from(writable) << 4)
        | (u32::from(exec) << 3)
        | (u32::from(!tls) << 2)
        | u32::from(nobits)
}

/// Input section name prefixes that fold into a common output section. Longer prefixes are
/// listed first so that e.g. `.data.rel.ro.foo` isn't claimed by `.data`.
const OUTPUT_NAME_PREFIXES: &[&[u8]] = &[
    b".text",
    b".data.rel.ro",
    b".data",
    b".rodata",
    b".bss.rel.ro",
    b".bss",
    b".init_array",
    b".fini_array",
    b".tbss",
    b".tdata",
    b".gcc_except_table",
    b".ctors",
    b".dtors",
];

/// Maps an input section name to the name of the output section it should land in.
pub(crate) fn output_section_name(name: &[u8]) -> &[u8] {
    for prefix in OUTPUT_NAME_PREFIXES {
        if name == *prefix {
            return prefix;
        }
        if name.len() > prefix.len() && name.starts_with(prefix) && name[prefix.len()] == b'.' {
            return prefix;
        }
    }
    name
}

pub(crate) const FLAG_MASK: u64 = !(object::elf::SHF_GROUP as u64
    | object::elf::SHF_COMPRESSED as u64
    | object::elf::SHF_MERGE as u64
    | object::elf::SHF_STRINGS as u64
    | object::elf::SHF_INFO_LINK as u64);

#[derive(Clone, PartialEq, Eq, Hash)]
struct SectionKey {
    name: Vec<u8>,
    sh_type: u32,
    sh_flags: u64,
}

/// Hands out stable IDs for output sections during the parallel parse. IDs index into the
/// section vectors that `LinkContext` builds once parsing has finished.
#[derive(Default)]
pub(crate) struct SectionRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    map: HashMap<SectionKey, u32>,
    defs: Vec<SectionDef>,
}

/// The identity of an output section as established at registration time.
#[derive(Clone)]
pub(crate) struct SectionDef {
    pub(crate) name: Vec<u8>,
    pub(crate) sh_type: u32,
    pub(crate) sh_flags: u64,
    pub(crate) sh_entsize: u64,
}

impl SectionRegistry {
    /// Returns the ID for the output section with the given identity, registering it on first
    /// use. `sh_flags` should already be masked with `FLAG_MASK`.
    pub(crate) fn get_instance(&self, name: &[u8], sh_type: u32, sh_flags: u64, sh_entsize: u64) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        let key = SectionKey {
            name: name.to_vec(),
            sh_type,
            sh_flags,
        };
        if let Some(&id) = inner.map.get(&key) {
            return id;
        }
        let id = inner.defs.len() as u32;
        inner.defs.push(SectionDef {
            name: name.to_vec(),
            sh_type,
            sh_flags,
            sh_entsize,
        });
        inner.map.insert(key, id);
        id
    }

    pub(crate) fn into_defs(self) -> Vec<SectionDef> {
        self.inner.into_inner().unwrap().defs
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap().defs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_section_name() {
        assert_eq!(output_section_name(b".text.unlikely"), b".text");
        assert_eq!(output_section_name(b".text"), b".text");
        assert_eq!(output_section_name(b".data.rel.ro.local"), b".data.rel.ro");
        assert_eq!(output_section_name(b".data.foo"), b".data");
        assert_eq!(output_section_name(b".textual"), b".textual");
        assert_eq!(output_section_name(b"my_section"), b"my_section");
    }

    #[test]
    fn test_section_rank_ordering() {
        let mk = |sh_type, sh_flags: u64| SectionHdr {
            sh_type,
            sh_flags,
            ..Default::default()
        };
        let a = u64::from(object::elf::SHF_ALLOC);
        let w = u64::from(object::elf::SHF_WRITE);
        let x = u64::from(object::elf::SHF_EXECINSTR);
        let t = u64::from(object::elf::SHF_TLS);

        let note = mk(object::elf::SHT_NOTE, a);
        let rodata = mk(object::elf::SHT_PROGBITS, a);
        let text = mk(object::elf::SHT_PROGBITS, a | x);
        let tdata = mk(object::elf::SHT_PROGBITS, a | w | t);
        let tbss = mk(object::elf::SHT_NOBITS, a | w | t);
        let data = mk(object::elf::SHT_PROGBITS, a | w);
        let bss = mk(object::elf::SHT_NOBITS, a | w);
        let nonalloc = mk(object::elf::SHT_PROGBITS, 0);

        let ranks: Vec<u32> = [&note, &rodata, &text, &tdata, &tbss, &data, &bss, &nonalloc]
            .iter()
            .map(|h| section_rank(h))
            .collect();
        let mut sorted = ranks.clone();
        sorted.sort_unstable();
        assert_eq!(ranks, sorted, "ranks should already be in the layout order");
    }

    #[test]
    fn test_registry_dedup() {
        let registry = SectionRegistry::default();
        let a = registry.get_instance(b".text", object::elf::SHT_PROGBITS, 6, 0);
        let b = registry.get_instance(b".text", object::elf::SHT_PROGBITS, 6, 0);
        let c = registry.get_instance(b".data", object::elf::SHT_PROGBITS, 3, 0);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(registry.len(), 2);
    }
}
