//! Test helper that assembles minimal relocatable objects in memory, so that parsing and
//! resolution tests don't depend on a toolchain being installed.

use crate::elf;
use crate::elf::LE;
use object::U16;
use object::U32;
use object::U64;

pub(crate) struct ObjBuilder {
    sections: Vec<BuilderSection>,
    symbols: Vec<BuilderSymbol>,
    groups: Vec<BuilderGroup>,
}

struct BuilderSection {
    name: Vec<u8>,
    sh_type: u32,
    sh_flags: u64,
    sh_addralign: u64,
    sh_entsize: u64,
    data: Vec<u8>,
    relocations: Vec<BuilderReloc>,
}

struct BuilderSymbol {
    name: Vec<u8>,
    /// Index into the builder's section list, or a raw st_shndx value for special sections.
    shndx: u16,
    value: u64,
    size: u64,
    info: u8,
    other: u8,
}

pub(crate) struct BuilderGroup {
    signature_symbol: usize,
    members: Vec<usize>,
}

/// Relocation against a symbol by builder symbol index.
pub(crate) struct BuilderReloc {
    pub(crate) offset: u64,
    pub(crate) r_type: u32,
    pub(crate) symbol: usize,
    pub(crate) addend: i64,
}

pub(crate) const SEC_TEXT: u64 =
    (object::elf::SHF_ALLOC | object::elf::SHF_EXECINSTR) as u64;
pub(crate) const SEC_DATA: u64 = (object::elf::SHF_ALLOC | object::elf::SHF_WRITE) as u64;
pub(crate) const SEC_MERGE_STRINGS: u64 =
    (object::elf::SHF_ALLOC | object::elf::SHF_MERGE | object::elf::SHF_STRINGS) as u64;

impl ObjBuilder {
    pub(crate) fn new() -> Self {
        Self {
            sections: Vec::new(),
            symbols: Vec::new(),
            groups: Vec::new(),
        }
    }

    /// Adds a section, returning its builder index (0-based; the ELF section index is one
    /// higher because of the null section).
    pub(crate) fn section(
        &mut self,
        name: &[u8],
        sh_type: u32,
        sh_flags: u64,
        data: &[u8],
    ) -> usize {
        self.sections.push(BuilderSection {
            name: name.to_vec(),
            sh_type,
            sh_flags,
            sh_addralign: 1,
            sh_entsize: 0,
            data: data.to_vec(),
            relocations: Vec::new(),
        });
        self.sections.len() - 1
    }

    pub(crate) fn align(&mut self, section: usize, alignment: u64) {
        self.sections[section].sh_addralign = alignment;
    }

    /// Adds a local STT_SECTION symbol for a section, returning the symbol's builder index.
    pub(crate) fn section_symbol(&mut self, section: usize) -> usize {
        self.symbols.push(BuilderSymbol {
            name: Vec::new(),
            shndx: section as u16 + 1,
            value: 0,
            size: 0,
            info: object::elf::STT_SECTION,
            other: 0,
        });
        self.symbols.len() - 1
    }

    pub(crate) fn global(
        &mut self,
        name: &[u8],
        section: Option<usize>,
        value: u64,
        size: u64,
    ) -> usize {
        self.global_with(name, section, value, size, object::elf::STB_GLOBAL, object::elf::STT_NOTYPE)
    }

    pub(crate) fn global_with(
        &mut self,
        name: &[u8],
        section: Option<usize>,
        value: u64,
        size: u64,
        bind: u8,
        sym_type: u8,
    ) -> usize {
        self.symbols.push(BuilderSymbol {
            name: name.to_vec(),
            shndx: section.map_or(object::elf::SHN_UNDEF, |s| s as u16 + 1),
            value,
            size,
            info: (bind << 4) | sym_type,
            other: 0,
        });
        self.symbols.len() - 1
    }

    pub(crate) fn common(&mut self, name: &[u8], alignment: u64, size: u64) -> usize {
        self.symbols.push(BuilderSymbol {
            name: name.to_vec(),
            shndx: object::elf::SHN_COMMON,
            value: alignment,
            size,
            info: (object::elf::STB_GLOBAL << 4) | object::elf::STT_OBJECT,
            other: 0,
        });
        self.symbols.len() - 1
    }

    pub(crate) fn reloc(&mut self, section: usize, reloc: BuilderReloc) {
        self.sections[section].relocations.push(reloc);
    }

    pub(crate) fn comdat_group(&mut self, signature_symbol: usize, members: Vec<usize>) {
        self.groups.push(BuilderGroup {
            signature_symbol,
            members,
        });
    }

    pub(crate) fn build(&self) -> Vec<u8> {
        // Symbols: null, then locals, then globals.
        let mut ordered: Vec<usize> = Vec::new();
        let mut local_count = 1; // the null symbol
        for (i, sym) in self.symbols.iter().enumerate() {
            if sym.info >> 4 == object::elf::STB_LOCAL {
                ordered.push(i);
                local_count += 1;
            }
        }
        for (i, sym) in self.symbols.iter().enumerate() {
            if sym.info >> 4 != object::elf::STB_LOCAL {
                ordered.push(i);
            }
        }
        // Maps builder symbol index -> ELF symbol index.
        let mut sym_index = vec![0u32; self.symbols.len()];
        for (elf_pos, &builder_idx) in ordered.iter().enumerate() {
            sym_index[builder_idx] = elf_pos as u32 + 1;
        }

        let mut strtab: Vec<u8> = vec![0];
        let mut sym_name_offsets = Vec::new();
        for sym in &self.symbols {
            if sym.name.is_empty() {
                sym_name_offsets.push(0u32);
            } else {
                sym_name_offsets.push(strtab.len() as u32);
                strtab.extend_from_slice(&sym.name);
                strtab.push(0);
            }
        }

        // Section layout: null, user sections, group sections, rela sections, symtab, strtab,
        // shstrtab.
        let num_user = self.sections.len();
        let num_groups = self.groups.len();
        let rela_sections: Vec<usize> = (0..num_user)
            .filter(|&i| !self.sections[i].relocations.is_empty())
            .collect();
        let symtab_index = 1 + num_user + num_groups + rela_sections.len();
        let strtab_index = symtab_index + 1;
        let shstrtab_index = strtab_index + 1;
        let num_sections = shstrtab_index + 1;

        let mut shstrtab: Vec<u8> = vec![0];
        let mut add_shname = |name: &[u8]| -> u32 {
            let off = shstrtab.len() as u32;
            shstrtab.extend_from_slice(name);
            shstrtab.push(0);
            off
        };

        struct OutSection {
            sh_name: u32,
            sh_type: u32,
            sh_flags: u64,
            sh_link: u32,
            sh_info: u32,
            sh_addralign: u64,
            sh_entsize: u64,
            data: Vec<u8>,
        }

        let mut out_sections: Vec<OutSection> = Vec::new();
        for section in &self.sections {
            out_sections.push(OutSection {
                sh_name: add_shname(&section.name),
                sh_type: section.sh_type,
                sh_flags: section.sh_flags,
                sh_link: 0,
                sh_info: 0,
                sh_addralign: section.sh_addralign,
                sh_entsize: section.sh_entsize,
                data: section.data.clone(),
            });
        }
        for group in &self.groups {
            let mut data = Vec::new();
            data.extend_from_slice(&object::elf::GRP_COMDAT.to_le_bytes());
            for &member in &group.members {
                data.extend_from_slice(&(member as u32 + 1).to_le_bytes());
            }
            out_sections.push(OutSection {
                sh_name: add_shname(b".group"),
                sh_type: object::elf::SHT_GROUP,
                sh_flags: 0,
                sh_link: symtab_index as u32,
                sh_info: sym_index[group.signature_symbol],
                sh_addralign: 4,
                sh_entsize: 4,
                data,
            });
        }
        for &target in &rela_sections {
            let mut data = Vec::new();
            for reloc in &self.sections[target].relocations {
                let rela = elf::Rela {
                    r_offset: U64::new(LE, reloc.offset),
                    r_info: U64::new(
                        LE,
                        (u64::from(sym_index[reloc.symbol]) << 32) | u64::from(reloc.r_type),
                    ),
                    r_addend: object::I64::new(LE, reloc.addend),
                };
                data.extend_from_slice(object::bytes_of(&rela));
            }
            let mut name = b".rela".to_vec();
            name.extend_from_slice(&self.sections[target].name);
            out_sections.push(OutSection {
                sh_name: add_shname(&name),
                sh_type: object::elf::SHT_RELA,
                sh_flags: 0,
                sh_link: symtab_index as u32,
                sh_info: target as u32 + 1,
                sh_addralign: 8,
                sh_entsize: size_of::<elf::Rela>() as u64,
                data,
            });
        }

        // Symbol table.
        let mut symtab_data = vec![0u8; size_of::<elf::Sym>()];
        for &builder_idx in &ordered {
            let sym = &self.symbols[builder_idx];
            let entry = elf::Sym {
                st_name: U32::new(LE, sym_name_offsets[builder_idx]),
                st_info: sym.info,
                st_other: sym.other,
                st_shndx: U16::new(LE, sym.shndx),
                st_value: U64::new(LE, sym.value),
                st_size: U64::new(LE, sym.size),
            };
            symtab_data.extend_from_slice(object::bytes_of(&entry));
        }
        out_sections.push(OutSection {
            sh_name: add_shname(b".symtab"),
            sh_type: object::elf::SHT_SYMTAB,
            sh_flags: 0,
            sh_link: strtab_index as u32,
            sh_info: local_count,
            sh_addralign: 8,
            sh_entsize: size_of::<elf::Sym>() as u64,
            data: symtab_data,
        });
        out_sections.push(OutSection {
            sh_name: add_shname(b".strtab"),
            sh_type: object::elf::SHT_STRTAB,
            sh_flags: 0,
            sh_link: 0,
            sh_info: 0,
            sh_addralign: 1,
            sh_entsize: 0,
            data: strtab,
        });
        let shstrtab_name = add_shname(b".shstrtab");
        let shstrtab_data = {
            // The name we just added must be in the table before it's frozen.
            shstrtab.clone()
        };
        out_sections.push(OutSection {
            sh_name: shstrtab_name,
            sh_type: object::elf::SHT_STRTAB,
            sh_flags: 0,
            sh_link: 0,
            sh_info: 0,
            sh_addralign: 1,
            sh_entsize: 0,
            data: shstrtab_data,
        });

        // Lay everything out: ELF header, section data, then the section header table.
        let ehdr_size = size_of::<elf::FileHeader>();
        let mut data_offsets = Vec::with_capacity(out_sections.len());
        let mut pos = ehdr_size as u64;
        for section in &out_sections {
            pos = crate::elf::align_to(pos, section.sh_addralign.max(1));
            data_offsets.push(pos);
            pos += section.data.len() as u64;
        }
        let shoff = crate::elf::align_to(pos, 8);

        let mut bytes = vec![0u8; (shoff + (num_sections as u64) * 64) as usize];
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
            e_type: U16::new(LE, object::elf::ET_REL),
            e_machine: U16::new(LE, object::elf::EM_X86_64),
            e_version: U32::new(LE, 1),
            e_entry: U64::new(LE, 0),
            e_phoff: U64::new(LE, 0),
            e_shoff: U64::new(LE, shoff),
            e_flags: U32::new(LE, 0),
            e_ehsize: U16::new(LE, ehdr_size as u16),
            e_phentsize: U16::new(LE, 0),
            e_phnum: U16::new(LE, 0),
            e_shentsize: U16::new(LE, 64),
            e_shnum: U16::new(LE, num_sections as u16),
            e_shstrndx: U16::new(LE, shstrtab_index as u16),
        };
        bytes[..ehdr_size].copy_from_slice(object::bytes_of(&header));

        for (i, section) in out_sections.iter().enumerate() {
            let offset = data_offsets[i] as usize;
            bytes[offset..offset + section.data.len()].copy_from_slice(&section.data);

            let shdr = elf::SectionHeader {
                sh_name: U32::new(LE, section.sh_name),
                sh_type: U32::new(LE, section.sh_type),
                sh_flags: U64::new(LE, section.sh_flags),
                sh_addr: U64::new(LE, 0),
                sh_offset: U64::new(LE, data_offsets[i]),
                sh_size: U64::new(LE, section.data.len() as u64),
                sh_link: U32::new(LE, section.sh_link),
                sh_info: U32::new(LE, section.sh_info),
                sh_addralign: U64::new(LE, section.sh_addralign),
                sh_entsize: U64::new(LE, section.sh_entsize),
            };
            let shdr_offset = (shoff as usize) + (i + 1) * 64;
            bytes[shdr_offset..shdr_offset + 64].copy_from_slice(object::bytes_of(&shdr));
        }

        bytes
    }
}
