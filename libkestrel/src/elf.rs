//! Type aliases for the object crate's ELF records plus a thin wrapper over a parsed input image.
//! Everything we link is little-endian 64 bit, so the aliases bake that in.

use crate::error::Context as _;
use crate::error::Result;
use anyhow::bail;
use object::LittleEndian;
use object::read::elf::FileHeader as _;
use object::read::elf::SectionHeader as _;

pub(crate) const LE: LittleEndian = LittleEndian;

pub(crate) type FileHeader = object::elf::FileHeader64<LittleEndian>;
pub(crate) type ProgramHeader = object::elf::ProgramHeader64<LittleEndian>;
pub(crate) type SectionHeader = object::elf::SectionHeader64<LittleEndian>;
pub(crate) type Sym = object::elf::Sym64<LittleEndian>;
pub(crate) type Rela = object::elf::Rela64<LittleEndian>;
pub(crate) type DynamicEntry = object::elf::Dyn64<LittleEndian>;
pub(crate) type Verneed = object::elf::Verneed<LittleEndian>;
pub(crate) type Vernaux = object::elf::Vernaux<LittleEndian>;
pub(crate) type Versym = object::elf::Versym<LittleEndian>;
pub(crate) type GnuHashHeader = object::elf::GnuHashHeader<LittleEndian>;
pub(crate) type NoteHeader = object::elf::NoteHeader64<LittleEndian>;

pub(crate) type SectionTable<'data> = object::read::elf::SectionTable<'data, FileHeader>;
pub(crate) type SymbolTable<'data> = object::read::elf::SymbolTable<'data, FileHeader>;

pub(crate) const PAGE_SIZE: u64 = 0x1000;
pub(crate) const GOT_ENTRY_SIZE: u64 = 8;
pub(crate) const PLT_ENTRY_SIZE: u64 = 16;

/// Version indices 0 (local) and 1 (global) are reserved; `.gnu.version_r` allocation starts
/// just past them.
pub(crate) const VER_NDX_LAST_RESERVED: u16 = object::elf::VER_NDX_GLOBAL;

/// Aligns `value` up to `alignment`, which must be a power of two. An alignment of zero is
/// treated as one, since that's what section headers use to mean "no constraint".
pub(crate) fn align_to(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// The hash function used by `.hash` and for `vna_hash` in `.gnu.version_r`.
pub(crate) fn elf_hash(name: &[u8]) -> u32 {
    let mut h: u32 = 0;
    for &b in name {
        h = (h << 4).wrapping_add(u32::from(b));
        let g = h & 0xf000_0000;
        if g != 0 {
            h ^= g >> 24;
        }
        h &= !g;
    }
    h
}

/// The hash function used by `.gnu.hash`.
pub(crate) fn gnu_hash(name: &[u8]) -> u32 {
    let mut h: u32 = 5381;
    for &b in name {
        h = h.wrapping_mul(33).wrapping_add(u32::from(b));
    }
    h
}

/// Section names that are valid C identifiers get `__start_` / `__stop_` symbols synthesised for
/// them.
pub(crate) fn is_c_identifier(name: &[u8]) -> bool {
    let Some((first, rest)) = name.split_first() else {
        return false;
    };
    (first.is_ascii_alphabetic() || *first == b'_')
        && rest.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'_')
}

/// A parsed ELF image. Holds the section and symbol tables; everything else is read on demand.
pub(crate) struct File<'data> {
    pub(crate) data: &'data [u8],
    pub(crate) sections: SectionTable<'data>,
    pub(crate) symbols: SymbolTable<'data>,

    /// Index of the first global in the symbol table (`sh_info` of the symtab section). Symbols
    /// below this index are locals.
    pub(crate) first_global: usize,

    /// `.gnu.version` entries, parallel to `symbols`. Only present in shared objects.
    pub(crate) versym: &'data [Versym],
}

impl<'data> File<'data> {
    pub(crate) fn parse(data: &'data [u8], is_dynamic: bool) -> Result<Self> {
        let header = FileHeader::parse(data).context("Failed to parse ELF header")?;
        let e = LE;
        if header.e_machine.get(e) != object::elf::EM_X86_64 {
            bail!("Unsupported machine type {}", header.e_machine.get(e));
        }
        let sections = header
            .sections(e, data)
            .context("Failed to parse section table")?;

        let mut symbols = SymbolTable::default();
        let mut versym: &[Versym] = &[];
        let mut first_global = 0;

        let wanted = if is_dynamic {
            object::elf::SHT_DYNSYM
        } else {
            object::elf::SHT_SYMTAB
        };
        for (section_index, section) in sections.enumerate() {
            match section.sh_type.get(e) {
                t if t == wanted => {
                    symbols = SymbolTable::parse(e, data, &sections, section_index, section)
                        .context("Failed to parse symbol table")?;
                    first_global = section.sh_info.get(e) as usize;
                }
                object::elf::SHT_GNU_VERSYM if is_dynamic => {
                    versym = section
                        .data_as_array(e, data)
                        .map_err(|_| anyhow::anyhow!("Invalid .gnu.version section"))?;
                }
                _ => {}
            }
        }

        Ok(Self {
            data,
            sections,
            symbols,
            first_global,
            versym,
        })
    }

    pub(crate) fn section_name(&self, section: &SectionHeader) -> Result<&'data [u8]> {
        Ok(self.sections.section_name(LE, section)?)
    }

    pub(crate) fn section_data(&self, section: &SectionHeader) -> Result<&'data [u8]> {
        Ok(section.data(LE, self.data)?)
    }

    pub(crate) fn symbol_name(&self, sym: &Sym) -> Result<&'data [u8]> {
        Ok(self.symbols.symbol_name(LE, sym)?)
    }

    /// Returns the relocations of the `SHT_RELA` section that targets `target_index`, if any.
    pub(crate) fn relocations_for(&self, target_index: usize) -> Result<&'data [Rela]> {
        for section in self.sections.iter() {
            if section.sh_type.get(LE) == object::elf::SHT_RELA
                && section.sh_info.get(LE) as usize == target_index
            {
                return Ok(section
                    .data_as_array(LE, self.data)
                    .map_err(|_| anyhow::anyhow!("Invalid relocation section"))?);
            }
        }
        Ok(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_to() {
        assert_eq!(align_to(0, 8), 0);
        assert_eq!(align_to(1, 8), 8);
        assert_eq!(align_to(8, 8), 8);
        assert_eq!(align_to(9, 1), 9);
        assert_eq!(align_to(9, 0), 9);
        assert_eq!(align_to(0x1001, PAGE_SIZE), 0x2000);
    }

    #[test]
    fn test_hashes() {
        assert_eq!(elf_hash(b""), 0);
        assert_eq!(elf_hash(b"a"), 0x61);
        assert_eq!(gnu_hash(b""), 5381);
        assert_eq!(gnu_hash(b"a"), 5381 * 33 + 97);
    }

    #[test]
    fn test_is_c_identifier() {
        assert!(is_c_identifier(b"my_section"));
        assert!(is_c_identifier(b"_start9"));
        assert!(!is_c_identifier(b".text"));
        assert!(!is_c_identifier(b"9lives"));
        assert!(!is_c_identifier(b""));
        assert!(!is_c_identifier(b"with-dash"));
    }
}
