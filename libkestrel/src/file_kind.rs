//! Identifies what sort of input we're dealing with based on the leading bytes of the file.

use crate::elf;
use crate::error::Result;
use anyhow::bail;
use object::LittleEndian;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum FileKind {
    ElfObject,
    ElfDynamic,
    Archive,
    ThinArchive,
    Text,
}

impl FileKind {
    pub(crate) fn identify_bytes(bytes: &[u8]) -> Result<FileKind> {
        if bytes.starts_with(&object::archive::MAGIC) {
            Ok(FileKind::Archive)
        } else if bytes.starts_with(&object::archive::THIN_MAGIC) {
            Ok(FileKind::ThinArchive)
        } else if bytes.starts_with(&object::elf::ELFMAG) {
            const HEADER_LEN: usize = size_of::<elf::FileHeader>();
            if bytes.len() < HEADER_LEN {
                bail!("Invalid ELF file");
            }
            let header: &elf::FileHeader = object::from_bytes(&bytes[..HEADER_LEN]).unwrap().0;
            if header.e_ident.class != object::elf::ELFCLASS64 {
                bail!("Only 64 bit ELF is supported");
            }
            if header.e_ident.data != object::elf::ELFDATA2LSB {
                bail!("Only little endian is supported");
            }
            match header.e_type.get(LittleEndian) {
                object::elf::ET_REL => Ok(FileKind::ElfObject),
                object::elf::ET_DYN => Ok(FileKind::ElfDynamic),
                t => bail!("Unsupported ELF kind {t}"),
            }
        } else if bytes.len() >= 4 && bytes[..4].iter().all(|b| b.is_ascii() && !b.is_ascii_control())
        {
            Ok(FileKind::Text)
        } else {
            bail!("Couldn't identify file type");
        }
    }
}

impl std::fmt::Display for FileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FileKind::ElfObject => "ELF object",
            FileKind::ElfDynamic => "ELF dynamic",
            FileKind::Archive => "archive",
            FileKind::ThinArchive => "thin archive",
            FileKind::Text => "linker script",
        };
        std::fmt::Display::fmt(s, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn elf_header(e_type: u16) -> Vec<u8> {
        let mut bytes = vec![0u8; size_of::<elf::FileHeader>()];
        bytes[..4].copy_from_slice(&object::elf::ELFMAG);
        bytes[4] = object::elf::ELFCLASS64;
        bytes[5] = object::elf::ELFDATA2LSB;
        bytes[16..18].copy_from_slice(&e_type.to_le_bytes());
        bytes
    }

    #[test]
    fn test_identify() {
        assert_eq!(
            FileKind::identify_bytes(&elf_header(object::elf::ET_REL)).unwrap(),
            FileKind::ElfObject
        );
        assert_eq!(
            FileKind::identify_bytes(&elf_header(object::elf::ET_DYN)).unwrap(),
            FileKind::ElfDynamic
        );
        assert_eq!(
            FileKind::identify_bytes(b"!<arch>\nrest").unwrap(),
            FileKind::Archive
        );
        assert_eq!(
            FileKind::identify_bytes(b"!<thin>\nrest").unwrap(),
            FileKind::ThinArchive
        );
        assert_eq!(
            FileKind::identify_bytes(b"GROUP ( libc.so.6 )").unwrap(),
            FileKind::Text
        );
        assert!(FileKind::identify_bytes(&[0u8; 16]).is_err());
        assert!(FileKind::identify_bytes(&elf_header(object::elf::ET_EXEC)).is_err());
    }
}
