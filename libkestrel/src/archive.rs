//! Reads ar archives. We don't use the ar crate because it only exposes entry contents through
//! the Read trait, whereas we want to borrow the bytes of each member directly out of the mapped
//! archive.

use crate::error::Result;
use anyhow::bail;
use bytemuck::Pod;
use bytemuck::Zeroable;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt as _;
use std::path::Path;

pub(crate) enum ArchiveEntry<'data> {
    /// The archive's own symbol index. We ignore it and use the symbol tables of the individual
    /// members instead.
    Ignored,
    Regular(ArchiveContent<'data>),
    Filenames(ExtendedFilenames<'data>),
    Thin(ThinEntry<'data>),
}

#[derive(Clone, Copy)]
pub(crate) struct ExtendedFilenames<'data> {
    data: &'data [u8],
}

/// The name that identifies an archive member, either stored inline in the entry header or in the
/// extended filenames entry.
#[derive(Clone, Copy)]
pub(crate) struct Identifier<'data> {
    data: &'data [u8],
}

pub(crate) struct ArchiveContent<'data> {
    ident: &'data str,
    pub(crate) entry_data: &'data [u8],
}

pub(crate) struct ThinEntry<'data> {
    ident: &'data str,
}

pub(crate) struct ArchiveIterator<'data> {
    data: &'data [u8],
    is_thin: bool,
}

#[derive(Zeroable, Pod, Clone, Copy)]
#[repr(C)]
struct EntryHeader {
    ident: [u8; 16],
    _timestamp: [u8; 12],
    _owner_id: [u8; 6],
    _group_id: [u8; 6],
    _mode: [u8; 8],
    size: [u8; 10],
    end: [u8; 2],
}

const HEADER_SIZE: usize = size_of::<EntryHeader>();

const _ASSERTS: () = {
    assert!(HEADER_SIZE == 60);
};

impl<'data> ArchiveIterator<'data> {
    /// Creates an iterator from the bytes of the whole archive, including the magic.
    pub(crate) fn from_archive_bytes(data: &'data [u8]) -> Result<Self> {
        if let Some(data) = data.strip_prefix(&object::archive::MAGIC) {
            Ok(Self {
                data,
                is_thin: false,
            })
        } else if let Some(data) = data.strip_prefix(&object::archive::THIN_MAGIC) {
            Ok(Self {
                data,
                is_thin: true,
            })
        } else {
            bail!("Missing archive magic");
        }
    }

    fn next_result(&mut self) -> Result<Option<ArchiveEntry<'data>>> {
        if self.data.is_empty() {
            return Ok(None);
        }
        if self.data.len() < HEADER_SIZE {
            bail!("Short entry header");
        }
        let (header, rest) = self.data.split_at(HEADER_SIZE);
        let header: &EntryHeader = bytemuck::from_bytes(header);
        let size_str = std::str::from_utf8(&header.size)
            .map_err(|_| anyhow::anyhow!("Entry size is invalid UTF-8"))?;
        let size: usize = size_str
            .trim_end()
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid entry size `{size_str}`"))?;
        let ident = std::str::from_utf8(&header.ident)
            .map_err(|_| anyhow::anyhow!("Entry identifier is invalid UTF-8"))?
            .trim_end();
        self.data = rest;

        // In a thin archive, the size field describes the referenced file, so no bytes follow
        // the header.
        let is_file_reference = self.is_thin && ident != "/" && ident != "//";
        let entry_size = if is_file_reference {
            0
        } else {
            if self.data.len() < size {
                bail!("Entry size is {size}, but only {} bytes left", self.data.len());
            }
            size
        };

        let entry = match ident {
            "/" => ArchiveEntry::Ignored,
            "//" => ArchiveEntry::Filenames(ExtendedFilenames {
                data: &self.data[..entry_size],
            }),
            _ if is_file_reference => ArchiveEntry::Thin(ThinEntry { ident }),
            _ => ArchiveEntry::Regular(ArchiveContent {
                ident,
                entry_data: &self.data[..entry_size],
            }),
        };

        // Entries are 2-byte aligned.
        let size_with_padding = entry_size.next_multiple_of(2).min(self.data.len());
        self.data = &self.data[size_with_padding..];
        Ok(Some(entry))
    }
}

impl<'data> Iterator for ArchiveIterator<'data> {
    type Item = Result<ArchiveEntry<'data>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_result().transpose()
    }
}

/// Resolves an entry identifier, consulting the extended filenames table for identifiers of the
/// form `/123`.
fn evaluate_identifier<'data>(
    ident: &'data str,
    extended_filenames: Option<ExtendedFilenames<'data>>,
) -> Identifier<'data> {
    if let Some(filenames) = extended_filenames {
        if let Some(rest) = ident.strip_prefix('/') {
            if let Ok(offset) = rest.trim_end_matches('/').trim().parse::<usize>() {
                if offset <= filenames.data.len() {
                    return Identifier {
                        data: &filenames.data[offset..],
                    };
                }
            }
        }
    }
    Identifier {
        data: ident.trim_end_matches('/').as_bytes(),
    }
}

impl<'data> ArchiveContent<'data> {
    pub(crate) fn identifier(
        &self,
        extended_filenames: Option<ExtendedFilenames<'data>>,
    ) -> Identifier<'data> {
        evaluate_identifier(self.ident, extended_filenames)
    }
}

impl<'data> ThinEntry<'data> {
    pub(crate) fn identifier(
        &self,
        extended_filenames: Option<ExtendedFilenames<'data>>,
    ) -> Identifier<'data> {
        evaluate_identifier(self.ident, extended_filenames)
    }
}

impl<'data> Identifier<'data> {
    pub(crate) fn as_slice(&self) -> &'data [u8] {
        // Each name in the extended filenames table ends with "/\n". We scan for '\n' rather than
        // '/' because paths may contain slashes.
        match memchr::memchr(b'\n', self.data) {
            Some(end) => &self.data[..end.saturating_sub(1)],
            None => self.data,
        }
    }

    pub(crate) fn as_path(&self) -> &'data Path {
        Path::new(OsStr::from_bytes(self.as_slice()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds an archive in memory from (ident, contents) pairs.
    fn build_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&object::archive::MAGIC);
        for (ident, data) in entries {
            out.extend_from_slice(format!("{ident:<16}").as_bytes());
            out.extend_from_slice(b"0           "); // timestamp
            out.extend_from_slice(b"0     0     "); // owner, group
            out.extend_from_slice(b"644     "); // mode
            out.extend_from_slice(format!("{:<10}", data.len()).as_bytes());
            out.extend_from_slice(b"`\n");
            out.extend_from_slice(data);
            if data.len() % 2 == 1 {
                out.push(b'\n');
            }
        }
        out
    }

    #[test]
    fn test_iterate_regular_archive() {
        let bytes = build_archive(&[("/", b"\0\0\0\0"), ("foo.o/", b"hello"), ("bar.o/", b"worlds")]);
        let mut idents = Vec::new();
        let mut contents = Vec::new();
        for entry in ArchiveIterator::from_archive_bytes(&bytes).unwrap() {
            match entry.unwrap() {
                ArchiveEntry::Ignored => {}
                ArchiveEntry::Filenames(_) => {}
                ArchiveEntry::Thin(_) => panic!("unexpected thin entry"),
                ArchiveEntry::Regular(c) => {
                    idents.push(c.identifier(None).as_slice().to_vec());
                    contents.push(c.entry_data.to_vec());
                }
            }
        }
        assert_eq!(idents, vec![b"foo.o".to_vec(), b"bar.o".to_vec()]);
        assert_eq!(contents, vec![b"hello".to_vec(), b"worlds".to_vec()]);
    }

    #[test]
    fn test_extended_filenames() {
        let long_name = b"a_rather_long_object_file_name.o/\n".as_slice();
        let bytes = build_archive(&[("//", long_name), ("/0", b"data")]);
        let mut filenames = None;
        let mut found = false;
        for entry in ArchiveIterator::from_archive_bytes(&bytes).unwrap() {
            match entry.unwrap() {
                ArchiveEntry::Filenames(t) => filenames = Some(t),
                ArchiveEntry::Regular(c) => {
                    assert_eq!(
                        c.identifier(filenames).as_slice(),
                        b"a_rather_long_object_file_name.o"
                    );
                    found = true;
                }
                _ => {}
            }
        }
        assert!(found);
    }

    #[test]
    fn test_thin_archive_entries() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&object::archive::THIN_MAGIC);
        bytes.extend_from_slice(format!("{:<16}", "member.o/").as_bytes());
        bytes.extend_from_slice(b"0           0     0     644     ");
        bytes.extend_from_slice(format!("{:<10}", 12345).as_bytes());
        bytes.extend_from_slice(b"`\n");
        let mut saw_thin = false;
        for entry in ArchiveIterator::from_archive_bytes(&bytes).unwrap() {
            if let ArchiveEntry::Thin(t) = entry.unwrap() {
                assert_eq!(t.identifier(None).as_slice(), b"member.o");
                saw_thin = true;
            }
        }
        assert!(saw_thin);
    }

    #[test]
    fn test_truncated_archive_is_an_error() {
        let bytes = b"!<arch>\nshort".to_vec();
        let mut iter = ArchiveIterator::from_archive_bytes(&bytes).unwrap();
        assert!(iter.next().unwrap().is_err());
    }
}
