//! String table builder for `.dynstr`, `.strtab` and `.shstrtab`.

use crate::hash::HashMap;

pub(crate) struct StringTableBuilder {
    contents: Vec<u8>,
    offsets: HashMap<Vec<u8>, u32>,
}

impl StringTableBuilder {
    pub(crate) fn new() -> Self {
        Self {
            // Index 0 is the empty string.
            contents: vec![0],
            offsets: HashMap::default(),
        }
    }

    /// Adds a string, returning its offset. Identical strings share one entry.
    pub(crate) fn add(&mut self, string: &[u8]) -> u32 {
        if string.is_empty() {
            return 0;
        }
        if let Some(&offset) = self.offsets.get(string) {
            return offset;
        }
        let offset = self.contents.len() as u32;
        self.contents.extend_from_slice(string);
        self.contents.push(0);
        self.offsets.insert(string.to_vec(), offset);
        offset
    }

    /// The offset of a previously added string.
    pub(crate) fn get(&self, string: &[u8]) -> u32 {
        if string.is_empty() {
            0
        } else {
            *self.offsets.get(string).expect("string was never added")
        }
    }

    pub(crate) fn len(&self) -> u64 {
        self.contents.len() as u64
    }

    pub(crate) fn contents(&self) -> &[u8] {
        &self.contents
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_and_offsets() {
        let mut builder = StringTableBuilder::new();
        let a = builder.add(b"libc.so.6");
        let b = builder.add(b"puts");
        assert_eq!(a, 1);
        assert_eq!(b, 11);
        assert_eq!(builder.add(b"libc.so.6"), a);
        assert_eq!(builder.get(b"puts"), b);
        assert_eq!(builder.add(b""), 0);
        assert_eq!(&builder.contents()[a as usize..a as usize + 9], b"libc.so.6");
        assert_eq!(builder.contents()[0], 0);
    }
}
