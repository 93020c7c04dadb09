//! x86-64 relocation handling: the table mapping relocation types to how their values are
//! computed and written, plus the TLS relaxation byte sequences.

use std::borrow::Cow;

macro_rules! const_name_by_value {
    ($needle: expr, $( $const:ident ),*) => {
        match $needle {
            $(object::elf::$const => Some(stringify!($const)),)*
            _ => None
        }
    };
}

pub(crate) fn rel_type_to_string(r_type: u32) -> Cow<'static, str> {
    if let Some(name) = const_name_by_value![
        r_type,
        R_X86_64_NONE,
        R_X86_64_64,
        R_X86_64_PC32,
        R_X86_64_GOT32,
        R_X86_64_PLT32,
        R_X86_64_COPY,
        R_X86_64_GLOB_DAT,
        R_X86_64_JUMP_SLOT,
        R_X86_64_RELATIVE,
        R_X86_64_GOTPCREL,
        R_X86_64_32,
        R_X86_64_32S,
        R_X86_64_16,
        R_X86_64_PC16,
        R_X86_64_8,
        R_X86_64_PC8,
        R_X86_64_DTPMOD64,
        R_X86_64_DTPOFF64,
        R_X86_64_TPOFF64,
        R_X86_64_TLSGD,
        R_X86_64_TLSLD,
        R_X86_64_DTPOFF32,
        R_X86_64_GOTTPOFF,
        R_X86_64_TPOFF32,
        R_X86_64_PC64,
        R_X86_64_GOTPC32,
        R_X86_64_GOTPCRELX,
        R_X86_64_REX_GOTPCRELX,
        R_X86_64_IRELATIVE
    ] {
        Cow::Borrowed(name)
    } else {
        Cow::Owned(format!("Unknown relocation type 0x{r_type:x}"))
    }
}

/// How the patched value is computed, in the usual psABI notation: S = symbol address, A =
/// addend, P = place, L = PLT entry, G = GOT entry address, GOT = GOT base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RelValue {
    None,
    /// S + A
    Abs,
    /// S + A - P
    Rel,
    /// L + A - P, falling back to S + A - P when no PLT entry exists
    PltRel,
    /// G + A - P (address of the symbol's GOT slot)
    GotRel,
    /// GOT + A - P
    GotBaseRel,
    /// G + A, relative to the GOT base
    GotOff,
    /// S + A - tls_end (static TLS offset)
    TpOff,
    /// Address of the symbol's TLSGD slot pair, PC-relative; relaxed to local-exec when no
    /// slot was allocated
    TlsGd,
    /// Address of the shared TLSLD slot pair, PC-relative; relaxed when no slot exists
    TlsLd,
    /// Address of the symbol's GOTTPOFF slot, PC-relative
    GotTpOff,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct RelInfo {
    pub(crate) value: RelValue,
    /// Bytes written at the relocated location.
    pub(crate) size: u8,
}

const fn info(value: RelValue, size: u8) -> RelInfo {
    RelInfo { value, size }
}

/// The single dispatch table for everything the applier understands. Returns `None` for
/// relocation types we don't support, which the caller reports as an unknown relocation.
pub(crate) fn relocation_info(r_type: u32) -> Option<RelInfo> {
    Some(match r_type {
        object::elf::R_X86_64_NONE => info(RelValue::None, 0),
        object::elf::R_X86_64_64 => info(RelValue::Abs, 8),
        object::elf::R_X86_64_32 | object::elf::R_X86_64_32S => info(RelValue::Abs, 4),
        object::elf::R_X86_64_16 => info(RelValue::Abs, 2),
        object::elf::R_X86_64_8 => info(RelValue::Abs, 1),
        object::elf::R_X86_64_PC64 => info(RelValue::Rel, 8),
        object::elf::R_X86_64_PC32 => info(RelValue::Rel, 4),
        object::elf::R_X86_64_PC16 => info(RelValue::Rel, 2),
        object::elf::R_X86_64_PC8 => info(RelValue::Rel, 1),
        object::elf::R_X86_64_PLT32 => info(RelValue::PltRel, 4),
        object::elf::R_X86_64_GOT32 => info(RelValue::GotOff, 4),
        object::elf::R_X86_64_GOTPC32 => info(RelValue::GotBaseRel, 4),
        object::elf::R_X86_64_GOTPCREL
        | object::elf::R_X86_64_GOTPCRELX
        | object::elf::R_X86_64_REX_GOTPCRELX => info(RelValue::GotRel, 4),
        object::elf::R_X86_64_TLSGD => info(RelValue::TlsGd, 4),
        object::elf::R_X86_64_TLSLD => info(RelValue::TlsLd, 4),
        object::elf::R_X86_64_TPOFF32 | object::elf::R_X86_64_DTPOFF32 => {
            info(RelValue::TpOff, 4)
        }
        object::elf::R_X86_64_TPOFF64 | object::elf::R_X86_64_DTPOFF64 => {
            info(RelValue::TpOff, 8)
        }
        object::elf::R_X86_64_GOTTPOFF => info(RelValue::GotTpOff, 4),
        _ => return None,
    })
}

/// Writes `value` at `loc` with the width the relocation prescribes.
pub(crate) fn write_value(loc: &mut [u8], size: u8, value: u64) {
    match size {
        1 => loc[0] = value as u8,
        2 => loc[..2].copy_from_slice(&(value as u16).to_le_bytes()),
        4 => loc[..4].copy_from_slice(&(value as u32).to_le_bytes()),
        8 => loc[..8].copy_from_slice(&value.to_le_bytes()),
        _ => {}
    }
}

/// The canonical general-dynamic sequence:
/// ```text
/// 66 48 8d 3d 00 00 00 00    data16 lea x@tlsgd(%rip),%rdi
/// 66 66 48 e8 00 00 00 00    data16 data16 rex.W call __tls_get_addr
/// ```
/// The relocation points at the lea's immediate (offset 4 into the sequence).
pub(crate) fn is_canonical_tlsgd(section: &[u8], offset: usize) -> bool {
    offset >= 4
        && section.get(offset - 4..offset) == Some(&[0x66, 0x48, 0x8d, 0x3d])
        && matches!(
            section.get(offset + 4..offset + 8),
            Some([0x66, 0x66, 0x48, 0xe8]) | Some([0x66, 0x66, 0x66, 0xe8])
        )
}

/// Rewrites the general-dynamic sequence to local-exec:
/// ```text
/// 64 48 8b 04 25 00 00 00 00    mov %fs:0,%rax
/// 48 8d 80 xx xx xx xx          lea x@tpoff(%rax),%rax
/// ```
/// `loc` is the position of the TLSGD relocation. The caller fills in the tpoff immediate at
/// `loc + 8` and skips the paired call relocation.
pub(crate) fn relax_tlsgd_to_le(section: &mut [u8], loc: usize) {
    const INSN: [u8; 16] = [
        0x64, 0x48, 0x8b, 0x04, 0x25, 0, 0, 0, 0, // mov %fs:0,%rax
        0x48, 0x8d, 0x80, 0, 0, 0, 0, // lea x@tpoff(%rax),%rax
    ];
    section[loc - 4..loc + 12].copy_from_slice(&INSN);
}

/// The canonical local-dynamic sequence starts `48 8d 3d` (lea x@tlsld(%rip),%rdi) with the
/// relocation at the immediate.
pub(crate) fn is_canonical_tlsld(section: &[u8], offset: usize) -> bool {
    offset >= 3 && section.get(offset - 3..offset) == Some(&[0x48, 0x8d, 0x3d])
}

/// Rewrites the local-dynamic sequence to local-exec: `mov %fs:0,%rax` with three leading
/// prefix bytes to cover the original lea + call pair.
pub(crate) fn relax_tlsld_to_le(section: &mut [u8], loc: usize) {
    const INSN: [u8; 12] = [
        0x66, 0x66, 0x66, 0x64, 0x48, 0x8b, 0x04, 0x25, 0, 0, 0, 0, // mov %fs:0,%rax
    ];
    section[loc - 3..loc + 9].copy_from_slice(&INSN);
}

/// The PLT entry template: an endbr64 marker then an indirect jump through the symbol's
/// `.got.plt` slot. The 32-bit slot displacement lands at offset 7.
pub(crate) const PLT_ENTRY_TEMPLATE: [u8; 16] = [
    0xf3, 0x0f, 0x1e, 0xfa, // endbr64
    0xf2, 0xff, 0x25, 0, 0, 0, 0, // bnd jmp *{got.plt slot}(%rip)
    0x0f, 0x1f, 0x44, 0, 0, // nopl 0x0(%rax,%rax,1)
];

/// Offset within a PLT entry where the jmp's displacement is patched; the displacement is
/// relative to the end of the jmp instruction, 11 bytes in.
pub(crate) const PLT_JMP_DISP_OFFSET: usize = 7;
pub(crate) const PLT_JMP_END: u64 = 11;

/// A `.plt.got` entry: an indirect jump through the symbol's regular GOT slot, padded to eight
/// bytes.
pub(crate) const PLTGOT_ENTRY_TEMPLATE: [u8; 8] = [
    0xff, 0x25, 0, 0, 0, 0, // jmp *{got slot}(%rip)
    0x66, 0x90, // xchg %ax,%ax
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rel_type_to_string() {
        assert_eq!(
            &rel_type_to_string(object::elf::R_X86_64_32),
            stringify!(R_X86_64_32)
        );
        assert_eq!(&rel_type_to_string(0x1234), "Unknown relocation type 0x1234");
    }

    #[test]
    fn test_relocation_table_widths() {
        assert_eq!(
            relocation_info(object::elf::R_X86_64_64).unwrap().size,
            8
        );
        assert_eq!(
            relocation_info(object::elf::R_X86_64_PC32).unwrap().size,
            4
        );
        assert_eq!(
            relocation_info(object::elf::R_X86_64_PC8).unwrap().size,
            1
        );
        assert!(relocation_info(object::elf::R_X86_64_COPY).is_none());
    }

    #[test]
    fn test_write_value_widths() {
        let mut buf = [0xffu8; 8];
        write_value(&mut buf, 4, 0x11223344);
        assert_eq!(&buf[..4], &[0x44, 0x33, 0x22, 0x11]);
        assert_eq!(&buf[4..], &[0xff; 4]);
        write_value(&mut buf, 8, 0x0102030405060708);
        assert_eq!(buf, [8, 7, 6, 5, 4, 3, 2, 1]);
    }

    #[test]
    fn test_tlsgd_relaxation_writes_canonical_le() {
        // data16 lea; imm; data16 data16 rex.W call; imm
        let mut section = vec![
            0x90, 0x90, // padding
            0x66, 0x48, 0x8d, 0x3d, 0, 0, 0, 0, // lea
            0x66, 0x66, 0x48, 0xe8, 0, 0, 0, 0, // call
            0x90,
        ];
        let loc = 6; // the lea immediate
        assert!(is_canonical_tlsgd(&section, loc));
        relax_tlsgd_to_le(&mut section, loc);
        assert_eq!(
            &section[2..18],
            &[0x64, 0x48, 0x8b, 0x04, 0x25, 0, 0, 0, 0, 0x48, 0x8d, 0x80, 0, 0, 0, 0]
        );
        // Trailing byte untouched.
        assert_eq!(section[18], 0x90);
    }

    #[test]
    fn test_tlsld_relaxation() {
        let mut section = vec![
            0x90, // padding
            0x48, 0x8d, 0x3d, 0, 0, 0, 0, // lea x@tlsld(%rip),%rdi
            0xe8, 0, 0, 0, 0, // call
            0x90,
        ];
        let loc = 4;
        assert!(is_canonical_tlsld(&section, loc));
        assert!(!is_canonical_tlsgd(&section, loc));
        relax_tlsld_to_le(&mut section, loc);
        assert_eq!(
            &section[1..13],
            &[0x66, 0x66, 0x66, 0x64, 0x48, 0x8b, 0x04, 0x25, 0, 0, 0, 0]
        );
        assert_eq!(section[13], 0x90);
    }
}
