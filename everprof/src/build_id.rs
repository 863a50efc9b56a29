//! GNU build-id extraction.

use std::fmt::Write;

use byteorder::{ByteOrder, NativeEndian};
use object::{Object, ObjectSection};

const NT_GNU_BUILD_ID: u32 = 3;

pub fn format_build_id(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Walk the notes in a `.note.gnu.build-id` section: 4-byte name size,
/// 4-byte desc size, 4-byte type (3 for a build id), the name `GNU\0`
/// padded to 4 bytes, then the binary id.
pub fn parse_build_id_note(mut data: &[u8]) -> Option<&[u8]> {
    while data.len() >= 12 {
        let name_size = NativeEndian::read_u32(&data[0..4]) as usize;
        let desc_size = NativeEndian::read_u32(&data[4..8]) as usize;
        let note_type = NativeEndian::read_u32(&data[8..12]);

        let name_padded = name_size.div_ceil(4) * 4;
        let desc_padded = desc_size.div_ceil(4) * 4;
        let total = 12usize
            .checked_add(name_padded)?
            .checked_add(desc_padded)?;
        if data.len() < 12 + name_padded + desc_size {
            return None;
        }

        let name = &data[12..12 + name_size];
        if note_type == NT_GNU_BUILD_ID && name == b"GNU\0" {
            return Some(&data[12 + name_padded..12 + name_padded + desc_size]);
        }
        data = data.get(total..)?;
    }
    None
}

/// Build id of an ELF object as lowercase hex, from the program-header
/// notes or the `.note.gnu.build-id` section.
pub fn build_id_of<'data, R: object::ReadRef<'data>>(
    file: &object::File<'data, R>,
) -> Option<String> {
    if let Ok(Some(bytes)) = file.build_id() {
        return Some(format_build_id(bytes));
    }
    let section = file.section_by_name(".note.gnu.build-id")?;
    let data = section.data().ok()?;
    parse_build_id_note(data).map(format_build_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_ID: [u8; 20] = [
        0x94, 0x32, 0xac, 0x93, 0x9c, 0x01, 0x51, 0x59, 0xea, 0x37, 0x5e, 0xc0, 0xa8, 0x75, 0x0d,
        0xf9, 0x08, 0x05, 0x8a, 0x5a,
    ];

    fn note_with(name: &[u8], desc: &[u8], note_type: u32) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(name.len() as u32).to_ne_bytes());
        out.extend_from_slice(&(desc.len() as u32).to_ne_bytes());
        out.extend_from_slice(&note_type.to_ne_bytes());
        out.extend_from_slice(name);
        out.resize(out.len().div_ceil(4) * 4, 0);
        out.extend_from_slice(desc);
        out.resize(out.len().div_ceil(4) * 4, 0);
        out
    }

    #[test]
    fn build_id_note_round_trip() {
        let note = note_with(b"GNU\0", &SAMPLE_ID, NT_GNU_BUILD_ID);
        let id = parse_build_id_note(&note).unwrap();
        assert_eq!(id, SAMPLE_ID);
        assert_eq!(
            format_build_id(id),
            "9432ac939c015159ea375ec0a8750df908058a5a"
        );
    }

    #[test]
    fn non_build_id_notes_are_skipped() {
        let mut data = note_with(b"GNU\0", &[1, 2, 3, 4], 1); // NT_GNU_ABI_TAG
        data.extend_from_slice(&note_with(b"GNU\0", &SAMPLE_ID, NT_GNU_BUILD_ID));
        assert_eq!(parse_build_id_note(&data).unwrap(), SAMPLE_ID);
    }

    #[test]
    fn wrong_name_is_rejected() {
        let data = note_with(b"XNU\0", &SAMPLE_ID, NT_GNU_BUILD_ID);
        assert!(parse_build_id_note(&data).is_none());
    }

    #[test]
    fn truncated_note_is_rejected() {
        let note = note_with(b"GNU\0", &SAMPLE_ID, NT_GNU_BUILD_ID);
        assert!(parse_build_id_note(&note[..note.len() - 8]).is_none());
    }
}
