use std::ops::Deref;
use std::sync::Arc;

use memmap2::Mmap;

/// Bytes of one ELF section, either a range of the mapped file or an owned
/// copy (when the section was compressed). Cheap to clone; the unwinder
/// keeps one per section per module.
#[derive(Clone)]
pub enum SectionData {
    Mapped(Arc<Mmap>, (usize, usize)),
    Owned(Arc<Vec<u8>>),
}

impl SectionData {
    pub fn from_mmap_range(mmap: Arc<Mmap>, offset: u64, size: u64) -> Option<SectionData> {
        let offset = usize::try_from(offset).ok()?;
        let size = usize::try_from(size).ok()?;
        let end = offset.checked_add(size)?;
        if end <= mmap.len() {
            Some(SectionData::Mapped(mmap, (offset, size)))
        } else {
            None
        }
    }
}

impl Deref for SectionData {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        match self {
            SectionData::Mapped(mmap, (offset, size)) => &mmap[*offset..][..*size],
            SectionData::Owned(bytes) => &bytes[..],
        }
    }
}
