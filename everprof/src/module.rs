//! Turning a (DSO, file) pair into an unwindable module.

use std::ops::Range;
use std::sync::Arc;

use framehop::ExplicitModuleSectionInfo;
use memmap2::Mmap;
use object::{Object, ObjectSection, ObjectSegment};
use object::{CompressedFileRange, CompressionFormat, SegmentFlags};

use crate::build_id::build_id_of;
use crate::dso::Dso;
use crate::error::{ErrorKind, ProfilerError, Result};
use crate::file_info::{FileInfo, FileInfoId};
use crate::section_data::SectionData;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleStatus {
    Unknown,
    /// A later mmap showed the same file at a different low address;
    /// lookups against this module are rejected from then on.
    Inconsistent,
}

/// Per-(PID, file) record of where a file is mapped and how to convert its
/// process addresses to ELF addresses.
#[derive(Debug, Clone)]
pub struct ModuleInfo {
    pub file_info_id: FileInfoId,
    pub low_addr: u64,
    pub high_addr: u64,
    pub bias: u64,
    pub status: ModuleStatus,
    pub build_id: Option<String>,
}

impl ModuleInfo {
    /// `pc − bias` is the ELF address for any pc inside `[low, high)`.
    pub fn elf_addr(&self, pc: u64) -> u64 {
        pc.wrapping_sub(self.bias)
    }
}

/// Parse the DSO's backing ELF, pick the executable LOAD segment covering
/// the mapping's page offset, and produce both our bias record and the
/// unwinder's module handle.
pub fn load_module(
    dso: &Dso,
    file_info: &FileInfo,
) -> Result<(ModuleInfo, framehop::Module<SectionData>)> {
    let mmap = Arc::new(
        unsafe { memmap2::MmapOptions::new().map(&file_info.file) }
            .map_err(|e| ProfilerError::warn(ErrorKind::Io(e)))?,
    );
    let data: &[u8] = &mmap;
    let file =
        object::File::parse(data).map_err(|e| ProfilerError::warn(ErrorKind::Elf(e)))?;

    let bias = compute_bias(dso, &file)?;
    let build_id = build_id_of(&file);

    let info = ModuleInfo {
        file_info_id: file_info.id,
        low_addr: dso.start,
        high_addr: dso.end,
        bias,
        status: ModuleStatus::Unknown,
        build_id,
    };

    let section_info = module_section_info(&mmap, &file);
    let base_svma = section_info.base_svma;
    let module = framehop::Module::new(
        file_info.path.to_string_lossy().into_owned(),
        dso.start..dso.end,
        base_svma.wrapping_add(bias),
        section_info,
    );

    Ok((info, module))
}

/// The executable `PF_X|PF_R` LOAD segment whose file range covers the
/// mapping's page offset decides the bias:
/// `bias = start − page_offset + segment.offset − segment.vaddr`.
fn compute_bias<'data, R: object::ReadRef<'data>>(
    dso: &Dso,
    file: &object::File<'data, R>,
) -> Result<u64> {
    let mut chosen: Option<(u64, u64)> = None;
    let mut matches = 0usize;
    for segment in file.segments() {
        let SegmentFlags::Elf { p_flags } = segment.flags() else {
            continue;
        };
        if p_flags & object::elf::PF_X == 0 || p_flags & object::elf::PF_R == 0 {
            continue;
        }
        let (file_offset, file_size) = segment.file_range();
        if dso.page_offset < file_offset || dso.page_offset >= file_offset + file_size {
            continue;
        }
        matches += 1;
        if chosen.is_none() {
            chosen = Some((segment.address(), file_offset));
        }
    }
    if matches > 1 {
        log::warn!(
            "{}: {} executable LOAD segments cover page offset {:#x}; using the first",
            dso.path,
            matches,
            dso.page_offset
        );
    }

    let (vaddr, offset) = chosen.ok_or_else(|| {
        ProfilerError::warn(ErrorKind::NoLoadSegment(dso.page_offset))
    })?;
    Ok(dso
        .start
        .wrapping_sub(dso.page_offset)
        .wrapping_add(offset)
        .wrapping_sub(vaddr))
}

/// Lowest LOAD segment address; the reference point for svma→avma
/// translation inside the unwind backend.
fn relative_address_base<'data, R: object::ReadRef<'data>>(
    file: &object::File<'data, R>,
) -> u64 {
    file.segments()
        .map(|segment| segment.address())
        .min()
        .unwrap_or(0)
}

fn module_section_info<'data>(
    mmap: &Arc<Mmap>,
    file: &object::File<'data, &'data [u8]>,
) -> ExplicitModuleSectionInfo<SectionData> {
    fn section_data<'a>(
        section: &impl ObjectSection<'a>,
        mmap: &Arc<Mmap>,
    ) -> Option<SectionData> {
        let CompressedFileRange {
            format,
            offset,
            compressed_size: _,
            uncompressed_size,
        } = section.compressed_file_range().ok()?;
        match format {
            CompressionFormat::None => {
                SectionData::from_mmap_range(mmap.clone(), offset, uncompressed_size)
            }
            _ => Some(SectionData::Owned(Arc::new(
                section.uncompressed_data().ok()?.to_vec(),
            ))),
        }
    }

    fn svma_range<'a>(section: &impl ObjectSection<'a>) -> Range<u64> {
        section.address()..section.address() + section.size()
    }

    let text = file.section_by_name(".text");
    let got = file.section_by_name(".got");
    let eh_frame = file.section_by_name(".eh_frame");
    let eh_frame_hdr = file.section_by_name(".eh_frame_hdr");
    let debug_frame = file.section_by_name(".debug_frame");

    ExplicitModuleSectionInfo {
        base_svma: relative_address_base(file),
        text_svma: text.as_ref().map(svma_range),
        text: text.as_ref().and_then(|s| section_data(s, mmap)),
        stubs_svma: None,
        stub_helper_svma: None,
        got_svma: got.as_ref().map(svma_range),
        unwind_info: None,
        eh_frame_svma: eh_frame.as_ref().map(svma_range),
        eh_frame: eh_frame.as_ref().and_then(|s| section_data(s, mmap)),
        eh_frame_hdr_svma: eh_frame_hdr.as_ref().map(svma_range),
        eh_frame_hdr: eh_frame_hdr.as_ref().and_then(|s| section_data(s, mmap)),
        debug_frame: debug_frame.as_ref().and_then(|s| section_data(s, mmap)),
        text_segment_svma: None,
        text_segment: None,
    }
}
