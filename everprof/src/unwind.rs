//! The unwind driver: one (registers + raw stack bytes) pair in, an ordered
//! list of frames out.
//!
//! CFI interpretation is delegated to the unwind backend behind the
//! `framehop::Unwinder` trait; this module resolves each program counter to
//! a module, converts to ELF addresses, and applies the stop conditions.

use byteorder::LittleEndian;
use framehop::{FrameAddress, Unwinder};
use linux_perf_data::linux_perf_event_reader::{RawData, RawDataU64};

use crate::dso_registry::DsoRegistry;
use crate::file_info::{FileInfoId, FileInfoTable};
use crate::module::{load_module, ModuleStatus};
use crate::process::Process;
use crate::section_data::SectionData;

/// User frames kept per stack; two extra slots stay reserved for synthetic
/// frames (the truncation marker and the per-process base frame).
pub const MAX_STACK_DEPTH: usize = 254;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Regular,
    /// No mapping contains this address.
    UnknownDso,
    /// The CFI interpreter had no row or a register/memory rule failed.
    UnwindFailure,
    /// A memory read left the captured stack slice.
    IncompleteStack,
    /// The stack hit [`MAX_STACK_DEPTH`].
    TruncatedStack,
    /// Synthetic base frame grouping samples per process (`pid_<N>`).
    ProcessRoot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwoundFrame {
    pub pc: u64,
    pub elf_addr: u64,
    pub file_info_id: FileInfoId,
    pub kind: FrameKind,
}

impl UnwoundFrame {
    fn synthetic(kind: FrameKind, pc: u64) -> Self {
        UnwoundFrame {
            pc,
            elf_addr: 0,
            file_info_id: FileInfoId::UNSET,
            kind,
        }
    }
}

/// Strip the aarch64 top-byte (TBI/MTE) tag and reduce to the canonical
/// 48-bit width. A no-op on x86-64.
pub fn strip_address_tag(addr: u64) -> u64 {
    if cfg!(target_arch = "aarch64") {
        let untagged = addr & ((1 << 56) - 1);
        untagged & ((1 << 48) - 1)
    } else {
        addr
    }
}

/// Unwind one sample into `output` (innermost first), ending with the
/// synthetic `pid_<N>` base frame. Never fails: every abnormal stop leaves
/// a tagged synthetic frame instead.
#[allow(clippy::too_many_arguments)]
pub fn unwind_stack<U>(
    pid: i32,
    pc: u64,
    sp: u64,
    mut regs: U::UnwindRegs,
    user_stack: RawData,
    process: &mut Process<U>,
    registry: &mut DsoRegistry,
    files: &mut FileInfoTable,
    cache: &mut U::Cache,
    output: &mut Vec<UnwoundFrame>,
) where
    U: Unwinder<Module = framehop::Module<SectionData>> + Default,
{
    output.clear();

    let stack_words = RawDataU64::from_raw_data::<LittleEndian>(user_stack);
    let mut read_stack = |addr: u64| {
        // The captured slice starts at the stack pointer at sample time;
        // anything outside it is not part of this snapshot.
        let offset = addr.checked_sub(sp).ok_or(())?;
        let index = usize::try_from(offset / 8).map_err(|_| ())?;
        stack_words.get(index).ok_or(())
    };

    let mut frame_address = FrameAddress::InstructionPointer(strip_address_tag(pc));
    loop {
        if output.len() >= MAX_STACK_DEPTH {
            output.push(UnwoundFrame::synthetic(
                FrameKind::TruncatedStack,
                frame_address.address(),
            ));
            break;
        }

        // A return address points past the call site; resolve and record
        // one byte back so the frame lands in the caller's line and module.
        // The innermost frame is an actual instruction pointer and is not
        // adjusted.
        let lookup_addr = strip_address_tag(frame_address.address_for_lookup());
        match resolve_frame(pid, lookup_addr, process, registry, files) {
            Ok((file_info_id, bias)) => output.push(UnwoundFrame {
                pc: lookup_addr,
                elf_addr: lookup_addr.wrapping_sub(bias),
                file_info_id,
                kind: FrameKind::Regular,
            }),
            Err(kind) => {
                output.push(UnwoundFrame::synthetic(kind, lookup_addr));
                break;
            }
        }

        match process
            .unwinder
            .unwind_frame(frame_address, &mut regs, cache, &mut read_stack)
        {
            Ok(Some(return_address)) => {
                let return_address = strip_address_tag(return_address);
                match FrameAddress::from_return_address(return_address) {
                    Some(next) => frame_address = next,
                    None => break,
                }
            }
            Ok(None) => break,
            Err(framehop::Error::CouldNotReadStack(failed_addr)) => {
                output.push(UnwoundFrame::synthetic(
                    FrameKind::IncompleteStack,
                    failed_addr,
                ));
                break;
            }
            Err(_) => {
                output.push(UnwoundFrame::synthetic(
                    FrameKind::UnwindFailure,
                    lookup_addr,
                ));
                break;
            }
        }
    }

    // Group per process downstream, even for empty or failed stacks.
    let root_file = registry
        .first_executable_standard(pid)
        .map(|dso| dso.file_info_id)
        .unwrap_or(FileInfoId::UNSET);
    output.push(UnwoundFrame {
        pc: 0,
        elf_addr: 0,
        file_info_id: root_file,
        kind: FrameKind::ProcessRoot,
    });
}

/// Resolve the module containing `pc`, loading and registering it with the
/// unwind backend on first sight.
fn resolve_frame<U>(
    pid: i32,
    pc: u64,
    process: &mut Process<U>,
    registry: &mut DsoRegistry,
    files: &mut FileInfoTable,
) -> Result<(FileInfoId, u64), FrameKind>
where
    U: Unwinder<Module = framehop::Module<SectionData>>,
{
    let Some(dso) = registry.find_or_backpopulate(pid, pc) else {
        return Err(FrameKind::UnknownDso);
    };
    if !dso.kind.is_unwindable() {
        return Err(FrameKind::UnknownDso);
    }

    if dso.file_info_id == FileInfoId::UNSET {
        dso.file_info_id = files.resolve(dso);
    }
    let file_info_id = dso.file_info_id;
    // ELF addresses degrade to mapping-relative offsets when the file is
    // unavailable; symbolization falls back to the DSO-level symbol.
    let dso_bias = dso.start.wrapping_sub(dso.page_offset);
    let dso_start = dso.start;

    if !file_info_id.is_valid() {
        return Ok((FileInfoId::ERROR, dso_bias));
    }

    if let Some(module) = process.modules.get_mut(&file_info_id) {
        if module.status == ModuleStatus::Inconsistent {
            return Err(FrameKind::UnwindFailure);
        }
        if module.low_addr != dso_start {
            log::info!(
                "module for file {file_info_id:?} moved from {:#x} to {dso_start:#x}; rejecting",
                module.low_addr
            );
            module.status = ModuleStatus::Inconsistent;
            return Err(FrameKind::UnwindFailure);
        }
        return Ok((file_info_id, module.bias));
    }

    let Some(file_info) = files.get(file_info_id) else {
        return Ok((FileInfoId::ERROR, dso_bias));
    };
    if file_info.errored {
        return Ok((FileInfoId::ERROR, dso_bias));
    }
    let Some(dso) = registry.find(pid, pc) else {
        return Err(FrameKind::UnknownDso);
    };

    match load_module(dso, file_info) {
        Ok((info, backend_module)) => {
            let bias = info.bias;
            process.unwinder.add_module(backend_module);
            process.modules.insert(file_info_id, info);
            Ok((file_info_id, bias))
        }
        Err(err) => {
            err.log();
            files.mark_errored(file_info_id);
            Ok((FileInfoId::ERROR, dso_bias))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dso::{Dso, DsoKind};
    use crate::module::ModuleInfo;
    use crate::process::Processes;
    use std::cell::Cell;

    /// Backend stub that yields a scripted chain of return addresses, the
    /// way a CFI interpreter would walk `main → a → b`.
    #[derive(Default, Clone)]
    struct ScriptedUnwinder {
        return_addresses: Vec<Option<u64>>,
        step: Cell<usize>,
    }

    impl Unwinder for ScriptedUnwinder {
        type UnwindRegs = ();
        type Cache = ();
        type Module = framehop::Module<SectionData>;

        fn add_module(&mut self, _module: Self::Module) {}

        fn remove_module(&mut self, _module_address_range_start: u64) {}

        fn max_known_code_address(&self) -> u64 {
            0
        }

        fn unwind_frame<F>(
            &self,
            _address: FrameAddress,
            _regs: &mut Self::UnwindRegs,
            _cache: &mut Self::Cache,
            _read_stack: &mut F,
        ) -> Result<Option<u64>, framehop::Error>
        where
            F: FnMut(u64) -> Result<u64, ()>,
        {
            let step = self.step.get();
            self.step.set(step + 1);
            match self.return_addresses.get(step) {
                Some(&next) => Ok(next),
                None => Err(framehop::Error::IntegerOverflow),
            }
        }
    }

    fn test_dso(pid: i32, start: u64, end: u64, path: &str, id: FileInfoId) -> Dso {
        Dso {
            pid,
            start,
            end,
            page_offset: 0,
            inode: 9,
            path: path.to_owned(),
            kind: DsoKind::Standard,
            executable: true,
            file_info_id: id,
        }
    }

    fn preloaded_module(id: FileInfoId, start: u64, end: u64, bias: u64) -> ModuleInfo {
        ModuleInfo {
            file_info_id: id,
            low_addr: start,
            high_addr: end,
            bias,
            status: ModuleStatus::Unknown,
            build_id: None,
        }
    }

    fn run_unwind(
        unwinder_script: Vec<Option<u64>>,
        registry: &mut DsoRegistry,
        processes: &mut Processes<ScriptedUnwinder>,
        pid: i32,
        pc: u64,
    ) -> Vec<UnwoundFrame> {
        let mut files = FileInfoTable::new();
        let process = processes.get_by_pid(pid, 0);
        process.unwinder.return_addresses = unwinder_script;
        process.unwinder.step.set(0);
        let stack = [0u8; 64];
        let mut output = Vec::new();
        unwind_stack(
            pid,
            pc,
            0x7fff_0000,
            (),
            RawData::Single(&stack),
            process,
            registry,
            &mut files,
            &mut (),
            &mut output,
        );
        output
    }

    /// A sample inside `b` of `main → a → b` yields the three user frames
    /// innermost first, then the synthetic per-process base frame. The
    /// sampled pc is recorded as-is; the return addresses land one byte
    /// back, on their call sites.
    #[test]
    fn simple_user_stack_unwind() {
        let pid = 321;
        let id = FileInfoId(2);
        let mut registry = DsoRegistry::new();
        registry.insert_evicting(test_dso(pid, 0x1000, 0x9000, "/bin/target", id));

        let mut processes = Processes::new();
        processes
            .get_by_pid(pid, 0)
            .modules
            .insert(id, preloaded_module(id, 0x1000, 0x9000, 0x1000));

        let frames = run_unwind(
            vec![Some(0x2b00), Some(0x3c00), None],
            &mut registry,
            &mut processes,
            pid,
            0x1a00, // inside b
        );

        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0].pc, 0x1a00); // b, not adjusted
        assert_eq!(frames[0].elf_addr, 0xa00);
        assert_eq!(frames[0].kind, FrameKind::Regular);
        assert_eq!(frames[1].pc, 0x2aff); // the call site in a
        assert_eq!(frames[1].elf_addr, 0x1aff);
        assert_eq!(frames[2].pc, 0x3bff); // the call site in main
        assert_eq!(frames[2].kind, FrameKind::Regular);
        assert_eq!(frames[3].kind, FrameKind::ProcessRoot);
        assert_eq!(frames[3].file_info_id, id);
        assert!(frames
            .iter()
            .take(3)
            .all(|f| f.file_info_id == id));
    }

    /// A return address sitting exactly on the end of its mapping (the call
    /// is the function's last instruction) must still resolve inside the
    /// caller's DSO; only the adjusted address makes that work.
    #[test]
    fn return_address_at_mapping_end_resolves_in_the_caller() {
        let pid = 11;
        let id = FileInfoId(2);
        let mut registry = DsoRegistry::new();
        registry.insert_evicting(test_dso(pid, 0x1000, 0x2000, "/bin/edge", id));
        let mut processes = Processes::new();
        processes
            .get_by_pid(pid, 0)
            .modules
            .insert(id, preloaded_module(id, 0x1000, 0x2000, 0x1000));

        let frames = run_unwind(
            vec![Some(0x2000), None],
            &mut registry,
            &mut processes,
            pid,
            0x1500,
        );

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].pc, 0x1500);
        assert_eq!(frames[1].pc, 0x1fff);
        assert_eq!(frames[1].elf_addr, 0xfff);
        assert_eq!(frames[1].kind, FrameKind::Regular);
        assert_eq!(frames[2].kind, FrameKind::ProcessRoot);
    }

    #[test]
    fn pc_outside_any_mapping_emits_unknown_dso() {
        let pid = 7;
        let mut registry = DsoRegistry::new();
        let mut processes = Processes::new();

        let frames = run_unwind(vec![], &mut registry, &mut processes, pid, 0xdead_0000);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].kind, FrameKind::UnknownDso);
        assert_eq!(frames[1].kind, FrameKind::ProcessRoot);
    }

    #[test]
    fn backend_failure_emits_unwind_failure_frame() {
        let pid = 8;
        let id = FileInfoId(3);
        let mut registry = DsoRegistry::new();
        registry.insert_evicting(test_dso(pid, 0x1000, 0x9000, "/bin/x", id));
        let mut processes = Processes::new();
        processes
            .get_by_pid(pid, 0)
            .modules
            .insert(id, preloaded_module(id, 0x1000, 0x9000, 0));

        // Script exhausted on the first step: the backend errors out.
        let frames = run_unwind(vec![], &mut registry, &mut processes, pid, 0x1500);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].kind, FrameKind::Regular);
        assert_eq!(frames[1].kind, FrameKind::UnwindFailure);
        assert_eq!(frames[2].kind, FrameKind::ProcessRoot);
    }

    #[test]
    fn runaway_stack_is_truncated() {
        let pid = 9;
        let id = FileInfoId(2);
        let mut registry = DsoRegistry::new();
        registry.insert_evicting(test_dso(pid, 0x1000, 0x90000, "/bin/deep", id));
        let mut processes = Processes::new();
        processes
            .get_by_pid(pid, 0)
            .modules
            .insert(id, preloaded_module(id, 0x1000, 0x90000, 0));

        let script: Vec<Option<u64>> = (0..400).map(|i| Some(0x2000 + i * 8)).collect();
        let frames = run_unwind(script, &mut registry, &mut processes, pid, 0x1500);

        assert_eq!(frames.len(), MAX_STACK_DEPTH + 2);
        assert_eq!(frames[MAX_STACK_DEPTH].kind, FrameKind::TruncatedStack);
        assert_eq!(frames[MAX_STACK_DEPTH + 1].kind, FrameKind::ProcessRoot);
        assert!(frames[..MAX_STACK_DEPTH]
            .iter()
            .all(|f| f.kind == FrameKind::Regular));
    }

    #[test]
    fn moved_module_is_rejected_as_inconsistent() {
        let pid = 10;
        let id = FileInfoId(2);
        let mut registry = DsoRegistry::new();
        registry.insert_evicting(test_dso(pid, 0x5000, 0x9000, "/bin/moved", id));
        let mut processes = Processes::new();
        // The module was loaded when the file sat at 0x1000.
        processes
            .get_by_pid(pid, 0)
            .modules
            .insert(id, preloaded_module(id, 0x1000, 0x5000, 0));

        let frames = run_unwind(vec![], &mut registry, &mut processes, pid, 0x5500);
        assert_eq!(frames[0].kind, FrameKind::UnwindFailure);

        // And the rejection is sticky.
        let process = processes.get_by_pid(pid, 0);
        assert_eq!(
            process.modules.get(&id).unwrap().status,
            ModuleStatus::Inconsistent
        );
    }

    #[test]
    fn address_tag_stripping() {
        if cfg!(target_arch = "aarch64") {
            assert_eq!(strip_address_tag(0xab00_7fff_1234_5678), 0x7fff_1234_5678);
            assert_eq!(strip_address_tag(0x00ff_7fff_1234_5678), 0x7fff_1234_5678);
        } else {
            assert_eq!(strip_address_tag(0xab00_7fff_1234_5678), 0xab00_7fff_1234_5678);
        }
    }
}
