use framehop::aarch64::UnwindRegsAarch64;
use framehop::x86_64::UnwindRegsX86_64;
use linux_perf_data::linux_perf_event_reader;
use linux_perf_event_reader::constants::{
    PERF_REG_ARM64_LR, PERF_REG_ARM64_PC, PERF_REG_ARM64_SP, PERF_REG_ARM64_X29, PERF_REG_X86_BP,
    PERF_REG_X86_IP, PERF_REG_X86_SP,
};
use linux_perf_event_reader::Regs;

/// Pulls the unwind-relevant registers out of a sampled register file.
pub trait ConvertRegs {
    type UnwindRegs;
    fn convert_regs(regs: &Regs) -> (u64, u64, Self::UnwindRegs);
}

pub struct ConvertRegsX86_64;
impl ConvertRegs for ConvertRegsX86_64 {
    type UnwindRegs = UnwindRegsX86_64;
    fn convert_regs(regs: &Regs) -> (u64, u64, UnwindRegsX86_64) {
        let ip = regs.get(PERF_REG_X86_IP).unwrap_or_default();
        let sp = regs.get(PERF_REG_X86_SP).unwrap_or_default();
        let bp = regs.get(PERF_REG_X86_BP).unwrap_or_default();
        (ip, sp, UnwindRegsX86_64::new(ip, sp, bp))
    }
}

pub struct ConvertRegsAarch64;
impl ConvertRegs for ConvertRegsAarch64 {
    type UnwindRegs = UnwindRegsAarch64;
    fn convert_regs(regs: &Regs) -> (u64, u64, UnwindRegsAarch64) {
        let ip = regs.get(PERF_REG_ARM64_PC).unwrap_or_default();
        let lr = regs.get(PERF_REG_ARM64_LR).unwrap_or_default();
        let sp = regs.get(PERF_REG_ARM64_SP).unwrap_or_default();
        let fp = regs.get(PERF_REG_ARM64_X29).unwrap_or_default();
        (ip, sp, UnwindRegsAarch64::new(lr, sp, fp))
    }
}

#[cfg(target_arch = "x86_64")]
pub type ConvertRegsNative = ConvertRegsX86_64;

#[cfg(target_arch = "aarch64")]
pub type ConvertRegsNative = ConvertRegsAarch64;
