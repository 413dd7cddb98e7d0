//! CPU state exposed to hook callbacks.
//!
//! The generated stub builds a [`HookFrame`] on an aligned stack: an `fxsave`
//! image (x87 stack, MXCSR, XMM registers), a pointer to the general-purpose
//! registers it pushed, and a slot for one pending x87 operation that the stub
//! performs after `fxrstor`.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Size of [`HookFrame`]; the stub reserves exactly this much stack.
pub const FRAME_SIZE: i32 = 544;
pub const FRAME_REGS_OFFSET: i32 = 512;
pub const FRAME_FPU_VALUE_OFFSET: i32 = 520;
pub const FRAME_FPU_OP_OFFSET: i32 = 528;

const FX_FSW: usize = 2;
const FX_FTW: usize = 4;
const FX_ST0: usize = 32;
const FX_XMM0: usize = 160;

/// Register block as laid out by the stub on entry.
#[repr(C, align(16))]
pub struct HookFrame {
    pub fx: [u8; 512],
    pub regs: u64,
    pub fpu_value: f64,
    pub fpu_op: u32,
    _reserved: [u32; 3],
}

const _: () = assert!(std::mem::size_of::<HookFrame>() == FRAME_SIZE as usize);
const _: () = assert!(std::mem::offset_of!(HookFrame, regs) == FRAME_REGS_OFFSET as usize);
const _: () =
    assert!(std::mem::offset_of!(HookFrame, fpu_value) == FRAME_FPU_VALUE_OFFSET as usize);
const _: () = assert!(std::mem::offset_of!(HookFrame, fpu_op) == FRAME_FPU_OP_OFFSET as usize);

impl HookFrame {
    pub fn new(regs: u64) -> Self {
        Self {
            fx: [0; 512],
            regs,
            fpu_value: 0.0,
            fpu_op: FpuOp::None as u32,
            _reserved: [0; 3],
        }
    }
}

/// x87 operation the stub applies after restoring FPU state.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpuOp {
    None = 0,
    /// `fstp st(0)` then `fld qword [fpu_value]`.
    ReplaceTop = 1,
    /// `fld qword [fpu_value]`.
    Push = 2,
}

/// `pushad` + `pushfd` layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registers32 {
    pub eflags: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
}

/// Pushes of `rax..r15` followed by `pushfq`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registers64 {
    pub rflags: u64,
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
}

/// Width-independent register names (`Ax` is `eax` or `rax`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Register {
    Ax,
    Cx,
    Dx,
    Bx,
    Sp,
    Bp,
    Si,
    Di,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Flags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Arch {
    X86,
    X64,
}

impl Arch {
    pub fn bitness(self) -> u32 {
        match self {
            Arch::X86 => 32,
            Arch::X64 => 64,
        }
    }

    pub fn xmm_count(self) -> usize {
        match self {
            Arch::X86 => 8,
            Arch::X64 => 16,
        }
    }
}

/// Named access to the interrupted thread's state.
///
/// Hook logic is written against this trait only, never raw frame offsets.
pub trait CpuContext {
    /// `None` for registers the architecture doesn't have.
    fn reg(&self, reg: Register) -> Option<u64>;

    /// Returns `false` if the register doesn't exist or can't be written
    /// (the stack pointer is read-only).
    fn set_reg(&mut self, reg: Register, value: u64) -> bool;

    /// Top of the x87 stack, or `None` when the stack is empty.
    fn fpu_top(&self) -> Option<f64>;

    /// Overwrite `st(0)`; pushes instead when the stack is empty.
    fn set_fpu_top(&mut self, value: f64);

    /// Push a value onto the x87 stack.
    fn fpu_push(&mut self, value: f64);

    /// Low scalar lane of `xmm{index}`.
    fn xmm_f32(&self, index: usize) -> Option<f32>;

    fn set_xmm_f32(&mut self, index: usize, value: f32) -> bool;
}

/// [`CpuContext`] over a live [`HookFrame`].
pub struct HookContext<'a> {
    frame: &'a mut HookFrame,
    arch: Arch,
    stack_skip: u64,
}

impl<'a> HookContext<'a> {
    /// # Safety
    ///
    /// `frame.regs` must point at a register block of the layout matching
    /// `arch`, valid for reads and writes while the context lives.
    pub unsafe fn new(frame: &'a mut HookFrame, arch: Arch, stack_skip: u64) -> Self {
        Self {
            frame,
            arch,
            stack_skip,
        }
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn pending_fpu_op(&self) -> FpuOp {
        match self.frame.fpu_op {
            1 => FpuOp::ReplaceTop,
            2 => FpuOp::Push,
            _ => FpuOp::None,
        }
    }

    fn regs32(&self) -> &Registers32 {
        // SAFETY: guaranteed by the constructor contract.
        unsafe { &*(self.frame.regs as usize as *const Registers32) }
    }

    fn regs32_mut(&mut self) -> &mut Registers32 {
        // SAFETY: guaranteed by the constructor contract.
        unsafe { &mut *(self.frame.regs as usize as *mut Registers32) }
    }

    fn regs64(&self) -> &Registers64 {
        // SAFETY: guaranteed by the constructor contract.
        unsafe { &*(self.frame.regs as usize as *const Registers64) }
    }

    fn regs64_mut(&mut self) -> &mut Registers64 {
        // SAFETY: guaranteed by the constructor contract.
        unsafe { &mut *(self.frame.regs as usize as *mut Registers64) }
    }

    fn reg32_slot(regs: &mut Registers32, reg: Register) -> Option<&mut u32> {
        Some(match reg {
            Register::Ax => &mut regs.eax,
            Register::Cx => &mut regs.ecx,
            Register::Dx => &mut regs.edx,
            Register::Bx => &mut regs.ebx,
            Register::Bp => &mut regs.ebp,
            Register::Si => &mut regs.esi,
            Register::Di => &mut regs.edi,
            Register::Flags => &mut regs.eflags,
            _ => return None,
        })
    }

    fn reg64_slot(regs: &mut Registers64, reg: Register) -> Option<&mut u64> {
        Some(match reg {
            Register::Ax => &mut regs.rax,
            Register::Cx => &mut regs.rcx,
            Register::Dx => &mut regs.rdx,
            Register::Bx => &mut regs.rbx,
            Register::Bp => &mut regs.rbp,
            Register::Si => &mut regs.rsi,
            Register::Di => &mut regs.rdi,
            Register::R8 => &mut regs.r8,
            Register::R9 => &mut regs.r9,
            Register::R10 => &mut regs.r10,
            Register::R11 => &mut regs.r11,
            Register::R12 => &mut regs.r12,
            Register::R13 => &mut regs.r13,
            Register::R14 => &mut regs.r14,
            Register::R15 => &mut regs.r15,
            Register::Flags => &mut regs.rflags,
            Register::Sp => return None,
        })
    }

    fn fpu_stack_top(&self) -> usize {
        let fsw = u16::from_le_bytes([self.frame.fx[FX_FSW], self.frame.fx[FX_FSW + 1]]);
        ((fsw >> 11) & 7) as usize
    }

    fn fpu_stack_empty(&self) -> bool {
        let ftw = self.frame.fx[FX_FTW];
        ftw & (1 << self.fpu_stack_top()) == 0
    }

    fn xmm_offset(&self, index: usize) -> Option<usize> {
        (index < self.arch.xmm_count()).then(|| FX_XMM0 + index * 16)
    }
}

impl CpuContext for HookContext<'_> {
    fn reg(&self, reg: Register) -> Option<u64> {
        match self.arch {
            Arch::X86 => {
                let mut regs = *self.regs32();
                if reg == Register::Sp {
                    return Some(regs.esp as u64);
                }
                Self::reg32_slot(&mut regs, reg).map(|v| *v as u64)
            }
            Arch::X64 => {
                if reg == Register::Sp {
                    let after_pushes =
                        self.frame.regs + std::mem::size_of::<Registers64>() as u64;
                    return Some(after_pushes + self.stack_skip);
                }
                let mut regs = *self.regs64();
                Self::reg64_slot(&mut regs, reg).map(|v| *v)
            }
        }
    }

    fn set_reg(&mut self, reg: Register, value: u64) -> bool {
        match self.arch {
            Arch::X86 => match Self::reg32_slot(self.regs32_mut(), reg) {
                Some(slot) => {
                    *slot = value as u32;
                    true
                }
                None => false,
            },
            Arch::X64 => match Self::reg64_slot(self.regs64_mut(), reg) {
                Some(slot) => {
                    *slot = value;
                    true
                }
                None => false,
            },
        }
    }

    fn fpu_top(&self) -> Option<f64> {
        if self.pending_fpu_op() != FpuOp::None {
            return Some(self.frame.fpu_value);
        }
        if self.fpu_stack_empty() {
            return None;
        }
        let mut st0 = [0u8; 10];
        st0.copy_from_slice(&self.frame.fx[FX_ST0..FX_ST0 + 10]);
        Some(f80_to_f64(st0))
    }

    fn set_fpu_top(&mut self, value: f64) {
        let op = match self.pending_fpu_op() {
            FpuOp::Push => FpuOp::Push,
            _ if self.fpu_stack_empty() => FpuOp::Push,
            _ => FpuOp::ReplaceTop,
        };
        self.frame.fpu_value = value;
        self.frame.fpu_op = op as u32;
    }

    fn fpu_push(&mut self, value: f64) {
        self.frame.fpu_value = value;
        self.frame.fpu_op = FpuOp::Push as u32;
    }

    fn xmm_f32(&self, index: usize) -> Option<f32> {
        let offset = self.xmm_offset(index)?;
        let fx = &self.frame.fx;
        Some(f32::from_le_bytes([
            fx[offset],
            fx[offset + 1],
            fx[offset + 2],
            fx[offset + 3],
        ]))
    }

    fn set_xmm_f32(&mut self, index: usize, value: f32) -> bool {
        match self.xmm_offset(index) {
            Some(offset) => {
                self.frame.fx[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
                true
            }
            None => false,
        }
    }
}

/// Convert an x87 80-bit extended value to `f64` (round to nearest).
pub fn f80_to_f64(bytes: [u8; 10]) -> f64 {
    let mut mantissa_bytes = [0u8; 8];
    mantissa_bytes.copy_from_slice(&bytes[..8]);
    let mantissa = u64::from_le_bytes(mantissa_bytes);
    let sign_exp = u16::from_le_bytes([bytes[8], bytes[9]]);
    let negative = sign_exp & 0x8000 != 0;
    let exponent = (sign_exp & 0x7FFF) as i32;

    let magnitude = if exponent == 0x7FFF {
        if mantissa << 1 == 0 {
            f64::INFINITY
        } else {
            f64::NAN
        }
    } else if mantissa == 0 {
        0.0
    } else {
        // value = mantissa * 2^(exponent - 16383 - 63)
        let mut scale = exponent - 16383 - 63;
        let mut value = mantissa as f64;
        while scale > 0 {
            let step = scale.min(1000);
            value *= 2f64.powi(step);
            scale -= step;
        }
        while scale < 0 {
            let step = (-scale).min(1000);
            value /= 2f64.powi(step);
            scale += step;
        }
        value
    };

    if negative { -magnitude } else { magnitude }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f80(mantissa: u64, sign_exp: u16) -> [u8; 10] {
        let mut out = [0u8; 10];
        out[..8].copy_from_slice(&mantissa.to_le_bytes());
        out[8..].copy_from_slice(&sign_exp.to_le_bytes());
        out
    }

    fn with_fpu_value(frame: &mut HookFrame, top: usize, value: [u8; 10]) {
        let fsw = (top as u16) << 11;
        frame.fx[FX_FSW..FX_FSW + 2].copy_from_slice(&fsw.to_le_bytes());
        frame.fx[FX_FTW] = 1 << top;
        frame.fx[FX_ST0..FX_ST0 + 10].copy_from_slice(&value);
    }

    #[test]
    fn test_f80_conversion() {
        assert_eq!(f80_to_f64(f80(0x8000_0000_0000_0000, 0x3FFF)), 1.0);
        assert_eq!(f80_to_f64(f80(0x8000_0000_0000_0000, 0xBFFF)), -1.0);
        assert_eq!(f80_to_f64(f80(0xC000_0000_0000_0000, 0x4000)), 3.0);
        assert_eq!(f80_to_f64(f80(0, 0)), 0.0);
        assert_eq!(f80_to_f64(f80(0x8000_0000_0000_0000, 0x7FFF)), f64::INFINITY);
        assert!(f80_to_f64(f80(0xC000_0000_0000_0000, 0x7FFF)).is_nan());
        // 0.75 = 1.5 * 2^-1
        assert_eq!(f80_to_f64(f80(0xC000_0000_0000_0000, 0x3FFE)), 0.75);
    }

    #[test]
    fn test_registers_32() {
        let mut regs = Registers32 {
            eax: 0x1111,
            esp: 0x0019_FF00,
            ..Default::default()
        };
        let mut frame = HookFrame::new(&mut regs as *mut Registers32 as usize as u64);
        let mut ctx = unsafe { HookContext::new(&mut frame, Arch::X86, 0) };

        assert_eq!(ctx.reg(Register::Ax), Some(0x1111));
        assert_eq!(ctx.reg(Register::Sp), Some(0x0019_FF00));
        assert_eq!(ctx.reg(Register::R8), None);
        assert!(ctx.set_reg(Register::Cx, 0x1_0000_0042));
        assert!(!ctx.set_reg(Register::Sp, 0));
        drop(ctx);
        assert_eq!(regs.ecx, 0x42);
        assert_eq!(regs.esp, 0x0019_FF00);
    }

    #[test]
    fn test_registers_64_stack_pointer() {
        let mut regs = Registers64 {
            r12: 7,
            ..Default::default()
        };
        let regs_addr = &mut regs as *mut Registers64 as usize as u64;
        let mut frame = HookFrame::new(regs_addr);
        let mut ctx = unsafe { HookContext::new(&mut frame, Arch::X64, 128) };

        assert_eq!(ctx.reg(Register::R12), Some(7));
        assert_eq!(ctx.reg(Register::Sp), Some(regs_addr + 128 + 128));
        assert!(ctx.set_reg(Register::Ax, u64::MAX));
        drop(ctx);
        assert_eq!(regs.rax, u64::MAX);
    }

    #[test]
    fn test_fpu_top_and_replace() {
        let mut regs = Registers32::default();
        let mut frame = HookFrame::new(&mut regs as *mut Registers32 as usize as u64);
        with_fpu_value(&mut frame, 7, f80(0x8000_0000_0000_0000, 0x3FFF));
        let mut ctx = unsafe { HookContext::new(&mut frame, Arch::X86, 0) };

        assert_eq!(ctx.fpu_top(), Some(1.0));
        ctx.set_fpu_top(1.5);
        assert_eq!(ctx.pending_fpu_op(), FpuOp::ReplaceTop);
        assert_eq!(ctx.fpu_top(), Some(1.5));
    }

    #[test]
    fn test_fpu_set_top_on_empty_stack_pushes() {
        let mut regs = Registers32::default();
        let mut frame = HookFrame::new(&mut regs as *mut Registers32 as usize as u64);
        let mut ctx = unsafe { HookContext::new(&mut frame, Arch::X86, 0) };

        assert_eq!(ctx.fpu_top(), None);
        ctx.set_fpu_top(2.0);
        assert_eq!(ctx.pending_fpu_op(), FpuOp::Push);

        ctx.fpu_push(1.25);
        assert_eq!(ctx.pending_fpu_op(), FpuOp::Push);
        assert_eq!(frame.fpu_value, 1.25);
    }

    #[test]
    fn test_xmm_lanes() {
        let mut regs = Registers64::default();
        let mut frame = HookFrame::new(&mut regs as *mut Registers64 as usize as u64);
        let mut ctx = unsafe { HookContext::new(&mut frame, Arch::X64, 0) };

        assert!(ctx.set_xmm_f32(15, 1.7777778));
        assert_eq!(ctx.xmm_f32(15), Some(1.7777778));
        assert_eq!(ctx.xmm_f32(16), None);
        drop(ctx);

        let mut ctx32 = unsafe { HookContext::new(&mut frame, Arch::X86, 0) };
        assert!(!ctx32.set_xmm_f32(8, 1.0));
        assert_eq!(ctx32.xmm_f32(0), Some(0.0));
    }

    #[test]
    fn test_register_names() {
        assert_eq!(Register::R10.to_string(), "r10");
        assert_eq!("ax".parse::<Register>().unwrap(), Register::Ax);
    }
}
