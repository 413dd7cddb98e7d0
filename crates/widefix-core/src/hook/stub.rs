//! Machine code for hook stubs and site jumps.
//!
//! A stub saves every general-purpose register and the flags, captures the
//! FPU/SSE state with `fxsave` into an aligned [`HookFrame`], calls the
//! dispatcher, restores everything, optionally replays the relocated
//! instructions it displaced and jumps back behind the hook site.
//!
//! [`HookFrame`]: super::context::HookFrame

use iced_x86::code_asm::*;
use iced_x86::{Decoder, DecoderOptions, IcedError, Instruction, Mnemonic};
use strum::Display;

use super::context::{
    Arch, FRAME_FPU_OP_OFFSET, FRAME_FPU_VALUE_OFFSET, FRAME_REGS_OFFSET, FRAME_SIZE, FpuOp,
};
use crate::error::{Error, Result};
use crate::memory::NOP;

/// `E9 rel32`
pub const JMP_REL32_LEN: usize = 5;

/// Bytes past the red zone the SysV stub skips before pushing.
const RED_ZONE: i32 = 128;

/// Shadow space a Win64 callee may use above its return address.
const SHADOW_SPACE: i32 = 32;

/// Calling convention of the compiled dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum CallConv {
    Win64,
    SysV64,
    Cdecl32,
}

impl CallConv {
    /// Convention of `extern "C"` functions in this build, if hooks are supported.
    pub fn native() -> Option<Self> {
        if cfg!(target_arch = "x86_64") {
            if cfg!(target_os = "windows") {
                Some(CallConv::Win64)
            } else {
                Some(CallConv::SysV64)
            }
        } else if cfg!(target_arch = "x86") {
            Some(CallConv::Cdecl32)
        } else {
            None
        }
    }

    pub fn arch(self) -> Arch {
        match self {
            CallConv::Win64 | CallConv::SysV64 => Arch::X64,
            CallConv::Cdecl32 => Arch::X86,
        }
    }

    /// Distance between the register block and the interrupted stack pointer,
    /// beyond the pushed registers themselves.
    pub fn stack_skip(self) -> u64 {
        match self {
            CallConv::SysV64 => RED_ZONE as u64,
            _ => 0,
        }
    }
}

/// Whole instructions displaced by the site jump.
#[derive(Debug, Clone)]
pub struct StolenCode {
    pub instructions: Vec<Instruction>,
    pub len: usize,
}

/// Decode instructions at `address` until at least [`JMP_REL32_LEN`] bytes
/// are covered.
///
/// Fails on invalid encodings, on running out of bytes, and when an
/// instruction that leaves the function (`ret`, `jmp`, `int3`) ends before
/// the jump would, since the bytes after it may belong to other code.
pub fn steal_instructions(code: &[u8], address: u64, bitness: u32) -> Result<StolenCode> {
    let mut decoder = Decoder::try_with_ip(bitness, code, address, DecoderOptions::NONE)?;
    let mut instructions = Vec::new();
    let mut len = 0usize;

    while len < JMP_REL32_LEN {
        let at = address as usize + len;
        if !decoder.can_decode() {
            return Err(Error::Decode { address: at });
        }
        let instr = decoder.decode();
        if instr.is_invalid() {
            return Err(Error::Decode { address: at });
        }
        len += instr.len();

        let leaves = matches!(
            instr.mnemonic(),
            Mnemonic::Ret | Mnemonic::Retf | Mnemonic::Jmp | Mnemonic::Int3
        );
        if leaves && len < JMP_REL32_LEN {
            return Err(Error::HookInstall {
                address: address as usize,
                reason: format!(
                    "{:?} at {:#x} ends the function inside the overwritten bytes",
                    instr.mnemonic(),
                    at
                ),
            });
        }
        instructions.push(instr);
    }

    Ok(StolenCode { instructions, len })
}

/// Whether the first `len` bytes of `code` are whole instructions.
pub fn ends_on_boundary(code: &[u8], address: u64, bitness: u32, len: usize) -> bool {
    let Ok(mut decoder) = Decoder::try_with_ip(bitness, code, address, DecoderOptions::NONE) else {
        return false;
    };
    let mut covered = 0usize;
    while covered < len && decoder.can_decode() {
        let instr = decoder.decode();
        if instr.is_invalid() {
            return false;
        }
        covered += instr.len();
    }
    covered == len
}

/// Everything needed to lay out one stub.
pub struct StubLayout<'a> {
    pub conv: CallConv,
    /// Address the stub will run at.
    pub address: u64,
    pub site: u64,
    pub dispatch: u64,
    pub slot: u64,
    /// Instructions replayed after the callback; empty for replacement hooks.
    pub relocated: &'a [Instruction],
    pub resume_at: u64,
}

/// Assemble the stub for `layout`.
pub fn assemble_stub(layout: &StubLayout<'_>) -> Result<Vec<u8>> {
    let fail = |reason: String| Error::HookInstall {
        address: layout.site as usize,
        reason,
    };

    let pointers = match layout.conv {
        CallConv::Cdecl32 => {
            let slot = u32::try_from(layout.slot);
            let dispatch = u32::try_from(layout.dispatch);
            match (slot, dispatch) {
                (Ok(slot), Ok(dispatch)) => Some((slot, dispatch)),
                _ => return Err(fail("stub pointers do not fit in 32 bits".to_string())),
            }
        }
        CallConv::Win64 | CallConv::SysV64 => None,
    };

    emit(layout, pointers).map_err(|e| fail(e.to_string()))
}

fn emit(
    layout: &StubLayout<'_>,
    pointers32: Option<(u32, u32)>,
) -> std::result::Result<Vec<u8>, IcedError> {
    let mut a = CodeAssembler::new(layout.conv.arch().bitness())?;
    match pointers32 {
        Some((slot, dispatch)) => emit_x86(&mut a, slot, dispatch)?,
        None => emit_x64(&mut a, layout)?,
    }
    for instr in layout.relocated {
        a.add_instruction(*instr)?;
    }
    a.jmp(layout.resume_at)?;
    a.assemble(layout.address)
}

const SAVED_X64: [AsmRegister64; 15] = [
    rax, rcx, rdx, rbx, rbp, rsi, rdi, r8, r9, r10, r11, r12, r13, r14, r15,
];

fn emit_x64(a: &mut CodeAssembler, layout: &StubLayout<'_>) -> std::result::Result<(), IcedError> {
    let sysv = layout.conv == CallConv::SysV64;

    if sysv {
        a.lea(rsp, ptr(rsp - RED_ZONE))?;
    }
    for reg in SAVED_X64 {
        a.push(reg)?;
    }
    a.pushfq()?;
    a.cld()?;

    a.mov(rbx, rsp)?;
    a.and(rsp, -16)?;
    a.sub(rsp, FRAME_SIZE)?;
    a.fxsave64(ptr(rsp))?;
    a.emms()?;
    a.mov(qword_ptr(rsp + FRAME_REGS_OFFSET), rbx)?;
    a.mov(qword_ptr(rsp + FRAME_FPU_VALUE_OFFSET), 0i32)?;
    a.mov(dword_ptr(rsp + FRAME_FPU_OP_OFFSET), 0i32)?;

    let (frame_arg, slot_arg) = if sysv { (rdi, rsi) } else { (rcx, rdx) };
    a.mov(frame_arg, rsp)?;
    a.mov(slot_arg, layout.slot)?;
    a.mov(rax, layout.dispatch)?;
    if !sysv {
        a.sub(rsp, SHADOW_SPACE)?;
    }
    a.call(rax)?;
    if !sysv {
        a.add(rsp, SHADOW_SPACE)?;
    }

    a.fxrstor64(ptr(rsp))?;
    let mut load = a.create_label();
    let mut done = a.create_label();
    a.mov(eax, dword_ptr(rsp + FRAME_FPU_OP_OFFSET))?;
    a.test(eax, eax)?;
    a.je(done)?;
    a.cmp(eax, FpuOp::ReplaceTop as i32)?;
    a.jne(load)?;
    a.fstp(st0)?;
    a.set_label(&mut load)?;
    a.fld(qword_ptr(rsp + FRAME_FPU_VALUE_OFFSET))?;
    a.set_label(&mut done)?;
    a.mov(rsp, rbx)?;

    a.popfq()?;
    for reg in SAVED_X64.iter().rev() {
        a.pop(*reg)?;
    }
    if sysv {
        a.lea(rsp, ptr(rsp + RED_ZONE))?;
    }
    Ok(())
}

fn emit_x86(a: &mut CodeAssembler, slot: u32, dispatch: u32) -> std::result::Result<(), IcedError> {
    a.pushad()?;
    a.pushfd()?;
    a.cld()?;

    a.mov(ebx, esp)?;
    a.and(esp, -16)?;
    a.sub(esp, FRAME_SIZE)?;
    a.fxsave(ptr(esp))?;
    a.emms()?;
    a.mov(dword_ptr(esp + FRAME_REGS_OFFSET), ebx)?;
    a.mov(dword_ptr(esp + (FRAME_REGS_OFFSET + 4)), 0i32)?;
    a.mov(dword_ptr(esp + FRAME_FPU_VALUE_OFFSET), 0i32)?;
    a.mov(dword_ptr(esp + (FRAME_FPU_VALUE_OFFSET + 4)), 0i32)?;
    a.mov(dword_ptr(esp + FRAME_FPU_OP_OFFSET), 0i32)?;

    // Two pushes plus padding keep esp 16-byte aligned at the call.
    a.mov(eax, esp)?;
    a.sub(esp, 8)?;
    a.mov(ecx, slot)?;
    a.push(ecx)?;
    a.push(eax)?;
    a.mov(eax, dispatch)?;
    a.call(eax)?;
    a.add(esp, 16)?;

    a.fxrstor(ptr(esp))?;
    let mut load = a.create_label();
    let mut done = a.create_label();
    a.mov(eax, dword_ptr(esp + FRAME_FPU_OP_OFFSET))?;
    a.test(eax, eax)?;
    a.je(done)?;
    a.cmp(eax, FpuOp::ReplaceTop as i32)?;
    a.jne(load)?;
    a.fstp(st0)?;
    a.set_label(&mut load)?;
    a.fld(qword_ptr(esp + FRAME_FPU_VALUE_OFFSET))?;
    a.set_label(&mut done)?;
    a.mov(esp, ebx)?;

    a.popfd()?;
    a.popad()?;
    Ok(())
}

/// `jmp target` at `site`, padded with NOPs to `len` bytes.
///
/// `None` when the displacement doesn't fit in 32 bits.
pub fn site_jump(site: u64, target: u64, len: usize) -> Option<Vec<u8>> {
    let next = site.checked_add(JMP_REL32_LEN as u64)?;
    let rel = i32::try_from(target as i64 - next as i64).ok()?;

    let mut bytes = Vec::with_capacity(len.max(JMP_REL32_LEN));
    bytes.push(0xE9);
    bytes.extend_from_slice(&rel.to_le_bytes());
    bytes.resize(len.max(JMP_REL32_LEN), NOP);
    Some(bytes)
}
