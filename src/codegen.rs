//! # x86 / x86-64 Code Generation
//!
//! Only a handful of fixed sequences are ever emitted: the 5-byte `jmp` or
//! `call` that replaces instructions at a site, the trampoline that preserves
//! machine state around a call into an instrumentation function, and the
//! default function bodies. Instructions displaced from a site are decoded
//! with iced-x86; position-independent ones are copied as they are and
//! relative branches or rip-relative operands are re-encoded for their new
//! address.

use goblin::elf::header::{EM_386, EM_X86_64};
use iced_x86::{
    BlockEncoder, BlockEncoderOptions, Decoder, DecoderOptions, Instruction, InstructionBlock, OpKind,
};

use crate::error::{InstrumentError, InstrumentResult};

/// Opcodes
pub mod opcodes {
    pub const CALL_REL32: u8 = 0xE8;
    pub const JMP_REL32: u8 = 0xE9;
    pub const NOP: u8 = 0x90;
    pub const RET: u8 = 0xC3;
    pub const PUSHF: u8 = 0x9C;
    pub const POPF: u8 = 0x9D;
}

use opcodes::*;

/// Length of a `jmp rel32` / `call rel32`
pub const BRANCH_SIZE: usize = 5;

/// Instruction set of the target image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86,
    X86_64,
}

impl Arch {
    pub fn from_machine(machine: u16) -> InstrumentResult<Self> {
        match machine {
            EM_386 => Ok(Arch::X86),
            EM_X86_64 => Ok(Arch::X86_64),
            other => Err(InstrumentError::UnsupportedArchitecture(other)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Arch::X86 => "x86",
            Arch::X86_64 => "x86-64",
        }
    }

    pub fn bitness(&self) -> u32 {
        match self {
            Arch::X86 => 32,
            Arch::X86_64 => 64,
        }
    }

    /// Size of a trampoline whose `displaced` bytes need no relocation
    pub fn trampoline_size(&self, displaced: usize) -> usize {
        match self {
            Arch::X86 => X86_SAVE.len() + 5 + 5 + X86_RESTORE.len() + displaced + BRANCH_SIZE,
            Arch::X86_64 => X64_SAVE.len() + 5 + 5 + X64_RESTORE.len() + displaced + BRANCH_SIZE,
        }
    }

    /// Size of the entry trampoline
    pub fn entry_trampoline_size(&self) -> usize {
        match self {
            Arch::X86 => X86_SAVE.len() + 5 + 5 + X86_RESTORE.len() + BRANCH_SIZE,
            Arch::X86_64 => X64_SAVE.len() + 7 + 5 + X64_RESTORE.len() + BRANCH_SIZE,
        }
    }
}

/// Signed 32-bit displacement from the end of an instruction to `target`
pub fn rel32(next_ip: u64, target: u64) -> InstrumentResult<i32> {
    let delta = target.wrapping_sub(next_ip) as i64;
    i32::try_from(delta).map_err(|_| {
        InstrumentError::out_of_range(
            format!("rel32 displacement from 0x{:x} to 0x{:x}", next_ip, target),
            delta.unsigned_abs(),
            i32::MAX as u64,
        )
    })
}

fn branch(opcode: u8, from: u64, to: u64) -> InstrumentResult<[u8; BRANCH_SIZE]> {
    let rel = rel32(from + BRANCH_SIZE as u64, to)?.to_le_bytes();
    Ok([opcode, rel[0], rel[1], rel[2], rel[3]])
}

pub fn jmp_rel32(from: u64, to: u64) -> InstrumentResult<[u8; BRANCH_SIZE]> {
    branch(JMP_REL32, from, to)
}

pub fn call_rel32(from: u64, to: u64) -> InstrumentResult<[u8; BRANCH_SIZE]> {
    branch(CALL_REL32, from, to)
}

/// Target of the `call rel32` encoded in `bytes` at `address`
pub fn decode_call_target(address: u64, bytes: &[u8]) -> Option<u64> {
    if bytes.len() < BRANCH_SIZE || bytes[0] != CALL_REL32 {
        return None;
    }
    let rel = i32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
    Some((address + BRANCH_SIZE as u64).wrapping_add(rel as i64 as u64))
}

/// Bytes written over a site: a jump to its trampoline padded with `nop`
pub fn site_patch(site: u64, length: usize, trampoline: u64) -> InstrumentResult<Vec<u8>> {
    if length < BRANCH_SIZE {
        return Err(InstrumentError::invalid_site(
            site,
            format!("{} bytes cannot hold a {}-byte jump", length, BRANCH_SIZE),
        ));
    }
    let mut patch = jmp_rel32(site, trampoline)?.to_vec();
    patch.resize(length, NOP);
    Ok(patch)
}

fn decode_error(decoder: &Decoder<'_>, at: u64) -> InstrumentError {
    InstrumentError::invalid_site(
        at,
        format!("no whole instruction at 0x{:x} ({:?})", decoder.ip(), decoder.last_error()),
    )
}

/// Decode `code` taken from `address`; it must hold whole instructions only
pub fn decode_instructions(arch: Arch, address: u64, code: &[u8]) -> InstrumentResult<Vec<Instruction>> {
    let mut decoder = Decoder::with_ip(arch.bitness(), code, address, DecoderOptions::NONE);
    let mut instructions = Vec::new();
    while decoder.can_decode() {
        let insn = decoder.decode();
        if insn.is_invalid() {
            return Err(decode_error(&decoder, address));
        }
        instructions.push(insn);
    }
    Ok(instructions)
}

/// Bytes taken by the whole instructions at the start of `code` that
/// together cover at least `min` bytes
pub fn instruction_span(arch: Arch, address: u64, code: &[u8], min: usize) -> InstrumentResult<usize> {
    let mut decoder = Decoder::with_ip(arch.bitness(), code, address, DecoderOptions::NONE);
    let mut length = 0;
    while length < min {
        if !decoder.can_decode() {
            return Err(InstrumentError::invalid_site(
                address,
                format!("{} bytes of code cannot hold a {}-byte patch", length, min),
            ));
        }
        let insn = decoder.decode();
        if insn.is_invalid() {
            return Err(decode_error(&decoder, address));
        }
        length += insn.len();
    }
    Ok(length)
}

fn is_ip_relative(insn: &Instruction) -> bool {
    insn.is_ip_rel_memory_operand()
        || (0..insn.op_count()).any(|i| {
            matches!(
                insn.op_kind(i),
                OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64
            )
        })
}

/// Re-encode the instructions in `code`, taken from `from`, to run at `to`
///
/// Short branches grow to their rel32 form when the target moves out of
/// reach, so the result can be longer than `code`.
pub fn relocate(arch: Arch, from: u64, code: &[u8], to: u64) -> InstrumentResult<Vec<u8>> {
    let mut out = Vec::with_capacity(code.len() + 8);
    let mut offset = 0;
    for insn in decode_instructions(arch, from, code)? {
        let length = insn.len();
        if is_ip_relative(&insn) {
            let block = [insn];
            let encoded = BlockEncoder::encode(
                arch.bitness(),
                InstructionBlock::new(&block, to + out.len() as u64),
                BlockEncoderOptions::NONE,
            )
            .map_err(|e| InstrumentError::invalid_site(insn.ip(), format!("cannot relocate: {}", e)))?;
            out.extend_from_slice(&encoded.code_buffer);
        } else {
            out.extend_from_slice(&code[offset..offset + length]);
        }
        offset += length;
    }
    Ok(out)
}

// lea rsp,[rsp-128]; pushfq; push rax rcx rdx rsi rdi r8 r9 r10 r11 rbp;
// mov rbp,rsp; and rsp,-16
const X64_SAVE: &[u8] = &[
    0x48, 0x8D, 0x64, 0x24, 0x80, PUSHF, 0x50, 0x51, 0x52, 0x56, 0x57, 0x41, 0x50, 0x41, 0x51,
    0x41, 0x52, 0x41, 0x53, 0x55, 0x48, 0x89, 0xE5, 0x48, 0x83, 0xE4, 0xF0,
];

// mov rsp,rbp; pop rbp r11 r10 r9 r8 rdi rsi rdx rcx rax; popfq; lea rsp,[rsp+128]
const X64_RESTORE: &[u8] = &[
    0x48, 0x89, 0xEC, 0x5D, 0x41, 0x5B, 0x41, 0x5A, 0x41, 0x59, 0x41, 0x58, 0x5F, 0x5E, 0x5A,
    0x59, 0x58, POPF, 0x48, 0x8D, 0xA4, 0x24, 0x80, 0x00, 0x00, 0x00,
];

// pushfd; pushad; mov ebp,esp; and esp,-16; sub esp,12
const X86_SAVE: &[u8] = &[PUSHF, 0x60, 0x89, 0xE5, 0x83, 0xE4, 0xF0, 0x83, 0xEC, 0x0C];

// mov esp,ebp; popad; popfd
const X86_RESTORE: &[u8] = &[0x89, 0xEC, 0x61, POPF];

/// What the trampoline passes to the instrumentation function
#[derive(Debug, Clone, Copy)]
enum Argument {
    Immediate(u32),
    Address(u64),
}

/// Incrementally assembled code at a known virtual address
struct Emitter {
    base: u64,
    code: Vec<u8>,
}

impl Emitter {
    fn new(base: u64) -> Self {
        Self {
            base,
            code: Vec::with_capacity(96),
        }
    }

    fn here(&self) -> u64 {
        self.base + self.code.len() as u64
    }

    fn bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    fn call(&mut self, target: u64) -> InstrumentResult<()> {
        let insn = call_rel32(self.here(), target)?;
        self.bytes(&insn);
        Ok(())
    }

    fn jmp(&mut self, target: u64) -> InstrumentResult<()> {
        let insn = jmp_rel32(self.here(), target)?;
        self.bytes(&insn);
        Ok(())
    }

    fn argument(&mut self, arch: Arch, arg: Argument) -> InstrumentResult<()> {
        match (arch, arg) {
            (Arch::X86_64, Argument::Immediate(value)) => {
                // mov edi, imm32
                self.bytes(&[0xBF]);
                self.bytes(&value.to_le_bytes());
            }
            (Arch::X86_64, Argument::Address(address)) => {
                // lea rdi,[rip+disp32]
                let disp = rel32(self.here() + 7, address)?;
                self.bytes(&[0x48, 0x8D, 0x3D]);
                self.bytes(&disp.to_le_bytes());
            }
            (Arch::X86, Argument::Immediate(value)) => {
                // push imm32
                self.bytes(&[0x68]);
                self.bytes(&value.to_le_bytes());
            }
            (Arch::X86, Argument::Address(address)) => {
                let absolute = u32::try_from(address).map_err(|_| {
                    InstrumentError::out_of_range("32-bit absolute address", address, u32::MAX as u64)
                })?;
                self.bytes(&[0x68]);
                self.bytes(&absolute.to_le_bytes());
            }
        }
        Ok(())
    }

    fn wrapped_call(&mut self, arch: Arch, arg: Argument, function: u64) -> InstrumentResult<()> {
        let (save, restore) = match arch {
            Arch::X86 => (X86_SAVE, X86_RESTORE),
            Arch::X86_64 => (X64_SAVE, X64_RESTORE),
        };
        self.bytes(save);
        self.argument(arch, arg)?;
        self.call(function)?;
        self.bytes(restore);
        Ok(())
    }

    /// Run the instructions displaced from `site`, then jump back past them
    fn displaced(&mut self, arch: Arch, site: u64, displaced: &[u8]) -> InstrumentResult<()> {
        let code = relocate(arch, site, displaced, self.here())?;
        self.bytes(&code);
        self.jmp(site + displaced.len() as u64)
    }

    fn finish(self) -> Vec<u8> {
        self.code
    }
}

/// Trampoline at `at` for a site at `site` whose original bytes are `displaced`
///
/// Calls `function(site_index)` with all caller-saved state preserved, then
/// runs the displaced instructions and jumps back past the patch.
pub fn trampoline(
    arch: Arch,
    at: u64,
    site: u64,
    displaced: &[u8],
    site_index: u32,
    function: u64,
) -> InstrumentResult<Vec<u8>> {
    let mut e = Emitter::new(at);
    e.wrapped_call(arch, Argument::Immediate(site_index), function)?;
    e.displaced(arch, site, displaced)?;
    Ok(e.finish())
}

/// Like [`trampoline`], but passes the descriptor table address to `hook`
pub fn hook_trampoline(
    arch: Arch,
    at: u64,
    site: u64,
    displaced: &[u8],
    table: u64,
    hook: u64,
) -> InstrumentResult<Vec<u8>> {
    let mut e = Emitter::new(at);
    e.wrapped_call(arch, Argument::Address(table), hook)?;
    e.displaced(arch, site, displaced)?;
    Ok(e.finish())
}

/// Trampoline that becomes the program entry point: calls `hook(table)` and
/// continues at the original entry
pub fn entry_trampoline(arch: Arch, at: u64, table: u64, hook: u64, original_entry: u64) -> InstrumentResult<Vec<u8>> {
    let code = hook_trampoline(arch, at, original_entry, &[], table, hook)?;
    debug_assert_eq!(code.len(), arch.entry_trampoline_size());
    Ok(code)
}

/// `ret`
pub fn stub_body() -> Vec<u8> {
    vec![RET]
}

/// Tail jump to `target`
pub fn forward_body(at: u64, target: u64) -> InstrumentResult<Vec<u8>> {
    Ok(jmp_rel32(at, target)?.to_vec())
}

/// Increment the 64-bit counter `counters[site_index]`
pub fn counter_body(arch: Arch, at: u64, counters: u64) -> InstrumentResult<Vec<u8>> {
    let mut e = Emitter::new(at);
    match arch {
        Arch::X86_64 => {
            // lea rax,[rip+counters]; inc qword [rax+rdi*8]; ret
            let disp = rel32(e.here() + 7, counters)?;
            e.bytes(&[0x48, 0x8D, 0x05]);
            e.bytes(&disp.to_le_bytes());
            e.bytes(&[0x48, 0xFF, 0x04, 0xF8, RET]);
        }
        Arch::X86 => {
            let low = u32::try_from(counters).map_err(|_| {
                InstrumentError::out_of_range("32-bit counter address", counters, u32::MAX as u64)
            })?;
            let high = low.checked_add(4).ok_or_else(|| {
                InstrumentError::out_of_range("32-bit counter address", counters + 4, u32::MAX as u64)
            })?;
            // mov eax,[esp+4]; add dword [eax*8+low],1; adc dword [eax*8+high],0; ret
            e.bytes(&[0x8B, 0x44, 0x24, 0x04]);
            e.bytes(&[0x83, 0x04, 0xC5]);
            e.bytes(&low.to_le_bytes());
            e.bytes(&[0x01]);
            e.bytes(&[0x83, 0x14, 0xC5]);
            e.bytes(&high.to_le_bytes());
            e.bytes(&[0x00, RET]);
        }
    }
    Ok(e.finish())
}
