//! # Disassembly Module
//!
//! Instruction decoding for the places where the engine has to look at guest code: telling
//! `syscall` from `sysret` after a #UD, measuring a call for step-over, and listing guest
//! memory for the debugger.
//!
//! All decoding is done by the iced-x86 [`Decoder`].

use std::fmt::{Display, Write};

use iced_x86::{
    Code, Decoder, DecoderOptions, FlowControl, Formatter, FormatterOutput, FormatterTextKind,
    Instruction, NasmFormatter,
};
use serde::{Serialize, Serializer};

use crate::Addr;

/// Longest possible x86 instruction
pub const MAX_INSTRUCTION_LENGTH: usize = 15;

/// Type alias for text content in disassembled code
///
/// Represents a piece of text and its kind (e.g., mnemonic, register, number)
/// in the disassembled instruction.
pub type TextContent = (String, FormatterTextKind);

#[derive(Serialize)]
struct SerializableTextContent {
    text: String,
    kind: String,
}

/// Custom output container for the disassembly formatter
struct DisassemblyOutput(Vec<TextContent>);

impl FormatterOutput for DisassemblyOutput {
    fn write(&mut self, text: &str, kind: FormatterTextKind) {
        self.0.push((text.to_string(), kind));
    }
}

/// The instructions `#UD` is raised for while the syscall hook is active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, serde::Deserialize)]
pub enum SyscallKind {
    Syscall,
    Sysret,
}

/// Decode the first instruction of `bytes`, `None` if it is not a valid instruction
pub fn decode_one(bytes: &[u8], ip: u64, bitness: u32) -> Option<Instruction> {
    let mut decoder = Decoder::with_ip(bitness, bytes, ip, DecoderOptions::NONE);
    if !decoder.can_decode() {
        return None;
    }
    let instruction = decoder.decode();
    if instruction.is_invalid() {
        None
    } else {
        Some(instruction)
    }
}

/// Length of the instruction at `ip` if it is a call
pub fn call_length(bytes: &[u8], ip: u64, bitness: u32) -> Option<usize> {
    let instruction = decode_one(bytes, ip, bitness)?;
    match instruction.flow_control() {
        FlowControl::Call | FlowControl::IndirectCall => Some(instruction.len()),
        _ => None,
    }
}

/// Whether the bytes start with `syscall` or `sysret`
pub fn syscall_kind(bytes: &[u8]) -> Option<SyscallKind> {
    let instruction = decode_one(bytes, 0, 64)?;
    match instruction.code() {
        Code::Syscall => Some(SyscallKind::Syscall),
        Code::Sysretd | Code::Sysretq => Some(SyscallKind::Sysret),
        _ => None,
    }
}

fn formatter() -> NasmFormatter {
    let mut formatter = NasmFormatter::new();

    // padding
    formatter.options_mut().set_first_operand_char_index(16);

    // numbers stuff
    formatter.options_mut().set_hex_suffix("");
    formatter.options_mut().set_hex_prefix("");
    formatter.options_mut().set_uppercase_hex(false);
    formatter.options_mut().set_decimal_suffix("");
    formatter.options_mut().set_decimal_prefix("0d");

    // memory stuff
    formatter.options_mut().set_show_symbol_address(true);
    formatter.options_mut().set_rip_relative_addresses(false);
    formatter
        .options_mut()
        .set_memory_size_options(iced_x86::MemorySizeOptions::Always);
    formatter
}

/// One line of text for a log message
pub fn format_instruction(instruction: &Instruction) -> String {
    let mut out = String::new();
    formatter().format(instruction, &mut out);
    out
}

/// Represents the result of disassembling a section of guest memory
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize)]
pub struct Disassembly {
    // address, raw data, interpreted data for display
    #[serde(serialize_with = "serialize_disassembly_vec")]
    vec: Vec<(Addr, Vec<u8>, Vec<TextContent>)>,
}

impl Disassembly {
    #[must_use]
    pub fn empty() -> Self {
        Self { vec: Vec::new() }
    }

    /// Disassembles `data`, which was read from `first_addr`
    ///
    /// Decoding stops at the first byte sequence that is not a complete instruction.
    pub fn disassemble(data: &[u8], first_addr: Addr, bitness: u32) -> Self {
        let mut decoder = Decoder::with_ip(bitness, data, first_addr.u64(), DecoderOptions::NONE);
        let mut formatter = formatter();

        let mut disassembly = Self::empty();
        let mut instruction = Instruction::default();
        while decoder.can_decode() {
            decoder.decode_out(&mut instruction);
            if instruction.is_invalid() {
                break;
            }
            let mut text = DisassemblyOutput(Vec::new());
            formatter.format(&instruction, &mut text);

            let start = (instruction.ip() - first_addr.u64()) as usize;
            let raw = data[start..start + instruction.len()].to_vec();
            disassembly
                .vec
                .push((instruction.ip().into(), raw, text.0));
        }
        disassembly
    }

    #[must_use]
    pub fn inner(&self) -> &[(Addr, Vec<u8>, Vec<TextContent>)] {
        &self.vec
    }

    pub fn len(&self) -> usize {
        self.vec.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vec.is_empty()
    }
}

impl Display for Disassembly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut buf2 = String::new();
        for (addr, raw, content) in self.inner() {
            write!(f, "{addr}    ")?;
            for byte in raw {
                write!(buf2, "{byte:02x} ")?;
            }
            write!(f, "{buf2:<20}\t")?;
            buf2.clear();
            for (thing, _kind) in content {
                write!(f, "{thing}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

impl From<&TextContent> for SerializableTextContent {
    fn from(content: &TextContent) -> Self {
        Self {
            text: content.0.clone(),
            kind: format!("{:?}", content.1),
        }
    }
}

fn serialize_disassembly_vec<S>(
    data: &[(Addr, Vec<u8>, Vec<TextContent>)],
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let serializable_data: Vec<(Addr, Vec<u8>, Vec<SerializableTextContent>)> = data
        .iter()
        .map(|(addr, raw, content)| {
            (
                *addr,
                raw.clone(),
                content.iter().map(SerializableTextContent::from).collect(),
            )
        })
        .collect();

    serializable_data.serialize(serializer)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::attach::spin_buffer;
    use crate::consts::{PAGE_SIZE, SPIN_TRAP_OFFSET};

    #[test]
    fn test_spin_buffer_loops_on_cpuid() {
        let buffer = spin_buffer();
        assert_eq!(buffer.len() as u64, PAGE_SIZE);

        let base = 0x7ff6_0000_0000u64;
        let tail = &buffer[(PAGE_SIZE - 12) as usize..];
        let listing = Disassembly::disassemble(tail, Addr::from(base + PAGE_SIZE - 12), 64);
        let last_two: Vec<_> = listing.inner().iter().rev().take(2).collect();

        let jmp = decode_one(&last_two[0].1, last_two[0].0.u64(), 64).unwrap();
        assert_eq!(jmp.flow_control(), FlowControl::UnconditionalBranch);
        let target = jmp.near_branch_target();
        assert!(target >= base && target < base + SPIN_TRAP_OFFSET);
        assert_eq!(buffer[(target - base) as usize], crate::consts::NOP);

        let cpuid = decode_one(&last_two[1].1, last_two[1].0.u64(), 64).unwrap();
        assert_eq!(cpuid.code(), Code::Cpuid);
        assert_eq!(cpuid.ip(), base + SPIN_TRAP_OFFSET);
    }

    #[test]
    fn test_call_length() {
        // call rel32
        assert_eq!(call_length(&[0xe8, 0, 0, 0, 0], 0x1000, 64), Some(5));
        // call rax
        assert_eq!(call_length(&[0xff, 0xd0], 0x1000, 64), Some(2));
        // ret
        assert_eq!(call_length(&[0xc3], 0x1000, 64), None);
        // call dword [eax] in 32-bit code
        assert_eq!(call_length(&[0xff, 0x10], 0x1000, 32), Some(2));
    }

    #[test]
    fn test_syscall_kind() {
        assert_eq!(syscall_kind(&[0x0f, 0x05]), Some(SyscallKind::Syscall));
        assert_eq!(syscall_kind(&[0x48, 0x0f, 0x07]), Some(SyscallKind::Sysret));
        assert_eq!(syscall_kind(&[0x0f, 0x07]), Some(SyscallKind::Sysret));
        assert_eq!(syscall_kind(&[0x0f, 0x0b]), None);
        assert_eq!(syscall_kind(&[]), None);
    }

    #[test]
    fn test_listing_format() {
        let code = [0x48, 0x83, 0xec, 0x08, 0xc3];
        let listing = Disassembly::disassemble(&code, Addr::from(0x1000u64), 64);
        assert_eq!(listing.len(), 2);
        let text = listing.to_string();
        assert!(text.contains("sub"));
        assert!(text.contains("ret"));
        assert_eq!(
            format_instruction(&decode_one(&[0x0f, 0xa2], 0, 64).unwrap()),
            "cpuid"
        );
    }
}
