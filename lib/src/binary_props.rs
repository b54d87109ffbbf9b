use byteorder::{ByteOrder, LE};
use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum BinaryPropertiesError {
    #[snafu(display("could not find module params signature in binary"))]
    SignatureNotFound,
}

/// Decoded `crt0` module-params descriptor: autoload-list bounds and the
/// compressed-end marker, all translated from RAM addresses to in-file
/// offsets relative to the binary's load address.
#[derive(Debug, Clone, Copy)]
pub struct ArmBinaryProperties {
    pub load_offset: u32,
    pub module_params_offset: usize,
    pub autoload_start_offset: usize,
    pub autoload_end_offset: usize,
    pub autoload_read_offset: u32,
    pub compressed_end_offset: usize,
}

const ARM9_ENTRY_SCAN_LEN: usize = 0x400;
const ARM7_ENTRY_SCAN_LEN: usize = 0x1A0;

fn word_at(data: &[u8], offset: usize) -> Option<u32> {
    data.get(offset..offset + 4).map(LE::read_u32)
}

/// Locates `moduleParams` in an ARM9 binary by scanning for the literal
/// 8-byte signature `[0xDEC00621, 0x2106C0DE]`; `moduleParams` starts 0x1C
/// bytes before the signature.
fn find_arm9_module_params(data: &[u8], entry_offset: usize) -> Option<usize> {
    let end = (entry_offset + ARM9_ENTRY_SCAN_LEN).min(data.len().saturating_sub(4));
    let mut offset = entry_offset;
    while offset + 8 <= end + 4 && offset + 8 <= data.len() {
        if word_at(data, offset) == Some(0xDEC0_0621) && word_at(data, offset + 4) == Some(0x2106_C0DE) {
            return offset.checked_sub(0x1C);
        }
        offset += 4;
    }
    None
}

/// Locates `moduleParams` in an ARM7 binary by scanning for the triple
/// `[0xE5901000, 0xE5902004, 0xE5903008]`, preceded by a PC-relative load
/// `0xE59F0000 | imm12` whose target holds the `moduleParams` address.
fn find_arm7_module_params(data: &[u8], entry_offset: usize) -> Option<usize> {
    let end = (entry_offset + ARM7_ENTRY_SCAN_LEN).min(data.len().saturating_sub(4));
    let mut offset = entry_offset;
    while offset + 16 <= end + 4 && offset + 16 <= data.len() {
        if word_at(data, offset) == Some(0xE590_1000)
            && word_at(data, offset + 4) == Some(0xE590_2004)
            && word_at(data, offset + 8) == Some(0xE590_3008)
        {
            let load_instr_offset = offset.checked_sub(4)?;
            let load_instr = word_at(data, load_instr_offset)?;
            if load_instr & 0xFFFF_F000 != 0xE59F_0000 {
                return None;
            }
            let imm12 = load_instr & 0xFFF;
            // PC-relative load: target = (instruction address + 8) + imm12.
            let literal_offset = load_instr_offset + 8 + imm12 as usize;
            let module_params_ram = word_at(data, literal_offset)?;
            return Some(module_params_ram as usize);
        }
        offset += 4;
    }
    None
}

/// Loads the ARM binary properties from a raw (decompressed) binary buffer.
/// `load_offset` is the RAM address the binary is loaded at; `entry_offset`
/// is the in-file offset of the entrypoint (for ARM9, typically 0).
pub fn load_arm_binary_properties(
    data: &[u8],
    load_offset: u32,
    entry_offset: usize,
    is_arm9: bool,
) -> Result<ArmBinaryProperties, BinaryPropertiesError> {
    let module_params_offset = if is_arm9 {
        find_arm9_module_params(data, entry_offset).ok_or(SignatureNotFoundSnafu.build())?
    } else {
        let module_params_ram = find_arm7_module_params(data, entry_offset).ok_or(SignatureNotFoundSnafu.build())?;
        (module_params_ram as u32).wrapping_sub(load_offset) as usize
    };

    let autoload_start_ram = word_at(data, module_params_offset).ok_or(SignatureNotFoundSnafu.build())?;
    let autoload_end_ram = word_at(data, module_params_offset + 4).ok_or(SignatureNotFoundSnafu.build())?;
    let autoload_read_ram = word_at(data, module_params_offset + 8).ok_or(SignatureNotFoundSnafu.build())?;
    let compressed_end_ram = word_at(data, module_params_offset + 0x14).unwrap_or(0);

    Ok(ArmBinaryProperties {
        load_offset,
        module_params_offset,
        autoload_start_offset: autoload_start_ram.wrapping_sub(load_offset) as usize,
        autoload_end_offset: autoload_end_ram.wrapping_sub(load_offset) as usize,
        autoload_read_offset: autoload_read_ram.wrapping_sub(load_offset),
        compressed_end_offset: if compressed_end_ram == 0 { 0 } else { compressed_end_ram.wrapping_sub(load_offset) as usize },
    })
}

/// One descriptor row from the autoload list: the RAM range `[ram_start,
/// ram_start + code_size)` that the module occupies once loaded, and the
/// bss_size trailing it (not part of the written range). Matches the 12-byte
/// `(ramStart, codeSize, bssSize)` triples between `autoload_start_offset`
/// and `autoload_end_offset`.
#[derive(Debug, Clone, Copy)]
pub struct AutoloadEntry {
    pub ram_start: u32,
    pub code_size: u32,
    pub bss_size: u32,
}

/// Reads every autoload descriptor row, exactly as `addBinarySections` walks
/// the table in the original source: `(autoload_end_offset -
/// autoload_start_offset) / 12` rows starting at `autoload_start_offset`.
pub fn read_autoload_entries(data: &[u8], props: &ArmBinaryProperties) -> Vec<AutoloadEntry> {
    let span = props.autoload_end_offset.saturating_sub(props.autoload_start_offset);
    let count = span / 12;
    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let base = props.autoload_start_offset + i * 12;
        let (Some(ram_start), Some(code_size), Some(bss_size)) = (word_at(data, base), word_at(data, base + 4), word_at(data, base + 8)) else {
            break;
        };
        entries.push(AutoloadEntry { ram_start, code_size, bss_size });
    }
    entries
}
