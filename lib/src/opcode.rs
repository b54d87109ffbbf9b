//! ARM/Thumb opcode synthesis for hook branches and safe-hook veneers.
//! All offsets follow ARM's PC-ahead-by-8 (ARM mode) / PC-ahead-by-4 (Thumb
//! mode) semantics.

use snafu::Snafu;

const COND_AL: u32 = 0xE000_0000;
const ARM_B: u32 = 0x0A00_0000;
const ARM_BL: u32 = 0x0B00_0000;
const ARM_BLX: u32 = 0x0A00_0000 | 0x0100_0000; // BLX(imm), fixed condition field overridden by caller
const ARM_PUSH_SAVE_ALL: u32 = 0xE92D_D5FF; // PUSH {r0-r8,r10-r12,lr} minus r9/sp/pc per veneer convention
const ARM_POP_RESTORE_ALL: u32 = 0xE8BD_D5FF;

const THUMB_BL0: u16 = 0xF000;
const THUMB_BL1: u16 = 0xF800;
const THUMB_BLX1: u16 = 0xE800;

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum OpcodeError {
    #[snafu(display("cannot synthesize a plain branch across an ARM/Thumb mode boundary"))]
    ModeBoundary,
    #[snafu(display("BLX across mode boundary requires ARMv5TE, target is ARMv4T"))]
    BlxUnsupportedOnArmv4t,
    #[snafu(display("safe hooks require an ARM-mode hook address"))]
    SafeHookRequiresArm,
    #[snafu(display("ARM hook address must not be halfword-misaligned (addr % 4 == 2)"))]
    MisalignedArmAddress,
}

fn signed24(offset: i32) -> u32 {
    ((offset as u32) & 0x00FF_FFFF) as u32
}

/// Strips the Thumb-mode tag bit and reports whether it was set.
pub fn split_mode(address: u32) -> (u32, bool) {
    (address & !1, address & 1 != 0)
}

/// Synthesizes the word written at `hook_address` for a plain `Hook`
/// (both sides must be ARM mode — a Thumb target needs `Link` instead).
pub fn encode_hook_branch(hook_address: u32, func_address: u32) -> Result<u32, OpcodeError> {
    let (hook_addr, hook_thumb) = split_mode(hook_address);
    let (func_addr, func_thumb) = split_mode(func_address);
    if hook_thumb || func_thumb {
        return ModeBoundarySnafu.fail();
    }
    if hook_addr % 4 == 2 {
        return MisalignedArmAddressSnafu.fail();
    }
    let offset = (func_addr as i64 - hook_addr as i64 - 8) / 4;
    Ok(COND_AL | ARM_B | signed24(offset as i32))
}

/// Result of encoding a `Link` (BL/BLX) hook: one ARM word, or a pair of
/// Thumb halfwords (little-endian order as they appear in memory).
#[derive(Debug)]
pub enum LinkEncoding {
    Arm(u32),
    Thumb([u16; 2]),
}

/// Synthesizes the `rlnk` (BL/BLX) encoding for every ARM/Thumb mode
/// combination of hook site and target function.
pub fn encode_link(hook_address: u32, func_address: u32, armv5te: bool) -> Result<LinkEncoding, OpcodeError> {
    let (hook_addr, hook_thumb) = split_mode(hook_address);
    let (func_addr, func_thumb) = split_mode(func_address);

    match (hook_thumb, func_thumb) {
        (false, false) => {
            let offset = (func_addr as i64 - hook_addr as i64 - 8) / 4;
            Ok(LinkEncoding::Arm(COND_AL | ARM_BL | signed24(offset as i32)))
        }
        (false, true) => {
            if !armv5te {
                return BlxUnsupportedOnArmv4tSnafu.fail();
            }
            let h_bit = ((func_addr % 4) / 2) << 23;
            let offset = (func_addr as i64 - hook_addr as i64 - 8) / 4;
            Ok(LinkEncoding::Arm(COND_AL | ARM_BLX | h_bit as u32 | signed24(offset as i32)))
        }
        (true, false) => {
            let offset = (func_addr as i64 - hook_addr as i64 - 4) / 2;
            let hi = ((offset >> 11) & 0x7FF) as u16;
            let lo = (offset & 0x7FF) as u16;
            Ok(LinkEncoding::Thumb([THUMB_BL0 | hi, THUMB_BLX1 | lo]))
        }
        (true, true) => {
            let offset = (func_addr as i64 - hook_addr as i64 - 4) / 2;
            let hi = ((offset >> 11) & 0x7FF) as u16;
            let lo = (offset & 0x7FF) as u16;
            Ok(LinkEncoding::Thumb([THUMB_BL0 | hi, THUMB_BL1 | lo]))
        }
    }
}

/// The five ARM words written into a safe-hook veneer slot: the relocated
/// original instruction, push, call, pop, and a branch back past the hook.
pub struct SafeVeneer {
    pub original_instruction: u32,
    pub push: u32,
    pub call: u32,
    pub pop: u32,
    pub branch_back: u32,
}

/// Builds the veneer body and the branch that replaces `hook_address`.
/// `veneer_address` is where the 20-byte slot lives (`patchStart + accumulated`).
pub fn encode_safe_veneer(
    hook_address: u32,
    func_address: u32,
    veneer_address: u32,
    original_instruction: u32,
    armv5te: bool,
) -> Result<(SafeVeneer, u32), OpcodeError> {
    let (hook_addr, hook_thumb) = split_mode(hook_address);
    if hook_thumb {
        return SafeHookRequiresArmSnafu.fail();
    }
    let (func_addr, func_thumb) = split_mode(func_address);
    if func_thumb && !armv5te {
        return BlxUnsupportedOnArmv4tSnafu.fail();
    }

    // The call word is the veneer's third word (original, push, call, pop,
    // branch-back), so it sits at veneer_address + 8, not + 4.
    let call_offset = (func_addr as i64 - veneer_address as i64 - 8 - 8) / 4;
    let call = if func_thumb { COND_AL | ARM_BLX | signed24(call_offset as i32) } else { COND_AL | ARM_BL | signed24(call_offset as i32) };

    let branch_back_offset = (hook_addr as i64 + 4 - (veneer_address as i64 + 16) - 8) / 4;
    let branch_back = COND_AL | ARM_B | signed24(branch_back_offset as i32);

    let veneer = SafeVeneer { original_instruction, push: COND_AL | ARM_PUSH_SAVE_ALL, call, pop: COND_AL | ARM_POP_RESTORE_ALL, branch_back };

    let hook_branch_offset = (veneer_address as i64 - hook_addr as i64 - 8) / 4;
    let hook_branch = COND_AL | ARM_B | signed24(hook_branch_offset as i32);

    Ok((veneer, hook_branch))
}

#[cfg(test)]
mod tests {
    use super::*;

    // S1 — ARM-to-ARM branch hook. signed24((0x020A0010-0x02001000-8)/4) = 0x27C02.
    #[test]
    fn test_s1_arm_to_arm_hook() {
        let word = encode_hook_branch(0x0200_1000, 0x020A_0010).unwrap();
        assert_eq!(word, 0xEA02_7C02);
    }

    // S2 — Thumb-to-Thumb long BL.
    #[test]
    fn test_s2_thumb_to_thumb_link() {
        let encoding = encode_link(0x0200_1001, 0x020A_0009, true).unwrap();
        match encoding {
            LinkEncoding::Thumb([hi, lo]) => {
                assert_eq!(hi, 0xF009);
                assert_eq!(lo, 0xF800);
            }
            _ => panic!("expected thumb encoding"),
        }
    }

    // S3 — ARM-to-Thumb Link via BLX.
    #[test]
    fn test_s3_arm_to_thumb_blx() {
        let encoding = encode_link(0x0200_1000, 0x020A_0007, true).unwrap();
        match encoding {
            LinkEncoding::Arm(word) => {
                let offset = (0x020A_0006i64 - 0x0200_1000 - 8) / 4;
                let expected = COND_AL | ARM_BLX | (1 << 23) | signed24(offset as i32);
                assert_eq!(word, expected);
            }
            _ => panic!("expected arm encoding"),
        }
    }

    #[test]
    fn test_link_arm_to_thumb_rejected_on_armv4t() {
        let result = encode_link(0x0200_1000, 0x020A_0007, false);
        assert_eq!(result.unwrap_err(), OpcodeError::BlxUnsupportedOnArmv4t);
    }

    #[test]
    fn test_hook_across_mode_boundary_rejected() {
        let result = encode_hook_branch(0x0200_1000, 0x020A_0011);
        assert_eq!(result.unwrap_err(), OpcodeError::ModeBoundary);
    }

    #[test]
    fn test_misaligned_arm_hook_rejected() {
        let result = encode_hook_branch(0x0200_1002, 0x020A_0010);
        assert_eq!(result.unwrap_err(), OpcodeError::MisalignedArmAddress);
    }

    // S5 — full numeric safe-hook veneer. The call word sits at
    // veneer_address + 8: BL((0x02200040 - 0x02200008 - 8) / 4).
    #[test]
    fn test_s5_safe_veneer_call_offset() {
        let (veneer, hook_branch) = encode_safe_veneer(0x0200_1000, 0x0220_0040, 0x0220_0000, 0xE3A0_0001, true).unwrap();
        assert_eq!(veneer.call, 0xEB00_000C);
        assert_eq!(hook_branch, 0xEA07_FCFE);
        assert_eq!(veneer.branch_back, 0xEA08_03FB);
        assert_eq!(veneer.original_instruction, 0xE3A0_0001);
        assert_eq!(veneer.push, COND_AL | ARM_PUSH_SAVE_ALL);
        assert_eq!(veneer.pop, COND_AL | ARM_POP_RESTORE_ALL);
    }
}
