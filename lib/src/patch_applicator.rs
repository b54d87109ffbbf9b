//! Applies ordered [`Fixup`]s to loaded ARM binaries and overlays: the heart
//! of the engine. See the module-level invariants in the data model for the
//! autoload-splice and heap-relocation contract.

use snafu::Snafu;

use crate::{
    binary_props::{self, load_arm_binary_properties, ArmBinaryProperties, BinaryPropertiesError},
    hook::{Fixup, Hook, HookKind, Patch},
    opcode::{self, LinkEncoding, OpcodeError},
    overlay::OverlayEntry,
    safe_hook,
    section_map::{SectionData, SectionMap},
    target::CodeTarget,
};

#[derive(Debug, Snafu)]
pub enum PatchError {
    #[snafu(transparent)]
    BinaryProperties { source: BinaryPropertiesError },
    #[snafu(transparent)]
    Opcode { source: OpcodeError },
    #[snafu(display("ARM7 overlay autoload extension is not supported"))]
    Arm7OverlayAutoloadUnsupported,
    #[snafu(display("no code/data source provided for an ELF offset in target {target}"))]
    MissingElfData { target: CodeTarget },
}

/// Rounds `size` up to the next multiple of `align` — 0 when already aligned.
/// See the resolved discrepancy in DESIGN.md: the worked example in the
/// testable-properties section requires this convention, not the literal
/// non-modulo'd arithmetic of the original source.
pub fn pad_to(align: u32, size: u32) -> u32 {
    if align == 0 {
        return 0;
    }
    (align - size % align) % align
}

/// Supplies the bytes referenced by a Patch's ELF offset (the linked ELF's
/// file contents) and the function performing an autoload splice's heap
/// relocation write target.
pub trait ElfData {
    fn bytes_at(&self, target: CodeTarget, elf_offset: u64, len: u32) -> Option<Vec<u8>>;
}

/// One main binary or overlay currently loaded for patching.
struct LoadedTarget {
    target: CodeTarget,
    buffer: Vec<u8>,
    load_offset: u32,
    section_map: SectionMap,
    arm_props: Option<ArmBinaryProperties>,
    overlay_entry: Option<OverlayEntry>,
    patch_start: Option<u32>,
    safe_patch: Vec<u8>,
}

impl LoadedTarget {
    fn new_binary(target: CodeTarget, buffer: Vec<u8>, load_offset: u32) -> Result<Self, PatchError> {
        let props = load_arm_binary_properties(&buffer, load_offset, 0, target.is_arm9())?;
        let mut section_map = SectionMap::new();
        // Head region plus one entry per existing autoload row, mirroring
        // addBinarySections: the buffer is not one contiguous RAM range once
        // autoload modules have already been split out of it.
        section_map.add(SectionData { start: load_offset, end: load_offset + props.autoload_read_offset, dest: 0 });
        let mut read_ptr = props.autoload_read_offset as usize;
        for entry in binary_props::read_autoload_entries(&buffer, &props) {
            section_map.add(SectionData { start: entry.ram_start, end: entry.ram_start + entry.code_size, dest: read_ptr });
            read_ptr += entry.code_size as usize;
        }
        Ok(Self {
            target,
            buffer,
            load_offset,
            section_map,
            arm_props: Some(props),
            overlay_entry: None,
            patch_start: None,
            safe_patch: Vec::new(),
        })
    }

    fn new_overlay(target: CodeTarget, buffer: Vec<u8>, entry: OverlayEntry) -> Self {
        let mut section_map = SectionMap::new();
        section_map.add(SectionData { start: entry.ram_start, end: entry.ram_start + entry.ram_size, dest: 0 });
        Self {
            target,
            buffer,
            load_offset: entry.ram_start,
            section_map,
            arm_props: None,
            overlay_entry: Some(entry),
            patch_start: None,
            safe_patch: Vec::new(),
        }
    }
}

pub struct PatchApplicator<'a> {
    elf_data: &'a dyn ElfData,
    armv5te_arm9: bool,
    armv5te_arm7: bool,
    heap_region_start: std::collections::HashMap<bool, u32>,
}

impl<'a> PatchApplicator<'a> {
    pub fn new(elf_data: &'a dyn ElfData, armv5te_arm9: bool, armv5te_arm7: bool) -> Self {
        Self { elf_data, armv5te_arm9, armv5te_arm7, heap_region_start: std::collections::HashMap::new() }
    }

    pub fn set_heap_region_start(&mut self, is_arm9: bool, region_start: u32) {
        self.heap_region_start.insert(is_arm9, region_start);
    }

    fn armv5te_for(&self, target: CodeTarget) -> bool {
        if target.is_arm9() { self.armv5te_arm9 } else { self.armv5te_arm7 }
    }

    /// Finds `patch_start` for a target's run of fixups: the RAM address of
    /// the first non-replace Patch for this target, if any.
    fn find_patch_start(fixups: &[Fixup], target: CodeTarget) -> Option<u32> {
        fixups.iter().find_map(|f| match f {
            Fixup::Patch(p) if p.target == target && !p.is_replace() => Some(p.ram_address),
            _ => None,
        })
    }

    fn apply_replace(&self, loaded: &mut LoadedTarget, patch: &Patch) -> Result<(), PatchError> {
        let bytes = self
            .elf_data
            .bytes_at(patch.target, patch.elf_offset, patch.bin_size)
            .ok_or_else(|| MissingElfDataSnafu { target: patch.target }.build())?;
        loaded.section_map.write(&mut loaded.buffer, patch.ram_address, &bytes);
        Ok(())
    }

    /// Splices an autoload-extension patch into a main binary: grows the
    /// buffer, relocates the autoload list, relocates the heap pointer, and
    /// prepends the accumulated safe-hook veneer bytes to the payload.
    fn apply_autoload_extension(&mut self, loaded: &mut LoadedTarget, patch: &Patch, reloc_address: Option<u32>) -> Result<(), PatchError> {
        if loaded.target.is_overlay() {
            return Arm7OverlayAutoloadUnsupportedSnafu.fail();
        }
        let props = loaded.arm_props.expect("main binaries always have ArmBinaryProperties");

        let mut payload = self
            .elf_data
            .bytes_at(patch.target, patch.elf_offset, patch.bin_size)
            .ok_or_else(|| MissingElfDataSnafu { target: patch.target }.build())?;
        let safe_len = loaded.safe_patch.len().min(payload.len());
        payload[..safe_len].copy_from_slice(&loaded.safe_patch[..safe_len]);

        if let Some(reloc) = reloc_address {
            let region_start = *self.heap_region_start.get(&loaded.target.is_arm9()).unwrap_or(&0);
            let heap_reloc = region_start.wrapping_add(patch.bin_size).wrapping_add(pad_to(patch.bss_align, patch.bin_size)).wrapping_add(patch.bss_size);
            loaded.section_map.write_word(&mut loaded.buffer, reloc, heap_reloc);
        }

        let patch_size = patch.bin_size as usize + 12;
        let old_len = loaded.buffer.len();
        loaded.buffer.resize(old_len + patch_size, 0);

        let autoload_start = props.autoload_start_offset;
        let autoload_end = props.autoload_end_offset;
        let autoload_read = props.autoload_read_offset as usize;

        loaded.buffer.copy_within(autoload_start..old_len, autoload_start + patch_size);
        loaded.buffer.copy_within(autoload_read..autoload_start, autoload_read + patch.bin_size as usize);
        loaded.buffer[autoload_read..autoload_read + payload.len()].copy_from_slice(&payload);

        let new_entry_offset = autoload_start + patch.bin_size as usize;
        let new_entry = [patch.ram_address, patch.bin_size, patch.bss_size];
        for (i, word) in new_entry.iter().enumerate() {
            let at = new_entry_offset + i * 4;
            loaded.buffer[at..at + 4].copy_from_slice(&word.to_le_bytes());
        }

        let new_autoload_start_ram = loaded.load_offset + autoload_start as u32 + patch.bin_size;
        let new_autoload_end_ram = loaded.load_offset + autoload_end as u32 + patch_size as u32;
        loaded.buffer[props.module_params_offset..props.module_params_offset + 4].copy_from_slice(&new_autoload_start_ram.to_le_bytes());
        loaded.buffer[props.module_params_offset + 4..props.module_params_offset + 8].copy_from_slice(&new_autoload_end_ram.to_le_bytes());

        Ok(())
    }

    fn apply_hook(&mut self, loaded: &mut LoadedTarget, hook: &Hook) -> Result<(), PatchError> {
        if !hook.is_resolved() {
            log::warn!("hook at 0x{:08x} in {} has no resolved function address, skipping", hook.hook_address, hook.target);
            return Ok(());
        }
        let armv5te = self.armv5te_for(hook.target);
        match hook.kind {
            HookKind::Hook => {
                let word = opcode::encode_hook_branch(hook.hook_address, hook.func_address)?;
                loaded.section_map.write_word(&mut loaded.buffer, hook.hook_address & !1, word);
            }
            HookKind::Link => match opcode::encode_link(hook.hook_address, hook.func_address, armv5te)? {
                LinkEncoding::Arm(word) => {
                    loaded.section_map.write_word(&mut loaded.buffer, hook.hook_address & !1, word);
                }
                LinkEncoding::Thumb([hi, lo]) => {
                    let base = hook.hook_address & !1;
                    loaded.section_map.write_halfword(&mut loaded.buffer, base, hi);
                    loaded.section_map.write_halfword(&mut loaded.buffer, base + 2, lo);
                }
            },
            HookKind::Safe => {
                let veneer_address = loaded.patch_start.unwrap_or(hook.hook_address) + loaded.safe_patch.len() as u32;
                let original = loaded.section_map.read_word(&loaded.buffer, hook.hook_address & !1).unwrap_or(0);
                if let Some(reason) = safe_hook::check_safe_instruction(original) {
                    log::warn!("relocating unsafe instruction at 0x{:08x}: {reason}", hook.hook_address);
                }
                let (veneer, hook_branch) =
                    opcode::encode_safe_veneer(hook.hook_address, hook.func_address, veneer_address, original, armv5te)?;
                loaded.safe_patch.extend_from_slice(&veneer.original_instruction.to_le_bytes());
                loaded.safe_patch.extend_from_slice(&veneer.push.to_le_bytes());
                loaded.safe_patch.extend_from_slice(&veneer.call.to_le_bytes());
                loaded.safe_patch.extend_from_slice(&veneer.pop.to_le_bytes());
                loaded.safe_patch.extend_from_slice(&veneer.branch_back.to_le_bytes());
                loaded.section_map.write_word(&mut loaded.buffer, hook.hook_address & !1, hook_branch);
            }
            HookKind::Replace => {
                log::warn!("Replace hook at 0x{:08x} reached the patch applicator; it should have become a Patch", hook.hook_address);
            }
        }
        Ok(())
    }

    /// Applies every fixup for one target's run. `load` supplies the
    /// starting buffer (and, for overlays, its table entry); `reloc_address`
    /// is the config's `patch.arm{7,9}.reloc` for main binaries.
    pub fn apply_target_run(
        &mut self,
        fixups: &[Fixup],
        target: CodeTarget,
        mut loaded: impl FnMut() -> LoadedTargetSeed,
        reloc_address: Option<u32>,
    ) -> Result<(Vec<u8>, Option<OverlayEntry>), PatchError> {
        let seed = loaded();
        let mut loaded_target = match seed {
            LoadedTargetSeed::Binary { buffer, load_offset } => LoadedTarget::new_binary(target, buffer, load_offset)?,
            LoadedTargetSeed::Overlay { buffer, entry } => LoadedTarget::new_overlay(target, buffer, entry),
        };
        loaded_target.patch_start = Self::find_patch_start(fixups, target);

        for fixup in fixups {
            if fixup.target() != target {
                continue;
            }
            match fixup {
                Fixup::Patch(patch) if patch.is_replace() => self.apply_replace(&mut loaded_target, patch)?,
                Fixup::Patch(patch) => self.apply_autoload_extension(&mut loaded_target, patch, reloc_address)?,
                Fixup::Hook(hook) => self.apply_hook(&mut loaded_target, hook)?,
            }
        }

        Ok((loaded_target.buffer, loaded_target.overlay_entry))
    }
}

pub enum LoadedTargetSeed {
    Binary { buffer: Vec<u8>, load_offset: u32 },
    Overlay { buffer: Vec<u8>, entry: OverlayEntry },
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{ByteOrder, LE};

    struct FakeElfData(Vec<u8>);
    impl ElfData for FakeElfData {
        fn bytes_at(&self, _target: CodeTarget, offset: u64, len: u32) -> Option<Vec<u8>> {
            let start = offset as usize;
            self.0.get(start..start + len as usize).map(|s| s.to_vec())
        }
    }

    // Invariant 6 / S4 worked example.
    #[test]
    fn test_pad_to_aligned_is_zero() {
        assert_eq!(pad_to(4, 0x400), 0);
    }

    #[test]
    fn test_pad_to_unaligned() {
        assert_eq!(pad_to(4, 0x401), 3);
    }

    fn arm9_fixture(size: usize) -> Vec<u8> {
        let mut data = vec![0u8; size];
        LE::write_u32(&mut data[0x40..0x44], 0x0200_1000); // autoload start
        LE::write_u32(&mut data[0x44..0x48], 0x0200_1000 + 0xC); // autoload end (one 12-byte entry)
        LE::write_u32(&mut data[0x48..0x4C], 0x0200_0F00); // autoload read
        LE::write_u32(&mut data[0x1000..0x1004], 0x0230_0000); // entry ram_start
        LE::write_u32(&mut data[0x1004..0x1008], 0x1000); // entry code_size
        LE::write_u32(&mut data[0x1008..0x100C], 0x100); // entry bss_size
        LE::write_u32(&mut data[0x5C..0x60], 0xDEC0_0621);
        LE::write_u32(&mut data[0x60..0x64], 0x2106_C0DE);
        data
    }

    #[test]
    fn test_s4_autoload_extension_grows_buffer_and_relocates_heap() {
        let elf_bytes = vec![0xAB; 0x400];
        let elf_data = FakeElfData(elf_bytes);

        let buffer = arm9_fixture(0x10000);
        let load_offset = 0x0200_0000;
        let mut applicator = PatchApplicator::new(&elf_data, true, true);
        applicator.set_heap_region_start(true, 0x0210_0000);

        let patch =
            Patch { target: CodeTarget::Arm9, ram_address: 0x0220_0000, elf_offset: 0, bin_size: 0x400, bss_size: 0x80, bss_align: 4 };
        let fixups = vec![Fixup::Patch(patch.clone())];

        let (new_buffer, _) = applicator
            .apply_target_run(&fixups, CodeTarget::Arm9, || LoadedTargetSeed::Binary { buffer: buffer.clone(), load_offset }, Some(0x0200_0010))
            .unwrap();

        assert_eq!(new_buffer.len(), buffer.len() + 0x400 + 12);

        let new_entry_offset = 0x1000 + 0x400;
        assert_eq!(LE::read_u32(&new_buffer[new_entry_offset..new_entry_offset + 4]), 0x0220_0000);
        assert_eq!(LE::read_u32(&new_buffer[new_entry_offset + 4..new_entry_offset + 8]), 0x400);
        assert_eq!(LE::read_u32(&new_buffer[new_entry_offset + 8..new_entry_offset + 12]), 0x80);
    }

    #[test]
    fn test_new_binary_seeds_one_section_per_autoload_row() {
        let elf_bytes = vec![0u8; 4];
        let elf_data = FakeElfData(elf_bytes);
        let buffer = arm9_fixture(0x10000);
        let load_offset = 0x0200_0000;
        let mut applicator = PatchApplicator::new(&elf_data, true, true);

        // A hook inside the existing autoload entry (ram 0x0230_0000..0x0230_1000,
        // backed by file bytes starting at autoload_read = 0xF00) must translate
        // through that entry's section, not the contiguous-buffer assumption.
        let hook = Hook { target: CodeTarget::Arm9, hook_address: 0x0230_0010, func_address: 0x0230_0100, kind: HookKind::Hook };
        let fixups = vec![Fixup::Hook(hook)];

        let (new_buffer, _) =
            applicator.apply_target_run(&fixups, CodeTarget::Arm9, || LoadedTargetSeed::Binary { buffer: buffer.clone(), load_offset }, None).unwrap();

        let expected_offset = 0xF00 + 0x10;
        assert_ne!(LE::read_u32(&new_buffer[expected_offset..expected_offset + 4]), 0);
    }

    #[test]
    fn test_replace_patch_writes_verbatim_bytes() {
        let elf_bytes = vec![0x11, 0x22, 0x33, 0x44];
        let elf_data = FakeElfData(elf_bytes);
        let mut applicator = PatchApplicator::new(&elf_data, true, true);

        let entry = OverlayEntry {
            overlay_id: 3,
            ram_start: 0x021F_0000,
            ram_size: 0x1000,
            bss_size: 0,
            static_init_start: 0,
            static_init_end: 0,
            file_id: 0,
            flags: 0,
        };
        let buffer = vec![0u8; 0x1000];
        let patch = Patch { target: CodeTarget::Overlay9(3), ram_address: 0x021F_0040, elf_offset: 0, bin_size: 4, bss_size: crate::hook::NO_BSS, bss_align: 0 };
        let fixups = vec![Fixup::Patch(patch)];

        let (new_buffer, _) = applicator
            .apply_target_run(&fixups, CodeTarget::Overlay9(3), || LoadedTargetSeed::Overlay { buffer: buffer.clone(), entry }, None)
            .unwrap();

        assert_eq!(&new_buffer[0x40..0x44], &[0x11, 0x22, 0x33, 0x44]);
    }
}
