use std::{collections::HashMap, path::Path};

use object::{Object, ObjectSection, ObjectSymbol};
use snafu::{ResultExt, Snafu};

use crate::{
    hook::{sort_fixups, Fixup, Patch, NO_BSS},
    hook_collector::HookCollection,
    target::CodeTarget,
    util::io::{self, FileError},
};

#[derive(Debug, Snafu)]
pub enum ElfResolveError {
    #[snafu(transparent)]
    File { source: FileError },
    #[snafu(display("failed to parse linked elf '{path}': {source}"))]
    Parse { path: String, source: object::Error },
}

/// Splits `.over.<target>.<hexaddr>` the same way the hook collector does.
fn parse_over_name(name: &str) -> Option<(CodeTarget, u32)> {
    let rest = name.strip_prefix(".over.")?;
    let dot = rest.rfind('.')?;
    let (target_str, addr_str) = rest.split_at(dot);
    let addr_str = addr_str.trim_start_matches('.');
    let target: CodeTarget = target_str.parse().ok()?;
    let address = u32::from_str_radix(addr_str, 16).ok()?;
    Some((target, address))
}

fn parse_text_bss_name(name: &str) -> Option<(bool, CodeTarget)> {
    if let Some(rest) = name.strip_prefix(".text.") {
        return rest.parse().ok().map(|t| (true, t));
    }
    if let Some(rest) = name.strip_prefix(".bss.") {
        return rest.parse().ok().map(|t| (false, t));
    }
    None
}

/// Parses one linked ELF (`arm9.elf` or `arm7.elf`), extracting each code
/// target's placement/size as a `Patch` and resolving the hooks collected
/// during compilation against the linker's final symbol addresses. Returns
/// the fixups for this processor only, already sorted per [`sort_fixups`].
pub fn parse_linked_elf(path: &Path, hooks: &mut HookCollection) -> Result<Vec<Fixup>, ElfResolveError> {
    let bytes = io::read_file(path)?;
    let file = object::File::parse(bytes.as_slice()).context(ParseSnafu { path: path.to_string_lossy() })?;

    let mut patches: HashMap<CodeTarget, Patch> = HashMap::new();
    let mut over_patches: Vec<Patch> = Vec::new();

    for section in file.sections() {
        let Ok(name) = section.name() else { continue };

        if let Some((target, address)) = parse_over_name(name) {
            over_patches.push(Patch {
                target,
                ram_address: address,
                elf_offset: section.file_range().map(|(off, _)| off).unwrap_or(0),
                bin_size: section.size() as u32,
                bss_size: NO_BSS,
                bss_align: NO_BSS,
            });
            continue;
        }

        let Some((is_text, target)) = parse_text_bss_name(name) else { continue };
        let entry = patches.entry(target).or_insert_with(|| Patch {
            target,
            ram_address: 0,
            elf_offset: 0,
            bin_size: 0,
            bss_size: 0,
            bss_align: 4,
        });
        if is_text {
            entry.ram_address = section.address() as u32;
            entry.elf_offset = section.file_range().map(|(off, _)| off).unwrap_or(0);
            entry.bin_size = section.size() as u32;
        } else {
            entry.bss_size = section.size() as u32;
            entry.bss_align = section.align().max(1) as u32;
        }
    }

    for symbol in file.symbols() {
        let Ok(name) = symbol.name() else { continue };
        if let Some(hook) = hooks.hooks_by_symbol.get_mut(name) {
            if !hook.is_resolved() {
                hook.func_address = symbol.address() as u32;
            }
        }
    }

    let mut fixups: Vec<Fixup> = patches.into_values().map(Fixup::Patch).collect();
    fixups.extend(over_patches.into_iter().map(Fixup::Patch));

    let arm9_elf = path.file_stem().and_then(|s| s.to_str()) == Some("arm9");
    for hook in hooks.hooks_by_symbol.values() {
        if hook.target.is_arm9() == arm9_elf && hook.kind != crate::hook::HookKind::Replace {
            fixups.push(Fixup::Hook(*hook));
        }
    }

    sort_fixups(&mut fixups);
    Ok(fixups)
}
