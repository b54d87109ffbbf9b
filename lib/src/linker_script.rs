use std::{collections::BTreeMap, fmt::Write as _, path::Path};

use snafu::Snafu;

use crate::{
    hook::{Hook, HookKind},
    scheduler::CompileCommand,
    target::CodeTarget,
    util::io::{self, FileError},
};

#[derive(Debug, Snafu)]
pub enum LinkerScriptError {
    #[snafu(transparent)]
    File { source: FileError },
}

/// Region bounds for one processor's patch window, taken from `patch.arm9`/
/// `patch.arm7` in the config.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub start: u32,
    pub end: u32,
}

/// Emits a linker script placing every object's code/bss into a section
/// named after its code target, plus one dedicated section per `Replace`
/// hook at its literal address. Returns `None` if there are no objects for
/// this processor (the script is skipped entirely).
pub fn generate_linker_script(
    object_dir: &Path,
    commands: &[CompileCommand],
    region: MemoryRegion,
    symbols_script: Option<&Path>,
    safe_reserve: &BTreeMap<CodeTarget, usize>,
    replace_hooks: &[Hook],
) -> Option<String> {
    if commands.is_empty() {
        return None;
    }

    let mut script = String::new();

    if let Some(symbols) = symbols_script {
        let _ = writeln!(script, "INCLUDE \"{}\"", symbols.display());
    }

    let _ = writeln!(script, "SEARCH_DIR(\"{}\")", object_dir.display());
    let _ = write!(script, "INPUT(");
    for (i, command) in commands.iter().enumerate() {
        if i > 0 {
            let _ = write!(script, " ");
        }
        let rel = command.object.strip_prefix(object_dir).unwrap_or(&command.object);
        let _ = write!(script, "\"{}\"", rel.display());
    }
    let _ = writeln!(script, ")");

    let _ = writeln!(script, "MEMORY\n{{");
    let _ = writeln!(script, "    ldpatch : ORIGIN = 0, LENGTH = 1000000");
    let _ = writeln!(script, "    target  : ORIGIN = 0x{:08x}, LENGTH = 0x{:08x}", region.start, region.end - region.start);
    let _ = writeln!(script, "}}");

    let mut targets: BTreeMap<CodeTarget, Vec<&Path>> = BTreeMap::new();
    for command in commands {
        let rel = command.object.strip_prefix(object_dir).unwrap_or(&command.object);
        targets.entry(command.target).or_default().push(rel);
    }

    let _ = writeln!(script, "SECTIONS\n{{");
    for (target, objects) in &targets {
        let reserve = safe_reserve.get(target).copied().unwrap_or(0);
        let _ = writeln!(script, "    .text.{target} : {{");
        if reserve > 0 {
            let _ = writeln!(script, "        . += {reserve};");
        }
        for obj in objects {
            let _ = writeln!(
                script,
                "        \"{p}\"(.safe.{target}.* .hook.{target}.* .rlnk.{target}.* .text .text.* .rodata .rodata.* .init_array .data)",
                p = obj.display()
            );
        }
        let _ = writeln!(script, "    }} >target AT>ldpatch");

        let _ = writeln!(script, "    .bss.{target} : {{");
        for obj in objects {
            let _ = writeln!(script, "        \"{p}\"(.bss .bss.*)", p = obj.display());
        }
        let _ = writeln!(script, "    }} >target AT>ldpatch");
    }

    for hook in replace_hooks {
        if hook.kind != HookKind::Replace {
            continue;
        }
        let _ = writeln!(
            script,
            "    .over.{target}.{addr:08x} 0x{addr:08x} : SUBALIGN(1) {{ *(.over.{target}.{addr:08x}) }}",
            target = hook.target,
            addr = hook.hook_address & !1,
        );
    }

    let _ = writeln!(script, "    /DISCARD/ : {{ *(.*) }}");
    let _ = writeln!(script, "}}");

    Some(script)
}

pub fn write_linker_script(path: &Path, script: &str) -> Result<(), LinkerScriptError> {
    io::write_file(path, script.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_empty_commands_skips_script() {
        let region = MemoryRegion { start: 0x0200_0000, end: 0x0230_0000 };
        let script = generate_linker_script(Path::new("build/object"), &[], region, None, &BTreeMap::new(), &[]);
        assert!(script.is_none());
    }

    #[test]
    fn test_script_contains_sections_per_target() {
        let region = MemoryRegion { start: 0x0200_0000, end: 0x0230_0000 };
        let commands = vec![CompileCommand {
            target: CodeTarget::Arm9,
            source: PathBuf::from("source/a.cpp"),
            object: PathBuf::from("build/object/arm9/a.o"),
            dep_file: PathBuf::from("build/deps/arm9/a.d"),
            args: vec![],
        }];
        let script = generate_linker_script(Path::new("build/object"), &commands, region, None, &BTreeMap::new(), &[]).unwrap();
        assert!(script.contains(".text.arm9"));
        assert!(script.contains(".bss.arm9"));
        assert!(script.contains("MEMORY"));
        assert!(script.contains("/DISCARD/"));
    }

    #[test]
    fn test_safe_reserve_emitted() {
        let region = MemoryRegion { start: 0x0200_0000, end: 0x0230_0000 };
        let commands = vec![CompileCommand {
            target: CodeTarget::Arm9,
            source: PathBuf::from("source/a.cpp"),
            object: PathBuf::from("build/object/arm9/a.o"),
            dep_file: PathBuf::from("build/deps/arm9/a.d"),
            args: vec![],
        }];
        let mut reserve = BTreeMap::new();
        reserve.insert(CodeTarget::Arm9, 40);
        let script = generate_linker_script(Path::new("build/object"), &commands, region, None, &reserve, &[]).unwrap();
        assert!(script.contains(". += 40;"));
    }
}
