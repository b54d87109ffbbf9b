//! Top-level build orchestration: wires the dependency tracker, compile
//! scheduler, linker-script generator, hook collector, ELF resolver, and
//! patch applicator into the single `run_build` entry point the CLI calls.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    process::Command,
};

use byteorder::{ByteOrder, LE};
use snafu::Snafu;

use crate::{
    backup::{self, BackupError},
    binary_props::BinaryPropertiesError,
    blz::{self, BlzError},
    config::{self, Config, ConfigError},
    elf_resolver::{self, ElfResolveError},
    fileid::{self, FileIdError},
    hook::{Fixup, HookKind},
    hook_collector::{self, HookCollectError, HookCollection},
    linker_script::{self, LinkerScriptError, MemoryRegion},
    overlay::{self, OverlayError},
    patch_applicator::{ElfData, LoadedTargetSeed, PatchApplicator, PatchError},
    scheduler::{self, CompileCommand, SchedulerError},
    target::CodeTarget,
    tracker::{DependencyTracker, TrackerError},
    util::{
        io::{self, FileError},
        parse,
    },
};

#[derive(Debug, Snafu)]
pub enum BuildError {
    #[snafu(transparent)]
    File { source: FileError },
    #[snafu(transparent)]
    Config { source: ConfigError },
    #[snafu(transparent)]
    Tracker { source: TrackerError },
    #[snafu(transparent)]
    Backup { source: BackupError },
    #[snafu(transparent)]
    Scheduler { source: SchedulerError },
    #[snafu(transparent)]
    LinkerScript { source: LinkerScriptError },
    #[snafu(transparent)]
    HookCollect { source: HookCollectError },
    #[snafu(transparent)]
    ElfResolve { source: ElfResolveError },
    #[snafu(transparent)]
    Patch { source: PatchError },
    #[snafu(transparent)]
    BinaryProperties { source: BinaryPropertiesError },
    #[snafu(transparent)]
    Overlay { source: OverlayError },
    #[snafu(transparent)]
    Blz { source: BlzError },
    #[snafu(transparent)]
    FileId { source: FileIdError },
    #[snafu(display("invalid code target name '{name}' in config"))]
    InvalidTargetName { name: String },
    #[snafu(display("linker invocation for '{target}' failed"))]
    LinkFailed { target: String },
    #[snafu(display("command '{command}' exited with a failure status"))]
    CommandFailed { command: String },
    #[snafu(display("patch.{arch} region is required to patch {arch} but was not configured"))]
    MissingPatchRegion { arch: &'static str },
}

const ARM9_ARMV5TE: bool = true;
const ARM7_ARMV5TE: bool = false;

fn read_ram_addresses(header: &[u8]) -> (u32, u32) {
    (LE::read_u32(&header[0x28..0x2C]), LE::read_u32(&header[0x38..0x3C]))
}

fn collect_source_files(root: &Path, out: &mut Vec<PathBuf>) -> Result<(), BuildError> {
    if root.is_dir() {
        let mut entries: Vec<_> = std::fs::read_dir(root).map_err(FileError::from)?.filter_map(|e| e.ok()).map(|e| e.path()).collect();
        entries.sort();
        for entry in entries {
            collect_source_files(&entry, out)?;
        }
    } else if root.is_file() {
        out.push(root.to_path_buf());
    }
    Ok(())
}

fn object_paths(object_dir: &Path, target: CodeTarget, source: &Path) -> (PathBuf, PathBuf) {
    let stem = source.file_stem().and_then(|s| s.to_str()).unwrap_or("object");
    let sub = object_dir.join(target.to_string());
    (sub.join(format!("{stem}.o")), object_dir.join("deps").join(target.to_string()).join(format!("{stem}.d")))
}

struct FileElfData {
    arm9: Vec<u8>,
    arm7: Vec<u8>,
}

impl ElfData for FileElfData {
    fn bytes_at(&self, target: CodeTarget, elf_offset: u64, len: u32) -> Option<Vec<u8>> {
        let buffer = if target.is_arm9() { &self.arm9 } else { &self.arm7 };
        let start = elf_offset as usize;
        buffer.get(start..start + len as usize).map(|s| s.to_vec())
    }
}

fn parse_target_name(name: &str) -> Result<CodeTarget, BuildError> {
    name.parse().map_err(|_| InvalidTargetNameSnafu { name }.build())
}

/// Recursively scans `build.source` for compilable files not already claimed
/// by any explicit entry in `config.main`, mirroring `scanDefaultTarget`:
/// whatever is left over belongs to `main.default-target`.
fn scan_default_target_sources(config: &Config) -> Result<Vec<PathBuf>, BuildError> {
    let mut claimed: BTreeSet<PathBuf> = BTreeSet::new();
    for roots in config.main.values() {
        for root in roots {
            let mut sources = Vec::new();
            collect_source_files(root, &mut sources)?;
            claimed.extend(sources);
        }
    }

    let mut all_source_files = Vec::new();
    collect_source_files(&config.build.source, &mut all_source_files)?;
    Ok(all_source_files
        .into_iter()
        .filter(|p| scheduler::is_compilable_file(p) && !claimed.contains(p))
        .collect())
}

/// Gathers every compile command across `config.main` (plus the resolved
/// `default-target`, if any), deciding which need recompilation against
/// `tracker`.
fn gather_compile_commands(config: &Config, object_dir: &Path, tracker: &DependencyTracker) -> Result<(Vec<CompileCommand>, Vec<CompileCommand>), BuildError> {
    let mut all = Vec::new();
    let mut dirty = Vec::new();

    let mut target_names: Vec<&String> = config.main.keys().collect();
    target_names.sort();

    let push_source = |target: CodeTarget, source: PathBuf, all: &mut Vec<CompileCommand>, dirty: &mut Vec<CompileCommand>| -> Result<(), BuildError> {
        let (object, dep_file) = object_paths(object_dir, target, &source);
        let Some(command) = scheduler::build_compile_command(&config.build, target, source.clone(), object, dep_file) else {
            return Ok(());
        };
        if tracker.needs_compilation(&source, Some(&command.dep_file)) {
            dirty.push(command.clone());
        }
        all.push(command);
        Ok(())
    };

    for name in target_names {
        let target = parse_target_name(name)?;
        for root in &config.main[name] {
            let mut sources = Vec::new();
            collect_source_files(root, &mut sources)?;
            for source in sources {
                push_source(target, source, &mut all, &mut dirty)?;
            }
        }
    }

    if let Some(default_target_name) = &config.default_target {
        let target = parse_target_name(default_target_name)?;
        for source in scan_default_target_sources(config)? {
            push_source(target, source, &mut all, &mut dirty)?;
        }
    }

    Ok((all, dirty))
}

/// Deletes any `.o`/`.d` file under `object_dir` that isn't referenced by one
/// of `all_commands`, and prunes any directory left empty by the removals.
fn sweep_orphan_objects(object_dir: &Path, all_commands: &[CompileCommand]) -> Result<(), BuildError> {
    let expected_objects: BTreeSet<&Path> = all_commands.iter().map(|c| c.object.as_path()).collect();
    let expected_deps: BTreeSet<&Path> = all_commands.iter().map(|c| c.dep_file.as_path()).collect();

    let mut tree_files = Vec::new();
    collect_source_files(object_dir, &mut tree_files)?;

    let mut touched_dirs: BTreeSet<PathBuf> = BTreeSet::new();
    for path in tree_files {
        let is_orphan = match path.extension().and_then(|e| e.to_str()) {
            Some("o") => !expected_objects.contains(path.as_path()),
            Some("d") => !expected_deps.contains(path.as_path()),
            _ => false,
        };
        if !is_orphan {
            continue;
        }
        log::info!("removing orphaned build artifact {}", path.display());
        if let Some(parent) = path.parent() {
            touched_dirs.insert(parent.to_path_buf());
        }
        let _ = std::fs::remove_file(&path);
    }

    // Prune directories left empty, from the deepest removal site upward.
    for dir in touched_dirs {
        let mut ancestor = Some(dir);
        while let Some(dir) = ancestor {
            if dir == object_dir || !dir.starts_with(object_dir) {
                break;
            }
            match std::fs::read_dir(&dir) {
                Ok(mut entries) => {
                    if entries.next().is_none() {
                        let _ = std::fs::remove_dir(&dir);
                        ancestor = dir.parent().map(Path::to_path_buf);
                    } else {
                        break;
                    }
                }
                _ => break,
            }
        }
    }
    Ok(())
}

fn run_linker(ld: &str, script: &Path, output: &Path) -> Result<(), BuildError> {
    io::create_dir_all(output.parent().unwrap_or(Path::new(".")))?;
    let status = Command::new(ld)
        .arg("-T")
        .arg(script)
        .arg("-o")
        .arg(output)
        .status()
        .map_err(|_| LinkFailedSnafu { target: output.to_string_lossy().into_owned() }.build())?;
    if !status.success() {
        return LinkFailedSnafu { target: output.to_string_lossy().into_owned() }.fail();
    }
    Ok(())
}

fn run_hook_command(command: &str) -> Result<(), BuildError> {
    let status = if cfg!(windows) {
        Command::new("cmd").args(["/C", command]).status()
    } else {
        Command::new("sh").args(["-c", command]).status()
    };
    match status {
        Ok(s) if s.success() => Ok(()),
        _ => CommandFailedSnafu { command: command.to_string() }.fail(),
    }
}

fn parse_region(region: &Option<config::PatchRegion>, arch: &'static str) -> Result<(MemoryRegion, u32, bool), BuildError> {
    let region = region.as_ref().ok_or_else(|| MissingPatchRegionSnafu { arch }.build())?;
    let start = parse::parse_u32(&region.start).map_err(|_| MissingPatchRegionSnafu { arch }.build())?;
    let end = parse::parse_u32(&region.end).map_err(|_| MissingPatchRegionSnafu { arch }.build())?;
    let reloc = parse::parse_u32(&region.reloc).map_err(|_| MissingPatchRegionSnafu { arch }.build())?;
    Ok((MemoryRegion { start, end }, reloc, region.compress))
}

/// Runs one processor's patch step: links its ELF, resolves fixups, applies
/// them to every target it touches (the main binary plus any of its
/// overlays), and writes the patched output.
#[allow(clippy::too_many_arguments)]
fn patch_processor(
    config: &Config,
    is_arm9: bool,
    commands: &[CompileCommand],
    hooks: &mut HookCollection,
    object_dir: &Path,
    ld_dir: &Path,
) -> Result<(), BuildError> {
    let arch = if is_arm9 { "arm9" } else { "arm7" };
    let own_commands: Vec<CompileCommand> = commands.iter().filter(|c| c.target.is_arm9() == is_arm9).cloned().collect();
    if own_commands.is_empty() {
        return Ok(());
    }

    let region_config = if is_arm9 { &config.patch.arm9 } else { &config.patch.arm7 };
    let (region, reloc_address, _compress) = parse_region(region_config, arch)?;

    let mut safe_reserve: BTreeMap<CodeTarget, usize> = BTreeMap::new();
    for (target, bytes) in &hooks.safe_reserve {
        if target.is_arm9() == is_arm9 {
            safe_reserve.insert(*target, *bytes);
        }
    }
    let replace_hooks: Vec<_> = hooks.hooks_by_symbol.values().filter(|h| h.kind == HookKind::Replace && h.target.is_arm9() == is_arm9).copied().collect();

    let symbols_script = if is_arm9 { config.build.symbols9.as_deref() } else { config.build.symbols7.as_deref() };
    let script = linker_script::generate_linker_script(object_dir, &own_commands, region, symbols_script, &safe_reserve, &replace_hooks);
    let Some(script) = script else { return Ok(()) };

    let ld_path = ld_dir.join(format!("{arch}.ld"));
    linker_script::write_linker_script(&ld_path, &script)?;

    let elf_path = ld_dir.join(format!("{arch}.elf"));
    run_linker(&config.build.executables.ld, &ld_path, &elf_path)?;

    let fixups = elf_resolver::parse_linked_elf(&elf_path, hooks)?;
    if fixups.is_empty() {
        return Ok(());
    }

    let elf_bytes = io::read_file(&elf_path)?;
    let elf_data = if is_arm9 { FileElfData { arm9: elf_bytes, arm7: Vec::new() } } else { FileElfData { arm9: Vec::new(), arm7: elf_bytes } };
    let mut applicator = PatchApplicator::new(&elf_data, ARM9_ARMV5TE, ARM7_ARMV5TE);
    applicator.set_heap_region_start(is_arm9, region.start);

    let backup_dir = &config.build.backup;
    let output_dir = &config.build.output;
    let bin_name = if is_arm9 { "arm9.bin" } else { "arm7.bin" };
    let ovt_name = if is_arm9 { "arm9ovt.bin" } else { "arm7ovt.bin" };
    let overlay_subdir = if is_arm9 { "overlay9" } else { "overlay7" };

    let header = io::read_file(backup_dir.join("header.bin"))?;
    let (arm9_ram, arm7_ram) = read_ram_addresses(&header);
    let load_offset = if is_arm9 { arm9_ram } else { arm7_ram };

    let ovt_path = backup_dir.join(ovt_name);
    let mut overlay_entries = if ovt_path.exists() { overlay::load_overlay_table(&io::read_file(&ovt_path)?)? } else { Vec::new() };

    let targets: BTreeSet<CodeTarget> = fixups.iter().map(Fixup::target).collect();
    for target in targets {
        if target.is_overlay() {
            let overlay_id = target.overlay_id().unwrap();
            let Some(entry_index) = overlay_entries.iter().position(|e| e.overlay_id as u16 == overlay_id) else { continue };
            let entry_value = overlay_entries[entry_index];
            let source_path = backup_dir.join(overlay_subdir).join(format!("{overlay_subdir}_{overlay_id}.bin"));
            let buffer = io::read_file(&source_path)?;
            let (new_buffer, _) = applicator.apply_target_run(&fixups, target, || LoadedTargetSeed::Overlay { buffer: buffer.clone(), entry: entry_value }, None)?;

            let was_compressed = entry_value.is_compressed();
            let final_bytes = if was_compressed { blz::compress(&new_buffer) } else { new_buffer };
            let entry = &mut overlay_entries[entry_index];
            entry.finalize_for_save(final_bytes.len() as u32);
            io::write_file(output_dir.join(overlay_subdir).join(format!("{overlay_subdir}_{overlay_id}.bin")), &final_bytes)?;
        } else {
            let buffer = io::read_file(backup_dir.join(bin_name))?;
            let (new_buffer, _) = applicator.apply_target_run(&fixups, target, || LoadedTargetSeed::Binary { buffer: buffer.clone(), load_offset }, Some(reloc_address))?;
            io::write_file(output_dir.join(bin_name), &new_buffer)?;
        }
    }

    if !overlay_entries.is_empty() {
        io::write_file(output_dir.join(ovt_name), overlay::save_overlay_table(&overlay_entries))?;
    }

    Ok(())
}

/// Runs the full build: config load, dependency-aware compilation, linking,
/// hook collection, patch application, and file-ID header generation.
pub fn run_build(config_path: &Path) -> Result<(), BuildError> {
    let config = config::load_config(config_path)?;

    let object_dir = config.build.build.join("object");
    io::create_dir_all(&object_dir)?;
    let ld_dir = config.build.build.join("ld");
    io::create_dir_all(&ld_dir)?;

    let header = io::read_file(config.build.filesystem.join("header.bin"))?;
    let (arm9_ram, arm7_ram) = read_ram_addresses(&header);
    backup::backup_files(&config.build.filesystem, &config.build.backup, arm9_ram, arm7_ram)?;

    if let Some(command) = &config.build.pre_build {
        run_hook_command(command)?;
    }

    let tracker_path = config.build.build.join("tracker.bin");
    let mut tracker = DependencyTracker::load(&tracker_path)?;
    let config_changed = tracker.config_changed(config_path);
    if config_changed {
        log::info!("configuration changed, recompiling every source");
    }

    let (all_commands, mut dirty_commands) = gather_compile_commands(&config, &object_dir, &tracker)?;
    if config_changed {
        dirty_commands = all_commands.clone();
    }
    sweep_orphan_objects(&object_dir, &all_commands)?;

    let num_workers = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
    scheduler::run_compile_commands(&config.build.executables.gcc, &dirty_commands, num_workers, config.build.pedantic)?;

    for command in &dirty_commands {
        tracker.record(&command.source, Some(&command.dep_file));
    }
    tracker.save(&tracker_path)?;

    let mut hooks = HookCollection::default();
    for command in &all_commands {
        hook_collector::collect_hooks_from_object(&command.object, &mut hooks)?;
    }

    patch_processor(&config, true, &all_commands, &mut hooks, &object_dir, &ld_dir)?;
    patch_processor(&config, false, &all_commands, &mut hooks, &object_dir, &ld_dir)?;

    if !config.file_id.is_empty() {
        let fat_root = config.build.filesystem.clone();
        let lookup = |path: &Path| -> Option<u16> {
            let mut names: Vec<PathBuf> = Vec::new();
            collect_source_files(&fat_root, &mut names).ok()?;
            names.sort();
            names.iter().position(|p| p == path).map(|i| i as u16)
        };
        let resolved = fileid::resolve_file_ids(&config.file_id, &config.build.filesystem, lookup)?;
        fileid::write_fid_header_if_changed(&config.build.toolchain, &resolved, config_changed)?;
    }

    if let Some(command) = &config.build.post_build {
        run_hook_command(command)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn test_build_config(source: PathBuf) -> config::BuildConfig {
        config::BuildConfig {
            include_directories: Vec::new(),
            source,
            filesystem: PathBuf::from("fs"),
            toolchain: PathBuf::from("toolchain"),
            backup: PathBuf::from("backup"),
            build: PathBuf::from("build"),
            output: PathBuf::from("output"),
            symbols7: None,
            symbols9: None,
            pre_build: None,
            post_build: None,
            executables: config::BuildExecutables { gcc: "arm-none-eabi-g++".into(), ld: "arm-none-eabi-ld".into() },
            flags: config::BuildFlags { cpp: String::new(), c: String::new(), asm: String::new(), arm9: String::new(), arm7: String::new() },
            pedantic: true,
            allow_eabi_extensions: false,
            library: None,
        }
    }

    #[test]
    fn test_scan_default_target_sources_excludes_claimed_files() {
        let dir = std::env::temp_dir().join(format!("ffc-build-default-target-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("claimed.cpp"), "").unwrap();
        std::fs::write(dir.join("unclaimed.cpp"), "").unwrap();
        std::fs::write(dir.join("readme.txt"), "").unwrap();

        let mut main = HashMap::new();
        main.insert("arm9".to_string(), vec![dir.join("claimed.cpp")]);

        let config = Config {
            build: test_build_config(dir.clone()),
            patch: config::PatchConfig::default(),
            main,
            default_target: Some("arm9".to_string()),
            file_id: BTreeMap::new(),
        };

        let unclaimed = scan_default_target_sources(&config).unwrap();
        assert_eq!(unclaimed, vec![dir.join("unclaimed.cpp")]);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_sweep_orphan_objects_removes_unreferenced_files_and_empty_dirs() {
        let dir = std::env::temp_dir().join(format!("ffc-build-orphan-sweep-{}", std::process::id()));
        let arm9_dir = dir.join("arm9");
        std::fs::create_dir_all(&arm9_dir).unwrap();
        let kept_object = arm9_dir.join("main.o");
        let orphan_object = arm9_dir.join("stale.o");
        std::fs::write(&kept_object, "").unwrap();
        std::fs::write(&orphan_object, "").unwrap();

        let deps_dir = dir.join("deps").join("arm9");
        std::fs::create_dir_all(&deps_dir).unwrap();
        let orphan_dep = deps_dir.join("stale.d");
        std::fs::write(&orphan_dep, "").unwrap();

        let commands = vec![CompileCommand {
            target: CodeTarget::Arm9,
            source: PathBuf::from("source/main.cpp"),
            object: kept_object.clone(),
            dep_file: deps_dir.join("main.d"),
            args: Vec::new(),
        }];

        sweep_orphan_objects(&dir, &commands).unwrap();

        assert!(kept_object.exists());
        assert!(!orphan_object.exists());
        assert!(!orphan_dep.exists());
        // deps/arm9 is now empty and should have been pruned.
        assert!(!deps_dir.exists());

        std::fs::remove_dir_all(&dir).ok();
    }
}
