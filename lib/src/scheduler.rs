use std::{
    path::PathBuf,
    process::Command,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use snafu::Snafu;

use crate::{config::BuildConfig, target::CodeTarget};

#[derive(Debug, Snafu)]
pub enum SchedulerError {
    #[snafu(display("failed to launch compiler '{gcc}': {source}"))]
    Launch { gcc: String, source: std::io::Error },
    #[snafu(display("compilation failed"))]
    CompilationFailed,
}

/// One `gcc`/`g++`/`as` invocation: a source file in a code target, compiled
/// to an object file with a `.d` dependency sidecar beside it.
#[derive(Debug, Clone)]
pub struct CompileCommand {
    pub target: CodeTarget,
    pub source: PathBuf,
    pub object: PathBuf,
    pub dep_file: PathBuf,
    pub args: Vec<String>,
}

enum Lang {
    Cpp,
    C,
    Asm,
}

fn lang_of(source: &std::path::Path) -> Option<Lang> {
    match source.extension().and_then(|e| e.to_str()) {
        Some("cpp") | Some("cc") | Some("cxx") => Some(Lang::Cpp),
        Some("c") => Some(Lang::C),
        Some("s") | Some("S") => Some(Lang::Asm),
        _ => None,
    }
}

/// Whether `source` has an extension the compiler scheduler recognizes
/// (cpp/cc/cxx/c/s/S), independent of building a full `CompileCommand`.
pub fn is_compilable_file(source: &std::path::Path) -> bool {
    lang_of(source).is_some()
}

/// Builds the full argument list for a single compile command, following
/// the language-class and architecture flag selection.
pub fn build_compile_command(
    config: &BuildConfig,
    target: CodeTarget,
    source: PathBuf,
    object: PathBuf,
    dep_file: PathBuf,
) -> Option<CompileCommand> {
    let lang = lang_of(&source)?;
    let mut args = Vec::new();

    let lang_flags = match lang {
        Lang::Cpp => &config.flags.cpp,
        Lang::C => &config.flags.c,
        Lang::Asm => &config.flags.asm,
    };
    args.extend(lang_flags.split_whitespace().map(String::from));

    let arch_flags = if target.is_arm9() { &config.flags.arm9 } else { &config.flags.arm7 };
    args.extend(arch_flags.split_whitespace().map(String::from));

    for dir in &config.include_directories {
        args.push("-I".to_string());
        args.push(dir.display().to_string());
    }
    args.push("-include".to_string());
    args.push(config.toolchain.join("internal/ffc.h").display().to_string());
    args.push("-include".to_string());
    args.push(config.toolchain.join("internal/fid.h").display().to_string());

    let lang_macro = match lang {
        Lang::Cpp => "__FFC_LANG_CPP",
        Lang::C => "__FFC_LANG_C",
        Lang::Asm => "__FFC_LANG_ASM",
    };
    args.push(format!("-D{lang_macro}"));
    args.push(format!("-D__FFC_ARCH_NUM={}", if target.is_arm9() { 9 } else { 7 }));

    args.push("-MMD".to_string());
    args.push("-MF".to_string());
    args.push(dep_file.display().to_string());

    args.push("-c".to_string());
    args.push(source.display().to_string());
    args.push("-o".to_string());
    args.push(object.display().to_string());

    Some(CompileCommand { target, source, object, dep_file, args })
}

/// Runs `commands` across a fixed-size worker pool, sharing a single atomic
/// dispatch index the way the compile scheduler's original C++ engine does.
/// In pedantic mode the first failure halts further dispatch; otherwise every
/// command runs and the returned result is the logical AND of exit statuses.
pub fn run_compile_commands(gcc: &str, commands: &[CompileCommand], num_workers: usize, pedantic: bool) -> Result<(), SchedulerError> {
    if commands.is_empty() {
        return Ok(());
    }

    let next_index = AtomicUsize::new(0);
    let successful = AtomicBool::new(true);
    let running = AtomicBool::new(true);

    std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(num_workers);
        for _ in 0..num_workers.min(commands.len()).max(1) {
            let next_index = &next_index;
            let successful = &successful;
            let running = &running;
            handles.push(scope.spawn(move || {
                loop {
                    if !running.load(Ordering::Acquire) {
                        break;
                    }
                    let index = next_index.fetch_add(1, Ordering::AcqRel);
                    if index >= commands.len() {
                        break;
                    }
                    let command = &commands[index];
                    log::info!("compiling {}", command.source.display());
                    let status = Command::new(gcc).args(&command.args).status();
                    let ok = matches!(status, Ok(status) if status.success());
                    if !ok {
                        log::error!("failed to compile {}", command.source.display());
                        successful.store(false, Ordering::Release);
                        if pedantic {
                            running.store(false, Ordering::Release);
                        }
                    }
                }
            }));
        }
        for handle in handles {
            let _ = handle.join();
        }
    });

    if successful.load(Ordering::Acquire) {
        Ok(())
    } else {
        CompilationFailedSnafu.fail()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> BuildConfig {
        BuildConfig {
            include_directories: vec![PathBuf::from("include")],
            source: PathBuf::from("source"),
            filesystem: PathBuf::from("fs"),
            toolchain: PathBuf::from("toolchain"),
            backup: PathBuf::from("backup"),
            build: PathBuf::from("build"),
            output: PathBuf::from("output"),
            symbols7: None,
            symbols9: None,
            pre_build: None,
            post_build: None,
            executables: crate::config::BuildExecutables { gcc: "arm-none-eabi-g++".into(), ld: "arm-none-eabi-ld".into() },
            flags: crate::config::BuildFlags {
                cpp: "-O2".into(),
                c: "-O2".into(),
                asm: String::new(),
                arm9: "-march=armv5te".into(),
                arm7: "-march=armv4t".into(),
            },
            pedantic: true,
            allow_eabi_extensions: false,
            library: None,
        }
    }

    #[test]
    fn test_build_compile_command_selects_arch_flags() {
        let config = test_config();
        let cmd = build_compile_command(
            &config,
            CodeTarget::Arm9,
            PathBuf::from("source/main.cpp"),
            PathBuf::from("build/object/arm9/main.o"),
            PathBuf::from("build/deps/arm9/main.d"),
        )
        .unwrap();
        assert!(cmd.args.contains(&"-march=armv5te".to_string()));
        assert!(cmd.args.contains(&"-D__FFC_ARCH_NUM=9".to_string()));
        assert!(cmd.args.contains(&"-D__FFC_LANG_CPP".to_string()));
    }

    #[test]
    fn test_unrecognized_extension_skipped() {
        let config = test_config();
        let cmd = build_compile_command(
            &config,
            CodeTarget::Arm9,
            PathBuf::from("source/readme.txt"),
            PathBuf::from("build/object/arm9/readme.o"),
            PathBuf::from("build/deps/arm9/readme.d"),
        );
        assert!(cmd.is_none());
    }

    #[test]
    fn test_empty_command_list_is_ok() {
        assert!(run_compile_commands("arm-none-eabi-g++", &[], 4, true).is_ok());
    }
}
