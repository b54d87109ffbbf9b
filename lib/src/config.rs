use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
};

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::util::io::{self, FileError};

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct BuildConfig {
    #[serde(rename = "include-directories", default)]
    pub include_directories: Vec<PathBuf>,
    pub source: PathBuf,
    pub filesystem: PathBuf,
    pub toolchain: PathBuf,
    pub backup: PathBuf,
    pub build: PathBuf,
    pub output: PathBuf,
    pub symbols7: Option<PathBuf>,
    pub symbols9: Option<PathBuf>,
    #[serde(rename = "pre-build")]
    pub pre_build: Option<String>,
    #[serde(rename = "post-build")]
    pub post_build: Option<String>,
    pub executables: BuildExecutables,
    pub flags: BuildFlags,
    #[serde(default = "default_true")]
    pub pedantic: bool,
    #[serde(rename = "allow-eabi-extensions", default)]
    pub allow_eabi_extensions: bool,
    pub library: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct BuildExecutables {
    pub gcc: String,
    pub ld: String,
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct BuildFlags {
    #[serde(rename = "c++", default)]
    pub cpp: String,
    #[serde(default)]
    pub c: String,
    #[serde(default)]
    pub asm: String,
    #[serde(default)]
    pub arm9: String,
    #[serde(default)]
    pub arm7: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PatchRegion {
    pub reloc: String,
    pub start: String,
    pub end: String,
    #[serde(default)]
    pub compress: bool,
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct PatchConfig {
    pub arm9: Option<PatchRegion>,
    pub arm7: Option<PatchRegion>,
}

/// Raw shape of the config file's `main` object: most keys map a code target
/// name to its source files/directories, but `default-target` is a bare
/// string naming another target instead. Deserializing as `Value` here and
/// splitting it apart in [`load_config`] keeps that one irregular key from
/// forcing a hand-rolled `Deserialize` on the rest of `Config`.
#[derive(Debug, Serialize, Deserialize, Default)]
struct RawConfig {
    build: BuildConfig,
    #[serde(default)]
    patch: PatchConfig,
    main: HashMap<String, serde_json::Value>,
    #[serde(rename = "file-id", default)]
    file_id: BTreeMap<String, PathBuf>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct Config {
    pub build: BuildConfig,
    #[serde(default)]
    pub patch: PatchConfig,
    /// Maps a code target name (`arm9`, `arm7`, `ov9_<n>`, `ov7_<n>`) to the
    /// source files/directories explicitly assigned to it.
    pub main: HashMap<String, Vec<PathBuf>>,
    /// The target named by `main.default-target`, if present: every
    /// compilable file under `build.source` not already claimed by an
    /// explicit entry in `main` is assigned to this target instead.
    pub default_target: Option<String>,
    #[serde(rename = "file-id", default)]
    pub file_id: BTreeMap<String, PathBuf>,
}

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(transparent)]
    File { source: FileError },
    #[snafu(display("failed to parse config '{path}': {source}"))]
    Parse { path: String, source: serde_json::Error },
    #[snafu(display("main.default-target must be a string naming a code target"))]
    InvalidDefaultTarget,
}

pub fn load_config(path: &std::path::Path) -> Result<Config, ConfigError> {
    let text = io::read_to_string(path)?;
    let raw: RawConfig = serde_json::from_str(&text).context(ParseSnafu { path: path.to_string_lossy() })?;

    let mut main = HashMap::new();
    let mut default_target = None;
    for (name, value) in raw.main {
        if name == "default-target" {
            default_target = Some(value.as_str().ok_or(InvalidDefaultTargetSnafu.build())?.to_string());
        } else {
            let sources: Vec<PathBuf> = serde_json::from_value(value).context(ParseSnafu { path: path.to_string_lossy() })?;
            main.insert(name, sources);
        }
    }

    Ok(Config { build: raw.build, patch: raw.patch, main, default_target, file_id: raw.file_id })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let json = r#"{
            "build": {
                "source": "source",
                "filesystem": "fs",
                "toolchain": "toolchain",
                "backup": "backup",
                "build": "build",
                "output": "output",
                "executables": { "gcc": "arm-none-eabi-gcc", "ld": "arm-none-eabi-ld" },
                "flags": {}
            },
            "main": {}
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.build.pedantic);
        assert!(!config.build.allow_eabi_extensions);
        assert!(config.build.include_directories.is_empty());
    }

    fn write_temp_config(json: &str, name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("ffc-config-test-{}-{name}.json", std::process::id()));
        std::fs::write(&path, json).unwrap();
        path
    }

    #[test]
    fn test_default_target_is_split_out_of_main() {
        let json = r#"{
            "build": {
                "source": "source",
                "filesystem": "fs",
                "toolchain": "toolchain",
                "backup": "backup",
                "build": "build",
                "output": "output",
                "executables": { "gcc": "arm-none-eabi-gcc", "ld": "arm-none-eabi-ld" },
                "flags": {}
            },
            "main": {
                "arm9": ["source/hooks"],
                "default-target": "arm9"
            }
        }"#;
        let path = write_temp_config(json, "default-target");
        let config = load_config(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.default_target.as_deref(), Some("arm9"));
        assert_eq!(config.main.get("arm9"), Some(&vec![PathBuf::from("source/hooks")]));
        assert!(!config.main.contains_key("default-target"));
    }

    #[test]
    fn test_default_target_must_be_a_string() {
        let json = r#"{
            "build": {
                "source": "source",
                "filesystem": "fs",
                "toolchain": "toolchain",
                "backup": "backup",
                "build": "build",
                "output": "output",
                "executables": { "gcc": "arm-none-eabi-gcc", "ld": "arm-none-eabi-ld" },
                "flags": {}
            },
            "main": {
                "default-target": ["source/hooks"]
            }
        }"#;
        let path = write_temp_config(json, "default-target-invalid");
        let result = load_config(&path);
        std::fs::remove_file(&path).ok();

        assert!(matches!(result, Err(ConfigError::InvalidDefaultTarget)));
    }
}
