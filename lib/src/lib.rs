pub mod backup;
pub mod binary_props;
pub mod blz;
pub mod build;
pub mod config;
pub mod elf_resolver;
pub mod fileid;
pub mod hook;
pub mod hook_collector;
pub mod linker_script;
pub mod opcode;
pub mod overlay;
pub mod patch_applicator;
pub mod safe_hook;
pub mod scheduler;
pub mod section_map;
pub mod target;
pub mod tracker;
pub mod util;

pub use build::{run_build, BuildError};
