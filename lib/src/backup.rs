use std::path::{Path, PathBuf};

use snafu::Snafu;

use crate::{
    binary_props::{load_arm_binary_properties, BinaryPropertiesError},
    blz,
    overlay::{load_overlay_table, OverlayEntry, OverlayError},
    util::io::{self, FileError},
};

#[derive(Debug, Snafu)]
pub enum BackupError {
    #[snafu(transparent)]
    File { source: FileError },
    #[snafu(transparent)]
    Overlay { source: OverlayError },
    #[snafu(transparent)]
    BinaryProperties { source: BinaryPropertiesError },
    #[snafu(transparent)]
    Blz { source: blz::BlzError },
}

const SENTINEL: &str = ".nobackup";

fn sentinel_path(backup_dir: &Path) -> PathBuf {
    backup_dir.join(SENTINEL)
}

/// Returns true once the initial backup has already been taken.
pub fn is_backed_up(backup_dir: &Path) -> bool {
    sentinel_path(backup_dir).exists()
}

fn arm_names(is_arm9: bool) -> (&'static str, &'static str) {
    if is_arm9 { ("arm9.bin", "arm9ovt.bin") } else { ("arm7.bin", "arm7ovt.bin") }
}

/// Copies one ARM binary into the backup directory, decompressing it (and
/// preserving the compressed original as `<name>c.bin`) if it was BLZ
/// compressed.
fn backup_arm_binary(filesystem_dir: &Path, backup_dir: &Path, is_arm9: bool, load_offset: u32) -> Result<(), BackupError> {
    let (bin_name, _) = arm_names(is_arm9);
    let source = filesystem_dir.join(bin_name);
    let data = io::read_file(&source)?;

    let props = load_arm_binary_properties(&data, load_offset, 0, is_arm9).ok();
    match props {
        Some(p) if p.compressed_end_offset != 0 => {
            let compressed_backup = backup_dir.join(format!("{}c.bin", bin_name.trim_end_matches(".bin")));
            io::write_file(&compressed_backup, &data)?;
            let decompressed = blz::decompress(&data[..p.compressed_end_offset.min(data.len())])?;
            io::write_file(backup_dir.join(bin_name), decompressed)?;
        }
        _ => {
            io::write_file(backup_dir.join(bin_name), &data)?;
        }
    }
    Ok(())
}

/// Backs up one overlay file, decompressing it into the canonical backup
/// location (and preserving the compressed original under
/// `overlay{7,9}c/`) when the overlay table marks it compressed.
fn backup_overlay(filesystem_dir: &Path, backup_dir: &Path, is_arm9: bool, entry: &OverlayEntry, file_name: &str) -> Result<(), BackupError> {
    let overlay_subdir = if is_arm9 { "overlay9" } else { "overlay7" };
    let compressed_subdir = if is_arm9 { "overlay9c" } else { "overlay7c" };

    let source = filesystem_dir.join(overlay_subdir).join(file_name);
    let data = io::read_file(&source)?;

    if entry.is_compressed() {
        io::write_file(backup_dir.join(compressed_subdir).join(file_name), &data)?;
        let decompressed = blz::decompress(&data)?;
        io::write_file(backup_dir.join(overlay_subdir).join(file_name), decompressed)?;
    } else {
        io::write_file(backup_dir.join(overlay_subdir).join(file_name), &data)?;
    }
    Ok(())
}

/// Snapshots the NitroFS files that the build driver patches, decompressing
/// anything originally compressed, so the patch applicator always loads
/// pristine uncompressed buffers regardless of how many times the build has
/// run. A no-op once the `.nobackup` sentinel exists.
pub fn backup_files(filesystem_dir: &Path, backup_dir: &Path, arm9_load_offset: u32, arm7_load_offset: u32) -> Result<(), BackupError> {
    if is_backed_up(backup_dir) {
        return Ok(());
    }

    io::copy_file(filesystem_dir.join("header.bin"), backup_dir.join("header.bin"))?;

    backup_arm_binary(filesystem_dir, backup_dir, true, arm9_load_offset)?;
    backup_arm_binary(filesystem_dir, backup_dir, false, arm7_load_offset)?;

    for is_arm9 in [true, false] {
        let (_, ovt_name) = arm_names(is_arm9);
        let ovt_path = filesystem_dir.join(ovt_name);
        if !ovt_path.exists() {
            continue;
        }
        let ovt_data = io::read_file(&ovt_path)?;
        io::copy_file(&ovt_path, backup_dir.join(ovt_name))?;
        let entries = load_overlay_table(&ovt_data)?;
        let overlay_subdir = if is_arm9 { "overlay9" } else { "overlay7" };
        for entry in &entries {
            let file_name = format!("{overlay_subdir}_{}.bin", entry.overlay_id);
            backup_overlay(filesystem_dir, backup_dir, is_arm9, entry, &file_name)?;
        }
    }

    io::write_file(sentinel_path(backup_dir), b"")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_backed_up_false_when_missing() {
        let dir = std::env::temp_dir().join(format!("ffc-backup-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        assert!(!is_backed_up(&dir));
        std::fs::write(dir.join(SENTINEL), b"").unwrap();
        assert!(is_backed_up(&dir));
        std::fs::remove_dir_all(&dir).ok();
    }
}
