use std::{
    backtrace::Backtrace,
    fs::{self, File},
    io,
    path::Path,
};

use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum FileError {
    #[snafu(transparent)]
    Io { source: io::Error },
    #[snafu(display("file '{path}' was not found:\n{backtrace}"))]
    FileNotFound { path: String, backtrace: Backtrace },
    #[snafu(display("parent directory does not exist for file '{path}':\n{backtrace}"))]
    FileParentNotFound { path: String, backtrace: Backtrace },
    #[snafu(display("directory '{path}' was not found:\n{backtrace}"))]
    DirNotFound { path: String, backtrace: Backtrace },
    #[snafu(display("file '{path}' already exists:\n{backtrace}"))]
    AlreadyExists { path: String, backtrace: Backtrace },
}

/// Wrapper for [`File::open`] with clearer errors.
pub fn open_file<P: AsRef<Path>>(path: P) -> Result<File, FileError> {
    let path = path.as_ref();
    match File::open(path) {
        Ok(file) => Ok(file),
        Err(err) => match err.kind() {
            io::ErrorKind::NotFound => FileNotFoundSnafu { path: path.to_string_lossy() }.fail(),
            _ => Err(err)?,
        },
    }
}

/// Wrapper for [`File::create`] with clearer errors.
pub fn create_file<P: AsRef<Path>>(path: P) -> Result<File, FileError> {
    let path = path.as_ref();
    match File::create(path) {
        Ok(file) => Ok(file),
        Err(err) => match err.kind() {
            io::ErrorKind::NotFound => FileParentNotFoundSnafu { path: path.to_string_lossy() }.fail(),
            _ => Err(err)?,
        },
    }
}

/// Wrapper for [`fs::read`] with clearer errors.
pub fn read_file<P: AsRef<Path>>(path: P) -> Result<Vec<u8>, FileError> {
    let path = path.as_ref();
    match fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(err) => match err.kind() {
            io::ErrorKind::NotFound => FileNotFoundSnafu { path: path.to_string_lossy() }.fail(),
            _ => Err(err)?,
        },
    }
}

/// Wrapper for [`fs::write`] with clearer errors.
pub fn write_file<P: AsRef<Path>, C: AsRef<[u8]>>(path: P, contents: C) -> Result<(), FileError> {
    let path = path.as_ref();
    match fs::write(path, contents.as_ref()) {
        Ok(()) => Ok(()),
        Err(err) => match err.kind() {
            io::ErrorKind::NotFound => FileParentNotFoundSnafu { path: path.to_string_lossy() }.fail(),
            _ => Err(err)?,
        },
    }
}

/// Wrapper for [`fs::read_to_string`] with clearer errors.
pub fn read_to_string<P: AsRef<Path>>(path: P) -> Result<String, FileError> {
    let path = path.as_ref();
    match fs::read_to_string(path) {
        Ok(string) => Ok(string),
        Err(err) => match err.kind() {
            io::ErrorKind::NotFound => FileNotFoundSnafu { path: path.to_string_lossy() }.fail(),
            _ => Err(err)?,
        },
    }
}

/// Wrapper for [`fs::create_dir_all`] with clearer errors, idempotent if the directory exists.
pub fn create_dir_all<P: AsRef<Path>>(path: P) -> Result<(), FileError> {
    let path = path.as_ref();
    match fs::create_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) => match err.kind() {
            io::ErrorKind::NotFound => DirNotFoundSnafu { path: path.to_string_lossy() }.fail(),
            _ => Err(err)?,
        },
    }
}

/// Copies `from` to `to`, creating `to`'s parent directory if needed.
pub fn copy_file<P: AsRef<Path>, Q: AsRef<Path>>(from: P, to: Q) -> Result<(), FileError> {
    let to = to.as_ref();
    if let Some(parent) = to.parent() {
        create_dir_all(parent)?;
    }
    let from = from.as_ref();
    match fs::copy(from, to) {
        Ok(_) => Ok(()),
        Err(err) => match err.kind() {
            io::ErrorKind::NotFound => FileNotFoundSnafu { path: from.to_string_lossy() }.fail(),
            _ => Err(err)?,
        },
    }
}
