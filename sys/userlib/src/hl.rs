// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! High-level helpers.
//!
//! These wrap the raw [`Filesystem`] calls with the loops and error
//! classification that every PSP subsystem would otherwise repeat.

use crate::{Fd, FileStat, Filesystem, FsError};
use core::fmt::Write;
use heapless::String;

/// Creates `path`, treating an existing directory as success.
pub fn create_directory<F: Filesystem + ?Sized>(
    fs: &F,
    path: &str,
) -> Result<(), FsError> {
    match fs.mkdir(path) {
        Ok(()) | Err(FsError::AlreadyExists) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Removes `path`, treating an already-absent file as success.
pub fn remove_if_present<F: Filesystem + ?Sized>(
    fs: &F,
    path: &str,
) -> Result<(), FsError> {
    match fs.remove(path) {
        Ok(()) | Err(FsError::NotFound) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Returns the file's metadata, or `None` if it doesn't exist.
pub fn stat_if_present<F: Filesystem + ?Sized>(
    fs: &F,
    path: &str,
) -> Result<Option<FileStat>, FsError> {
    match fs.stat(path) {
        Ok(s) => Ok(Some(s)),
        Err(FsError::NotFound) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Reads until `buf` is full or the file ends, returning the byte count.
pub fn read_exact<F: Filesystem + ?Sized>(
    fs: &F,
    fd: Fd,
    buf: &mut [u8],
) -> Result<usize, FsError> {
    let mut done = 0;
    while done < buf.len() {
        match fs.read(fd, &mut buf[done..])? {
            0 => break,
            n => done += n,
        }
    }
    Ok(done)
}

/// Writes all of `buf`. A write that makes no progress is an I/O error.
pub fn write_all<F: Filesystem + ?Sized>(
    fs: &F,
    fd: Fd,
    buf: &[u8],
) -> Result<(), FsError> {
    let mut done = 0;
    while done < buf.len() {
        match fs.write(fd, &buf[done..])? {
            0 => return Err(FsError::Io),
            n => done += n,
        }
    }
    Ok(())
}

/// Joins `dir` and `name` with a single `/`.
pub fn join_path<const N: usize>(
    dir: &str,
    name: &str,
) -> Result<String<N>, FsError> {
    let mut path = String::new();
    let dir = dir.trim_end_matches('/');
    let name = name.trim_start_matches('/');
    write!(path, "{}/{}", dir, name).map_err(|_| FsError::InvalidPath)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeFs;
    use crate::OpenMode;

    #[test]
    fn create_directory_is_idempotent() {
        let fs = FakeFs::new();
        assert_eq!(create_directory(&fs, "/ffx0/URM"), Ok(()));
        // The second mkdir reports AlreadyExists underneath.
        assert_eq!(fs.mkdir("/ffx0/URM"), Err(FsError::AlreadyExists));
        assert_eq!(create_directory(&fs, "/ffx0/URM"), Ok(()));
    }

    #[test]
    fn create_directory_passes_other_errors() {
        let fs = FakeFs::new();
        fs.fail_mkdir("/ro", FsError::PermissionDenied);
        assert_eq!(
            create_directory(&fs, "/ro"),
            Err(FsError::PermissionDenied)
        );
    }

    #[test]
    fn remove_missing_is_ok() {
        let fs = FakeFs::new();
        assert_eq!(remove_if_present(&fs, "/nope"), Ok(()));
        fs.put_file("/yes", &[1, 2, 3]);
        assert_eq!(remove_if_present(&fs, "/yes"), Ok(()));
        assert_eq!(fs.file("/yes"), None);
    }

    #[test]
    fn write_then_read_back() {
        let fs = FakeFs::new();
        let fd = fs.open("/f", OpenMode::CreateTruncate).unwrap();
        write_all(&fs, fd, b"hello world").unwrap();
        fs.close(fd).unwrap();

        let fd = fs.open("/f", OpenMode::ReadOnly).unwrap();
        let mut buf = [0u8; 32];
        assert_eq!(read_exact(&fs, fd, &mut buf), Ok(11));
        assert_eq!(&buf[..11], b"hello world");
        fs.close(fd).unwrap();
    }

    #[test]
    fn join_trims_separators() {
        let p: String<32> = join_path("/ffx0/", "/startup.bin").unwrap();
        assert_eq!(p.as_str(), "/ffx0/startup.bin");
        let p: Result<String<4>, _> = join_path("/ffx0", "x");
        assert_eq!(p, Err(FsError::InvalidPath));
    }
}
