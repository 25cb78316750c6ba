//! Snapshot bundle: a gzip-compressed tar of one snapshot directory
//!
//! Entries are stored flat (file name only) so a bundle can be unpacked
//! into any directory. Sub-directories are never included.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;
use tar::{Archive, Builder, EntryType, Header};

/// Pack every regular file of `dir` into a `.tar.gz` at `dest`
///
/// Writes to a sibling temp file first so a reader never sees a partial
/// bundle. Returns the number of files packed.
pub fn pack_dir(dir: &Path, dest: &Path) -> io::Result<usize> {
    let partial = dest.with_extension("part");
    let file = File::create(&partial)?;
    let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));

    let mut count = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }

        let bytes = fs::read(entry.path())?;
        let name = entry.file_name();

        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
        header.set_cksum();
        builder.append_data(&mut header, Path::new(&name), bytes.as_slice())?;
        count += 1;
    }

    let mut encoder = builder.into_inner()?;
    encoder.flush()?;
    encoder.finish()?;

    fs::rename(&partial, dest)?;
    Ok(count)
}

/// Unpack a `.tar.gz` stream into `dest`, replacing whatever was there
///
/// Entries that would land outside `dest` are skipped. Returns the number
/// of files unpacked.
pub fn unpack<R: Read>(reader: R, dest: &Path) -> io::Result<usize> {
    if dest.exists() {
        fs::remove_dir_all(dest)?;
    }
    fs::create_dir_all(dest)?;

    let mut archive = Archive::new(GzDecoder::new(reader));
    let mut count = 0;
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        if entry.unpack_in(dest)? {
            count += 1;
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_and_unpack() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("h1"), b"{\"reported\":true}").unwrap();
        fs::write(src.join("h2"), b"{}").unwrap();
        fs::write(src.join("nested").join("ignored"), b"x").unwrap();

        let bundle = dir.path().join("db.tar.gz");
        assert_eq!(pack_dir(&src, &bundle).unwrap(), 2);
        assert!(!bundle.with_extension("part").exists());

        let out = dir.path().join("out");
        fs::create_dir_all(&out).unwrap();
        fs::write(out.join("stale"), b"old").unwrap();

        let n = unpack(File::open(&bundle).unwrap(), &out).unwrap();
        assert_eq!(n, 2);
        assert_eq!(fs::read(out.join("h1")).unwrap(), b"{\"reported\":true}");
        assert!(!out.join("stale").exists());
        assert!(!out.join("nested").exists());
    }

    #[test]
    fn test_unpack_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        assert!(unpack(&b"definitely not gzip"[..], &dir.path().join("out")).is_err());
    }
}
