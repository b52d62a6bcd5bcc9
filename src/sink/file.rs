//! Rotating file writer for the Dual Sink (C3)
//!
//! Adapted from the grounding project's background-thread file logger
//! (`logging/file.rs`): same rotation algorithm — shift numbered backups,
//! drop the oldest, optionally gzip — but synchronous instead of
//! threaded, because the Dual Sink's contract requires a file-write
//! failure to surface as the call's own return value, not be swallowed by
//! a channel send.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

pub struct RotatingFileWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    size: u64,
    max_bytes: u64,
    max_backups: usize,
    compress: bool,
}

impl RotatingFileWriter {
    pub fn open(path: PathBuf, max_size_mb: u64, max_backups: usize, compress: bool) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let (file, size) = open_append(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            size,
            max_bytes: max_size_mb.max(1) * 1024 * 1024,
            max_backups,
            compress,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `record` (already newline-terminated) and rotate if this
    /// write pushes the active file at or past `max_size_mb`.
    pub fn write_record(&mut self, record: &[u8]) -> io::Result<()> {
        self.writer.write_all(record)?;
        self.writer.flush()?;
        self.size = self.size.saturating_add(record.len() as u64);
        if self.size >= self.max_bytes {
            self.rotate()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        rotate_files(&self.path, self.max_backups, self.compress)?;
        let (file, _) = open_append(&self.path)?;
        self.writer = BufWriter::new(file);
        self.size = 0;
        Ok(())
    }
}

fn open_append(path: &Path) -> io::Result<(File, u64)> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let size = file.metadata().map(|m| m.len()).unwrap_or(0);
    Ok((file, size))
}

fn backup_name(dir: &Path, stem: &str, n: usize, compress: bool) -> PathBuf {
    if compress {
        dir.join(format!("{stem}.{n}.gz"))
    } else {
        dir.join(format!("{stem}.{n}"))
    }
}

fn rotate_files(path: &Path, max_backups: usize, compress: bool) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let stem = path
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "cdr.log".to_string());

    if max_backups == 0 {
        let _ = fs::remove_file(path);
        return Ok(());
    }

    let oldest = backup_name(dir, &stem, max_backups, compress);
    let _ = fs::remove_file(&oldest);

    for i in (1..max_backups).rev() {
        let src = backup_name(dir, &stem, i, compress);
        let dst = backup_name(dir, &stem, i + 1, compress);
        if src.exists() {
            let _ = fs::rename(&src, &dst);
        }
    }

    if path.exists() {
        let rotated = dir.join(format!("{stem}.1"));
        fs::rename(path, &rotated)?;
        if compress {
            let gz = dir.join(format!("{stem}.1.gz"));
            compress_file(&rotated, &gz)?;
            fs::remove_file(&rotated)?;
        }
    }

    Ok(())
}

fn compress_file(src: &Path, dst: &Path) -> io::Result<()> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let input = fs::read(src)?;
    let out_file = File::create(dst)?;
    let mut encoder = GzEncoder::new(out_file, Compression::default());
    encoder.write_all(&input)?;
    encoder.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn writes_append_and_grow_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("1429010002-A1.log");
        let mut w = RotatingFileWriter::open(path.clone(), 100, 5, false).unwrap();
        w.write_record(b"line one\n").unwrap();
        w.write_record(b"line two\n").unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "line one\nline two\n");
    }

    #[test]
    fn rotates_when_max_size_exceeded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cdr.log");
        // max_size_mb rounds up to at least 1 MiB internally; use a writer
        // built directly against a tiny max via the private constructor
        // path is not exposed, so drive rotation through many small writes
        // against a 1-byte-equivalent threshold isn't possible via the mb
        // API. Exercise rotate_files directly instead.
        fs::write(&path, b"active").unwrap();
        fs::write(dir.path().join("cdr.log.1"), b"one").unwrap();
        rotate_files(&path, 3, false).unwrap();

        assert!(!path.exists());
        assert_eq!(fs::read(dir.path().join("cdr.log.1")).unwrap(), b"active");
        assert_eq!(fs::read(dir.path().join("cdr.log.2")).unwrap(), b"one");
    }

    #[test]
    fn rotation_drops_oldest_backup_beyond_max() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cdr.log");
        fs::write(&path, b"active").unwrap();
        fs::write(dir.path().join("cdr.log.1"), b"one").unwrap();
        fs::write(dir.path().join("cdr.log.2"), b"two").unwrap();
        rotate_files(&path, 2, false).unwrap();

        assert!(dir.path().join("cdr.log.1").exists());
        assert!(dir.path().join("cdr.log.2").exists());
        assert!(!dir.path().join("cdr.log.3").exists());
        assert_eq!(fs::read(dir.path().join("cdr.log.2")).unwrap(), b"one");
    }

    #[test]
    fn max_backups_zero_just_removes_active_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cdr.log");
        fs::write(&path, b"active").unwrap();
        rotate_files(&path, 0, false).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn compress_rotates_into_gz_backup() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cdr.log");
        fs::write(&path, b"plain text line\n").unwrap();
        rotate_files(&path, 3, true).unwrap();

        assert!(!path.exists());
        let gz_path = dir.path().join("cdr.log.1.gz");
        assert!(gz_path.exists());

        use flate2::read::GzDecoder;
        use std::io::Read;
        let mut decoder = GzDecoder::new(File::open(&gz_path).unwrap());
        let mut out = String::new();
        decoder.read_to_string(&mut out).unwrap();
        assert_eq!(out, "plain text line\n");
    }
}
