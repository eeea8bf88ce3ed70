//! File tailer for reading new lines from a growing proxy access log.
//!
//! Supports log rotation detection via inode tracking (Linux) and file
//! truncation, and can resume from an arbitrary byte offset persisted by
//! the application state store.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

const LINE_TERMINATOR: u8 = b'\n';

/// Maximum number of lines to read in a single `read_new_lines()` call.
/// Prevents unbounded memory usage if the log file has a huge backlog.
const MAX_LINES_PER_READ: usize = 10_000;

/// Reads new lines appended to a file since the last read position.
///
/// Unlike a typical `tail -f`, this tailer starts at a caller-supplied
/// offset (the persisted cursor) rather than always seeking to EOF, so a
/// restarted process resumes exactly where it left off. Detects log
/// rotation via inode change or file truncation, resetting to offset 0.
pub struct FileTailer {
    path: PathBuf,
    offset: u64,
    inode: u64,
}

impl FileTailer {
    /// Create a tailer that resumes from `start_offset` bytes into `path`.
    ///
    /// If `start_offset` is beyond the current file length, it is clamped
    /// to the file length (treated as "nothing to replay").
    pub fn new(path: PathBuf, start_offset: u64) -> io::Result<Self> {
        let metadata = fs::metadata(&path)?;
        let inode = get_inode(&metadata);
        let offset = start_offset.min(metadata.len());

        Ok(Self {
            path,
            offset,
            inode,
        })
    }

    /// Current byte offset into the tailed file. Persist this as the log
    /// cursor after each successful batch commit.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Force the cursor back to the start of the current file, as required
    /// when a bulk-processing marker requests a full replay.
    pub fn reset_to_start(&mut self) {
        self.offset = 0;
    }

    /// Rewinds the cursor to `offset`, so the next `read_new_lines()` call
    /// replays everything from there. Used to back out of a chunk that
    /// failed partway through downstream processing.
    pub fn seek_to(&mut self, offset: u64) {
        self.offset = offset;
    }

    /// Read new lines appended since the last call, paired with the byte
    /// offset immediately past each line (including its terminator) — the
    /// exact value to persist as the log cursor once that line (and
    /// whatever it produced) has been durably committed.
    ///
    /// If the file was rotated (inode changed or size decreased relative to
    /// the cursor), re-opens from the beginning of the new file. Returns at
    /// most `MAX_LINES_PER_READ` lines per call; the caller should loop
    /// until an empty batch is returned to drain a large backlog. A final
    /// line with no trailing newline yet (the producer still writing it)
    /// is held back rather than returned, since its end offset isn't
    /// stable until the terminator lands.
    pub fn read_new_lines(&mut self) -> io::Result<Vec<(String, u64)>> {
        let metadata = match fs::metadata(&self.path) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // File gone (rotation in progress) — return empty, try next time
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let current_inode = get_inode(&metadata);
        let current_size = metadata.len();

        // Detect rotation: inode changed, or the file shrank below our cursor
        if current_inode != self.inode || current_size < self.offset {
            self.inode = current_inode;
            self.offset = 0;
        }

        if current_size <= self.offset {
            return Ok(Vec::new());
        }

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.offset))?;

        let mut reader = BufReader::new(file);
        let mut lines = Vec::new();
        let mut pos = self.offset;
        let mut buf = Vec::new();

        loop {
            buf.clear();
            let read = reader.read_until(LINE_TERMINATOR, &mut buf)?;
            if read == 0 {
                break;
            }
            if buf.last() != Some(&LINE_TERMINATOR) {
                // Incomplete line at EOF; leave it for the next call.
                break;
            }
            pos += read as u64;
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
            lines.push((String::from_utf8_lossy(&buf).into_owned(), pos));
            if lines.len() >= MAX_LINES_PER_READ {
                break;
            }
        }

        self.offset = pos;

        Ok(lines)
    }

    /// Returns the current file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Extract inode from file metadata (Linux-specific).
#[cfg(unix)]
fn get_inode(metadata: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ino()
}

/// Fallback for non-Unix: always returns 0, relying on size-based rotation detection.
#[cfg(not(unix))]
fn get_inode(_metadata: &std::fs::Metadata) -> u64 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_tailer_resumes_from_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");

        std::fs::write(&path, "line one\nline two\nline three\n").unwrap();
        let resume_at = "line one\n".len() as u64;

        let mut tailer = FileTailer::new(path, resume_at).unwrap();
        let lines = tailer.read_new_lines().unwrap();
        let texts: Vec<&str> = lines.iter().map(|(s, _)| s.as_str()).collect();
        assert_eq!(texts, vec!["line two", "line three"]);
        assert_eq!(lines.last().unwrap().1, tailer.offset());
    }

    #[test]
    fn test_tailer_reads_new_lines_and_advances_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");

        std::fs::write(&path, "old\n").unwrap();
        let mut tailer = FileTailer::new(path.clone(), 4).unwrap();

        let mut f = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap();
        writeln!(f, "new line 1").unwrap();
        writeln!(f, "new line 2").unwrap();
        drop(f);

        let lines = tailer.read_new_lines().unwrap();
        let texts: Vec<&str> = lines.iter().map(|(s, _)| s.as_str()).collect();
        assert_eq!(texts, vec!["new line 1", "new line 2"]);
        assert_eq!(tailer.offset(), std::fs::metadata(&path).unwrap().len());

        let lines = tailer.read_new_lines().unwrap();
        assert!(lines.is_empty());
    }

    #[test]
    fn test_tailer_detects_truncation_and_resets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");

        std::fs::write(&path, "a".repeat(1000)).unwrap();
        let mut tailer = FileTailer::new(path.clone(), 1000).unwrap();

        // Rotation: file replaced with much shorter content
        std::fs::write(&path, "after rotation\n").unwrap();

        let lines = tailer.read_new_lines().unwrap();
        let texts: Vec<&str> = lines.iter().map(|(s, _)| s.as_str()).collect();
        assert_eq!(texts, vec!["after rotation"]);
    }

    #[test]
    fn test_tailer_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");

        std::fs::write(&path, "content\n").unwrap();
        let mut tailer = FileTailer::new(path.clone(), 0).unwrap();
        std::fs::remove_file(&path).unwrap();

        let lines = tailer.read_new_lines().unwrap();
        assert!(lines.is_empty());
    }

    #[test]
    fn test_reset_to_start_forces_full_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        std::fs::write(&path, "line one\nline two\n").unwrap();

        let mut tailer = FileTailer::new(path, 9).unwrap();
        tailer.reset_to_start();

        let lines = tailer.read_new_lines().unwrap();
        let texts: Vec<&str> = lines.iter().map(|(s, _)| s.as_str()).collect();
        assert_eq!(texts, vec!["line one", "line two"]);
    }

    #[test]
    fn test_start_offset_clamped_to_file_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        std::fs::write(&path, "short\n").unwrap();

        let tailer = FileTailer::new(path, 1_000_000).unwrap();
        assert_eq!(tailer.offset(), 6);
    }

    #[test]
    fn test_seek_to_rewinds_for_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        std::fs::write(&path, "line one\nline two\n").unwrap();

        let mut tailer = FileTailer::new(path, 19).unwrap();
        assert!(tailer.read_new_lines().unwrap().is_empty());

        tailer.seek_to(9);
        let lines = tailer.read_new_lines().unwrap();
        let texts: Vec<&str> = lines.iter().map(|(s, _)| s.as_str()).collect();
        assert_eq!(texts, vec!["line two"]);
    }

    #[test]
    fn test_unterminated_trailing_line_is_held_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        std::fs::write(&path, "line one\nline two").unwrap();

        let mut tailer = FileTailer::new(path.clone(), 0).unwrap();
        let lines = tailer.read_new_lines().unwrap();
        let texts: Vec<&str> = lines.iter().map(|(s, _)| s.as_str()).collect();
        assert_eq!(texts, vec!["line one"]);
        assert_eq!(tailer.offset(), "line one\n".len() as u64);

        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "").unwrap();
        drop(f);

        let lines = tailer.read_new_lines().unwrap();
        let texts: Vec<&str> = lines.iter().map(|(s, _)| s.as_str()).collect();
        assert_eq!(texts, vec!["line two"]);
    }
}
