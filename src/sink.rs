//! Durable, append-only log storage.
//!
//! Each logical stream is one text file under the sink directory. Writes are
//! whole lines; reads tolerate a writer appending concurrently and simply
//! return whatever was fully written at the time of the call.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

/// File-backed storage for job output streams.
#[derive(Debug)]
pub struct LogSink {
    dir: PathBuf,
}

impl LogSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, stream: &str) -> PathBuf {
        self.dir.join(format!("{stream}.log"))
    }

    /// Appends one line to the stream, creating the storage location on
    /// first use. The line and its terminator go out in a single write so a
    /// concurrent reader never observes a torn line.
    pub fn append(&self, stream: &str, line: &str) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(stream))?;
        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line);
        buf.push('\n');
        file.write_all(buf.as_bytes())
    }

    /// Truncates the stream to empty. Callers sequence this before the
    /// stream's writer starts, never concurrently with it.
    pub fn clear(&self, stream: &str) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        File::create(self.path(stream)).map(|_| ())
    }

    /// The full contents of the stream. A stream that was never written
    /// reads as empty.
    pub fn read_all(&self, stream: &str) -> io::Result<String> {
        match fs::read_to_string(self.path(stream)) {
            Ok(content) => Ok(content),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(err) => Err(err),
        }
    }

    /// The last `n` meaningful (non-empty) lines of the stream.
    pub fn read_tail(&self, stream: &str, n: usize) -> io::Result<Vec<String>> {
        let content = self.read_all(stream)?;
        let meaningful: Vec<&str> = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();
        let start = meaningful.len().saturating_sub(n);
        Ok(meaningful[start..].iter().map(|s| s.to_string()).collect())
    }

    /// Reads everything appended after byte `offset`, returning the chunk
    /// and the offset to resume from. An offset past the end of the file
    /// (the stream was cleared) restarts from the beginning.
    pub fn read_from(&self, stream: &str, offset: u64) -> io::Result<(String, u64)> {
        let mut file = match File::open(self.path(stream)) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok((String::new(), offset));
            }
            Err(err) => return Err(err),
        };
        let len = file.metadata()?.len();
        let start = if offset > len { 0 } else { offset };
        file.seek(SeekFrom::Start(start))?;
        let mut chunk = String::new();
        file.read_to_string(&mut chunk)?;
        let next = start + chunk.len() as u64;
        Ok((chunk, next))
    }
}
