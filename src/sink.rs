// src/sink.rs

//! Disk-backed capture buffer for the child's combined output.
//!
//! The child writes straight into an unnamed temporary file (stdout and stderr
//! share one file description, so their writes land in order). Readers never
//! touch the shared file offset; they use positional reads from their own
//! cursor, which lets the tailer follow the file while the child is still
//! writing and lets output grow past any pipe buffer limit.

use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug)]
struct SinkInner {
    file: Mutex<File>,
}

impl SinkInner {
    fn lock(&self) -> MutexGuard<'_, File> {
        // A poisoned lock still guards a valid file handle.
        self.file.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reads from `cursor` up to the length observed on entry, so a writer
    /// that never pauses cannot stretch a single call.
    fn read_from(&self, cursor: u64) -> io::Result<(Vec<u8>, u64)> {
        let file = self.lock();
        let end = file.metadata()?.len();
        if end <= cursor {
            return Ok((Vec::new(), cursor));
        }

        let mut bytes = Vec::with_capacity((end - cursor) as usize);
        let mut chunk = [0u8; READ_CHUNK];
        let mut offset = cursor;
        while offset < end {
            let want = READ_CHUNK.min((end - offset) as usize);
            match file.read_at(&mut chunk[..want], offset) {
                Ok(0) => break,
                Ok(n) => {
                    bytes.extend_from_slice(&chunk[..n]);
                    offset += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok((bytes, offset))
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.lock().metadata()?.len())
    }
}

/// Single-writer, multi-reader append-only byte log.
#[derive(Debug)]
pub struct OutputSink {
    inner: Arc<SinkInner>,
}

/// A read-only handle onto an [`OutputSink`]. Holds no cursor of its own;
/// each reader tracks where it left off.
#[derive(Debug, Clone)]
pub struct SinkView {
    inner: Arc<SinkInner>,
}

impl OutputSink {
    /// Creates a sink backed by a fresh unnamed temporary file.
    pub fn new() -> io::Result<Self> {
        let file = tempfile::tempfile()?;
        Ok(Self {
            inner: Arc::new(SinkInner {
                file: Mutex::new(file),
            }),
        })
    }

    /// Appends `bytes` at the end of the log. Readers observe either none or
    /// all of an append.
    pub fn append(&self, bytes: &[u8]) -> io::Result<()> {
        let mut file = self.inner.lock();
        file.seek(SeekFrom::End(0))?;
        file.write_all(bytes)?;
        file.flush()
    }

    /// Returns every byte written since `cursor`, and the cursor just past them.
    pub fn read_from(&self, cursor: u64) -> io::Result<(Vec<u8>, u64)> {
        self.inner.read_from(cursor)
    }

    /// Everything written so far.
    pub fn snapshot(&self) -> io::Result<Vec<u8>> {
        self.inner.read_from(0).map(|(bytes, _)| bytes)
    }

    pub fn len(&self) -> io::Result<u64> {
        self.inner.len()
    }

    pub fn view(&self) -> SinkView {
        SinkView {
            inner: Arc::clone(&self.inner),
        }
    }

    /// A new handle on the backing file, suitable as a child's stdout/stderr.
    pub(crate) fn child_stdio(&self) -> io::Result<Stdio> {
        let file = self.inner.lock().try_clone()?;
        Ok(Stdio::from(file))
    }
}

impl SinkView {
    pub fn read_from(&self, cursor: u64) -> io::Result<(Vec<u8>, u64)> {
        self.inner.read_from(cursor)
    }

    pub fn len(&self) -> io::Result<u64> {
        self.inner.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_read_from_returns_only_new_bytes() {
        let sink = OutputSink::new().unwrap();
        let (bytes, cursor) = sink.read_from(0).unwrap();
        assert!(bytes.is_empty());
        assert_eq!(cursor, 0);

        sink.append(b"hello ").unwrap();
        let (bytes, cursor) = sink.read_from(cursor).unwrap();
        assert_eq!(bytes, b"hello ");
        assert_eq!(cursor, 6);

        let (bytes, same) = sink.read_from(cursor).unwrap();
        assert!(bytes.is_empty());
        assert_eq!(same, cursor);

        sink.append(b"world").unwrap();
        let (bytes, cursor) = sink.read_from(cursor).unwrap();
        assert_eq!(bytes, b"world");
        assert_eq!(cursor, 11);
        assert_eq!(sink.snapshot().unwrap(), b"hello world");
        assert_eq!(sink.len().unwrap(), 11);
    }

    #[test]
    fn test_views_keep_independent_cursors() {
        let sink = OutputSink::new().unwrap();
        let a = sink.view();
        let b = a.clone();

        sink.append(b"one\n").unwrap();
        let (first_a, cursor_a) = a.read_from(0).unwrap();
        sink.append(b"two\n").unwrap();
        let (rest_a, _) = a.read_from(cursor_a).unwrap();
        let (all_b, cursor_b) = b.read_from(0).unwrap();

        assert_eq!(first_a, b"one\n");
        assert_eq!(rest_a, b"two\n");
        assert_eq!(all_b, b"one\ntwo\n");
        assert_eq!(cursor_b, 8);
    }

    #[test]
    fn test_concurrent_reader_sees_appends_in_order() {
        let sink = OutputSink::new().unwrap();
        let view = sink.view();
        let total = 2_000usize;

        let reader = thread::spawn(move || {
            let mut seen = Vec::new();
            let mut cursor = 0;
            while seen.len() < total * 4 {
                let (bytes, next) = view.read_from(cursor).unwrap();
                seen.extend_from_slice(&bytes);
                cursor = next;
            }
            seen
        });

        for i in 0..total {
            sink.append(format!("{:03}\n", i % 1000).as_bytes()).unwrap();
        }

        let seen = reader.join().unwrap();
        assert_eq!(seen, sink.snapshot().unwrap());
    }

    #[test]
    fn test_large_output_is_not_bounded_by_pipe_size() {
        let sink = OutputSink::new().unwrap();
        let block = vec![b'x'; 64 * 1024];
        for _ in 0..8 {
            sink.append(&block).unwrap();
        }
        assert_eq!(sink.snapshot().unwrap().len(), 8 * 64 * 1024);
    }

    #[test]
    fn test_read_stops_at_length_seen_on_entry() {
        let sink = Arc::new(OutputSink::new().unwrap());
        let writer_sink = Arc::clone(&sink);
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let writer_done = Arc::clone(&done);

        let writer = thread::spawn(move || {
            let block = vec![b'y'; 4096];
            while !writer_done.load(std::sync::atomic::Ordering::Relaxed) {
                writer_sink.append(&block).unwrap();
            }
        });

        // Every read returns while the writer keeps going, and never
        // reports more than the file held afterwards.
        let mut cursor = 0;
        for _ in 0..50 {
            let (bytes, next) = sink.read_from(cursor).unwrap();
            assert_eq!(next, cursor + bytes.len() as u64);
            assert!(next <= sink.len().unwrap());
            cursor = next;
        }

        done.store(true, std::sync::atomic::Ordering::Relaxed);
        writer.join().unwrap();
        let (rest, end) = sink.read_from(cursor).unwrap();
        assert_eq!(end, sink.len().unwrap());
        assert_eq!(cursor as usize + rest.len(), sink.snapshot().unwrap().len());
    }
}
