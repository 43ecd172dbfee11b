/// Bounded capture of the payload's stdout and stderr
///
/// Each stream gets its own reader thread. Bytes past the cap are drained and
/// discarded so the writer never blocks on a full pipe or dies of SIGPIPE.
use crate::config::types::OutputIntegrity;
use std::io::Read;
use std::thread::{self, JoinHandle};

const CHUNK: usize = 8192;

/// One captured stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedStream {
    pub data: Vec<u8>,
    pub integrity: OutputIntegrity,
    /// Bytes the writer produced, kept or not
    pub total_bytes: u64,
    pub limit: usize,
}

impl CapturedStream {
    pub fn empty(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            integrity: OutputIntegrity::Complete,
            total_bytes: 0,
            limit,
        }
    }

    /// Lossy UTF-8, with the truncation marker appended when cut
    pub fn render(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.data).into_owned();
        if self.integrity == OutputIntegrity::Truncated {
            text.push_str(&truncation_marker(self.limit));
        }
        text
    }
}

pub fn truncation_marker(limit: usize) -> String {
    format!("\n[probebox: output truncated at {} bytes]", limit)
}

/// Read `stream` to EOF keeping at most `limit` bytes
pub fn capture_stream<R: Read>(mut stream: R, limit: usize) -> CapturedStream {
    let mut captured = CapturedStream::empty(limit);
    let mut chunk = [0u8; CHUNK];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                captured.total_bytes += n as u64;
                let room = limit.saturating_sub(captured.data.len());
                if n > room {
                    captured.data.extend_from_slice(&chunk[..room]);
                    captured.integrity = OutputIntegrity::Truncated;
                } else {
                    captured.data.extend_from_slice(&chunk[..n]);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => {
                if captured.integrity == OutputIntegrity::Complete {
                    captured.integrity = OutputIntegrity::WriteError;
                }
                break;
            }
        }
    }
    captured
}

/// Spawn a named reader thread for one stream
pub fn spawn_collector<R: Read + Send + 'static>(
    name: &str,
    stream: R,
    limit: usize,
) -> std::io::Result<JoinHandle<CapturedStream>> {
    thread::Builder::new()
        .name(format!("probebox-{}", name))
        .spawn(move || capture_stream(stream, limit))
}

/// Join a collector; a panicked reader counts as a read failure
pub fn join_collector(handle: Option<JoinHandle<CapturedStream>>, limit: usize) -> CapturedStream {
    match handle {
        Some(handle) => handle.join().unwrap_or_else(|_| CapturedStream {
            integrity: OutputIntegrity::WriteError,
            ..CapturedStream::empty(limit)
        }),
        None => CapturedStream::empty(limit),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn small_output_is_complete() {
        let captured = capture_stream(Cursor::new(b"LIS length: 6\n".to_vec()), 1024);
        assert_eq!(captured.integrity, OutputIntegrity::Complete);
        assert_eq!(captured.render(), "LIS length: 6\n");
        assert_eq!(captured.total_bytes, 14);
    }

    #[test]
    fn oversized_output_is_capped_and_marked() {
        let input = vec![b'x'; 100_000];
        let captured = capture_stream(Cursor::new(input), 1000);

        assert_eq!(captured.data.len(), 1000);
        assert_eq!(captured.total_bytes, 100_000);
        assert_eq!(captured.integrity, OutputIntegrity::Truncated);
        assert!(captured
            .render()
            .ends_with("\n[probebox: output truncated at 1000 bytes]"));
    }

    #[test]
    fn output_exactly_at_limit_is_not_truncated() {
        let captured = capture_stream(Cursor::new(vec![b'a'; 64]), 64);
        assert_eq!(captured.integrity, OutputIntegrity::Complete);
        assert_eq!(captured.data.len(), 64);
    }

    #[test]
    fn invalid_utf8_is_rendered_lossily() {
        let captured = capture_stream(Cursor::new(vec![0xff, b'o', b'k']), 16);
        assert_eq!(captured.render(), "\u{fffd}ok");
    }

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"))
        }
    }

    #[test]
    fn read_failure_is_classified() {
        let captured = capture_stream(FailingReader, 16);
        assert_eq!(captured.integrity, OutputIntegrity::WriteError);
    }

    #[test]
    fn collector_thread_returns_capture() {
        let handle = spawn_collector("stdout", Cursor::new(b"hi".to_vec()), 8).unwrap();
        let captured = join_collector(Some(handle), 8);
        assert_eq!(captured.data, b"hi");
        assert_eq!(join_collector(None, 8), CapturedStream::empty(8));
    }
}
