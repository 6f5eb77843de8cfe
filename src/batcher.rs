use crate::TallyError;
use crossbeam_channel::Sender;
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

const READ_BUFFER_BYTES: usize = 1 << 20;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// A run of consecutive input lines. `sequence` starts at 1 and is the batch's
/// identity for artifact naming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub sequence: u64,
    pub lines: Vec<Vec<u8>>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Open the input stream: a file path, or stdin when `path` is `None` or `-`.
/// Gzip input is detected by its magic bytes.
pub fn open_input(path: Option<&Path>) -> Result<Box<dyn BufRead + Send>, TallyError> {
    match path {
        Some(p) if p != Path::new("-") => {
            let file = File::open(p)?;
            tracing::info!(path = %p.display(), "reading input file");
            wrap_input(BufReader::with_capacity(READ_BUFFER_BYTES, file))
        }
        _ => {
            tracing::info!("reading input from stdin");
            wrap_input(BufReader::with_capacity(READ_BUFFER_BYTES, io::stdin()))
        }
    }
}

fn wrap_input<R: BufRead + Send + 'static>(mut reader: R) -> Result<Box<dyn BufRead + Send>, TallyError> {
    let is_gzip = reader.fill_buf()?.starts_with(&GZIP_MAGIC);
    if is_gzip {
        tracing::debug!("gzip input detected");
        Ok(Box::new(BufReader::with_capacity(READ_BUFFER_BYTES, MultiGzDecoder::new(reader))))
    } else {
        Ok(Box::new(reader))
    }
}

/// Cuts a byte stream into batches of `batch_size` lines. The final batch
/// holds whatever remains at end of input. A read error ends the sequence
/// after being yielded once.
pub struct LineBatcher<R: BufRead> {
    reader: R,
    batch_size: usize,
    next_sequence: u64,
    done: bool,
}

impl<R: BufRead> LineBatcher<R> {
    pub fn new(reader: R, batch_size: usize) -> Self {
        Self {
            reader,
            batch_size: batch_size.max(1),
            next_sequence: 1,
            done: false,
        }
    }

    fn read_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut line = Vec::new();
        if self.reader.read_until(b'\n', &mut line)? == 0 {
            return Ok(None);
        }
        if line.last() == Some(&b'\n') {
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
        }
        Ok(Some(line))
    }
}

impl<R: BufRead> Iterator for LineBatcher<R> {
    type Item = Result<Batch, TallyError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut lines = Vec::with_capacity(self.batch_size.min(1 << 16));
        while lines.len() < self.batch_size {
            match self.read_line() {
                Ok(Some(line)) => lines.push(line),
                Ok(None) => {
                    self.done = true;
                    break;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(TallyError::Io(e)));
                }
            }
        }

        if lines.is_empty() {
            return None;
        }

        let batch = Batch { sequence: self.next_sequence, lines };
        self.next_sequence += 1;
        tracing::debug!(batch = batch.sequence, lines = batch.len(), "batch emitted");
        Some(Ok(batch))
    }
}

/// Drive a batcher into a bounded queue. Returns once the input is exhausted,
/// an error has been forwarded, or the receiving side has hung up.
pub fn feed<R: BufRead>(batcher: LineBatcher<R>, tx: Sender<Result<Batch, TallyError>>) {
    for item in batcher {
        let failed = item.is_err();
        if tx.send(item).is_err() || failed {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::{Cursor, Read, Write};

    fn collect(input: &str, batch_size: usize) -> Vec<Batch> {
        LineBatcher::new(Cursor::new(input.as_bytes().to_vec()), batch_size)
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn test_batches_cut_by_count() {
        let batches = collect("a\nb\nc\nd\ne\n", 2);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].lines, vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(batches[1].lines, vec![b"c".to_vec(), b"d".to_vec()]);
        assert_eq!(batches[2].lines, vec![b"e".to_vec()]);
    }

    #[test]
    fn test_sequence_numbers_start_at_one() {
        let batches = collect("1\n2\n3\n4\n", 1);
        let sequences: Vec<u64> = batches.iter().map(|b| b.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_exact_multiple_has_no_empty_tail() {
        let batches = collect("a\nb\nc\nd\n", 2);
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|b| b.len() == 2));
    }

    #[test]
    fn test_last_line_without_newline_is_kept() {
        let batches = collect("a\r\nb", 5);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].lines, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn test_empty_input_yields_nothing() {
        assert!(collect("", 3).is_empty());
    }

    struct FailingReader {
        served: bool,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.served {
                return Err(io::Error::new(io::ErrorKind::Other, "disk on fire"));
            }
            self.served = true;
            let data = b"a\nb\n";
            buf[..data.len()].copy_from_slice(data);
            Ok(data.len())
        }
    }

    #[test]
    fn test_read_error_terminates_sequence() {
        let reader = BufReader::new(FailingReader { served: false });
        let mut batcher = LineBatcher::new(reader, 10);
        assert!(matches!(batcher.next(), Some(Err(TallyError::Io(_)))));
        assert!(batcher.next().is_none());
    }

    #[test]
    fn test_gzip_input_is_detected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("tracks.json.gz");
        let mut encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        encoder.write_all(b"one\ntwo\nthree\n").unwrap();
        encoder.finish().unwrap();

        let reader = open_input(Some(path.as_path())).unwrap();
        let batches: Vec<Batch> = LineBatcher::new(reader, 2).collect::<Result<_, _>>().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].lines, vec![b"three".to_vec()]);
    }

    #[test]
    fn test_plain_input_is_passed_through() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("tracks.json");
        std::fs::write(&path, "x\ny\n").unwrap();

        let reader = open_input(Some(path.as_path())).unwrap();
        let batches: Vec<Batch> = LineBatcher::new(reader, 10).collect::<Result<_, _>>().unwrap();
        assert_eq!(batches[0].lines, vec![b"x".to_vec(), b"y".to_vec()]);
    }

    #[test]
    fn test_feed_forwards_all_batches() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let handle = std::thread::spawn(move || {
            feed(LineBatcher::new(Cursor::new(b"a\nb\nc\n".to_vec()), 2), tx);
        });
        let received: Vec<Batch> = rx.iter().map(|b| b.unwrap()).collect();
        handle.join().unwrap();
        assert_eq!(received.len(), 2);
        assert_eq!(received[1].sequence, 2);
    }
}
