use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use bincode::Options;
use core_types::{RawRecord, RecordSink, RecordSource, BANK_HEADER_WORDS};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zdab_wire::{wire_options, MAX_BUFFSIZE_WORDS};

/// First word of every framed record: ASCII `"ZDB1"`.
pub const FRAME_MAGIC: u32 = 0x5a44_4231;
pub const FRAME_HEADER_BYTES: usize = BANK_HEADER_WORDS * 4;
pub const OUTPUT_EXTENSION: &str = "zdab";
pub const CHECKSUM_EXTENSION: &str = "lock";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u32,
    pub bank: u32,
    pub payload_words: u32,
    pub reserved: [u32; 6],
}

impl FrameHeader {
    pub fn for_record(record: &RawRecord) -> Self {
        Self {
            magic: FRAME_MAGIC,
            bank: record.bank,
            payload_words: record.payload_words() as u32,
            reserved: [0; 6],
        }
    }
}

/// Frames one record: bank header followed by the payload, which must be
/// whole words.
pub fn encode_frame(record: &RawRecord) -> Result<Vec<u8>> {
    if record.payload.len() % 4 != 0 {
        bail!(
            "{} record payload of {} bytes is not a whole number of words",
            record.bank_name(),
            record.payload.len()
        );
    }
    let mut out = wire_options()
        .serialize(&FrameHeader::for_record(record))
        .context("encode frame header")?;
    out.extend_from_slice(&record.payload);
    Ok(out)
}

/// `<base>.<extension>`, keeping any dots already in `base`.
fn with_suffix(base: &Path, extension: &str) -> PathBuf {
    let mut name = OsString::from(base.as_os_str());
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

/// Reads framed records from a byte stream.
pub struct FramedRecordReader<R> {
    inner: BufReader<R>,
    records: u64,
}

impl FramedRecordReader<File> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file =
            File::open(path).with_context(|| format!("open input file {}", path.display()))?;
        Ok(Self::new(file))
    }
}

impl<R: Read> FramedRecordReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            records: 0,
        }
    }

    pub fn records_read(&self) -> u64 {
        self.records
    }

    fn read_header(&mut self) -> Result<Option<FrameHeader>> {
        let mut buf = [0u8; FRAME_HEADER_BYTES];
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err).context("read frame header"),
            }
        }
        if filled == 0 {
            return Ok(None);
        }
        if filled < buf.len() {
            bail!(
                "stream ends inside a frame header after record {} ({filled} of {} bytes)",
                self.records,
                buf.len()
            );
        }
        let header: FrameHeader = wire_options()
            .deserialize(&buf)
            .context("decode frame header")?;
        Ok(Some(header))
    }
}

impl<R: Read> RecordSource for FramedRecordReader<R> {
    fn next_record(&mut self) -> Result<Option<RawRecord>> {
        let Some(header) = self.read_header()? else {
            return Ok(None);
        };
        if header.magic != FRAME_MAGIC {
            bail!(
                "bad frame magic {:#010x} at record {}",
                header.magic,
                self.records
            );
        }
        let words = header.payload_words as usize;
        if words > MAX_BUFFSIZE_WORDS {
            bail!("frame of {words} words exceeds the record buffer");
        }
        let mut payload = vec![0u8; words * 4];
        self.inner
            .read_exact(&mut payload)
            .with_context(|| format!("read payload of record {}", self.records))?;
        self.records += 1;
        Ok(Some(RawRecord::new(header.bank, payload)))
    }
}

/// Writes `<base>.zdab` and, on finish, appends its SHA-256 to `<base>.lock`.
pub struct ChecksumRecordWriter {
    path: PathBuf,
    lock_path: PathBuf,
    out: Option<BufWriter<File>>,
    hasher: Sha256,
    records: u64,
    bytes: u64,
}

impl ChecksumRecordWriter {
    pub fn create(base: impl AsRef<Path>, clobber: bool) -> Result<Self> {
        let base = base.as_ref();
        let path = with_suffix(base, OUTPUT_EXTENSION);
        let lock_path = with_suffix(base, CHECKSUM_EXTENSION);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).context("create output dir")?;
            }
        }

        let mut opts = OpenOptions::new();
        opts.write(true);
        if clobber {
            opts.create(true).truncate(true);
        } else {
            opts.create_new(true);
        }
        let file = opts.open(&path).with_context(|| {
            if clobber {
                format!("open output file {}", path.display())
            } else {
                format!(
                    "open output file {} (refusing to overwrite an existing file)",
                    path.display()
                )
            }
        })?;

        Ok(Self {
            path,
            lock_path,
            out: Some(BufWriter::new(file)),
            hasher: Sha256::new(),
            records: 0,
            bytes: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn records_written(&self) -> u64 {
        self.records
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }
}

impl RecordSink for ChecksumRecordWriter {
    fn write(&mut self, record: &RawRecord) -> Result<()> {
        let Some(out) = self.out.as_mut() else {
            bail!("write to {} after finish", self.path.display());
        };
        let frame = encode_frame(record)?;
        out.write_all(&frame)
            .with_context(|| format!("write record to {}", self.path.display()))?;
        self.hasher.update(&frame);
        self.records += 1;
        self.bytes += frame.len() as u64;
        Ok(())
    }

    fn finish(&mut self) -> Result<Option<String>> {
        let Some(mut out) = self.out.take() else {
            return Ok(None);
        };
        out.flush()
            .with_context(|| format!("flush {}", self.path.display()))?;
        drop(out);

        let digest = format!("{:x}", std::mem::take(&mut self.hasher).finalize());
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut lock = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.lock_path)
            .with_context(|| format!("open checksum file {}", self.lock_path.display()))?;
        writeln!(lock, "{digest}  {name}").context("append checksum")?;

        tracing::info!(
            path = %self.path.display(),
            records = self.records,
            bytes = self.bytes,
            sha256 = %digest,
            "output closed"
        );
        Ok(Some(digest))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use core_types::ZDAB_BANK;
    use zdab_wire::{run_header_record, HitRecordBuilder};

    use super::*;

    fn sample_records() -> Vec<RawRecord> {
        vec![
            run_header_record(100, 0x4),
            HitRecordBuilder::new().nhit(3).time50(1_000).build(),
            RawRecord::new(u32::from_be_bytes(*b"TRIG"), vec![1, 2, 3, 4, 5, 6, 7, 8]),
        ]
    }

    #[test]
    fn writer_output_reads_back_with_checksum() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = dir.path().join("run_100");
        let mut writer = ChecksumRecordWriter::create(&base, false).expect("create writer");
        for rec in sample_records() {
            writer.write(&rec).expect("write");
        }
        let digest = writer.finish().expect("finish").expect("digest");
        assert_eq!(writer.records_written(), 3);

        let bytes = std::fs::read(writer.path()).expect("read output");
        assert_eq!(bytes.len() as u64, writer.bytes_written());
        assert_eq!(format!("{:x}", Sha256::digest(&bytes)), digest);

        let lock = std::fs::read_to_string(writer.lock_path()).expect("read lock");
        assert_eq!(lock, format!("{digest}  run_100.zdab\n"));

        let mut reader = FramedRecordReader::open(writer.path()).expect("open reader");
        let mut back = Vec::new();
        while let Some(rec) = reader.next_record().expect("next") {
            back.push(rec);
        }
        assert_eq!(back, sample_records());
        assert_eq!(reader.records_read(), 3);
    }

    #[test]
    fn no_clobber_refuses_existing_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = dir.path().join("out");
        let mut first = ChecksumRecordWriter::create(&base, false).expect("create");
        first.finish().expect("finish");
        assert!(ChecksumRecordWriter::create(&base, false).is_err());
        assert!(ChecksumRecordWriter::create(&base, true).is_ok());
    }

    #[test]
    fn finish_twice_is_harmless_and_write_after_finish_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut writer = ChecksumRecordWriter::create(dir.path().join("x"), true).expect("create");
        assert!(writer.finish().expect("finish").is_some());
        assert_eq!(writer.finish().expect("finish again"), None);
        assert!(writer.write(&sample_records()[0]).is_err());
    }

    #[test]
    fn empty_stream_has_no_records() {
        let mut reader = FramedRecordReader::new(Cursor::new(Vec::<u8>::new()));
        assert!(reader.next_record().expect("next").is_none());
    }

    #[test]
    fn bad_magic_is_an_error() {
        let mut frame = encode_frame(&RawRecord::new(ZDAB_BANK, vec![0; 4])).expect("frame");
        frame[0] = 0;
        let mut reader = FramedRecordReader::new(Cursor::new(frame));
        assert!(reader.next_record().is_err());
    }

    #[test]
    fn truncated_frames_are_errors() {
        let frame = encode_frame(&RawRecord::new(ZDAB_BANK, vec![0; 16])).expect("frame");

        let mut short_header = FramedRecordReader::new(Cursor::new(frame[..10].to_vec()));
        assert!(short_header.next_record().is_err());

        let cut = frame[..frame.len() - 4].to_vec();
        let mut short_payload = FramedRecordReader::new(Cursor::new(cut));
        assert!(short_payload.next_record().is_err());
    }

    #[test]
    fn dotted_bases_keep_their_own_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut first =
            ChecksumRecordWriter::create(dir.path().join("SNOP_0000012345.001"), false)
                .expect("create first");
        let mut second =
            ChecksumRecordWriter::create(dir.path().join("SNOP_0000012345.002"), false)
                .expect("create second");
        assert!(first.path().ends_with("SNOP_0000012345.001.zdab"));
        assert!(first.lock_path().ends_with("SNOP_0000012345.001.lock"));
        assert!(second.path().ends_with("SNOP_0000012345.002.zdab"));

        first.write(&sample_records()[0]).expect("write");
        first.finish().expect("finish first");
        second.finish().expect("finish second");
        assert_ne!(
            std::fs::read(first.path()).expect("read first"),
            std::fs::read(second.path()).expect("read second")
        );
        let lock = std::fs::read_to_string(first.lock_path()).expect("read lock");
        assert!(lock.ends_with("  SNOP_0000012345.001.zdab\n"));
    }

    #[test]
    fn partial_word_payload_is_not_framed() {
        let rec = RawRecord::new(ZDAB_BANK, vec![1, 2, 3, 4, 5, 6]);
        assert!(encode_frame(&rec).is_err());

        let dir = tempfile::tempdir().expect("tempdir");
        let mut writer =
            ChecksumRecordWriter::create(dir.path().join("odd"), true).expect("create");
        assert!(writer.write(&rec).is_err());
        assert_eq!(writer.records_written(), 0);
    }
}
