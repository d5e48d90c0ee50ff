use crate::commitlog::{Entry, Index, Log, StorageError};
use std::convert::TryFrom;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

// File layout:
//
// Header (16 bytes):
// 0..4   : magic "CSLG"
// 4      : format version
// 5..8   : reserved
// 8..16  : index of the first frame (u64 LE)
//
// Frames, one per entry, back to back:
// 0..4   : payload length (u32 LE)
// 4..8   : crc32 of payload (u32 LE)
// 8..    : payload
const MAGIC: &[u8; 4] = b"CSLG";
const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = 16;
const FRAME_HEADER_LEN: usize = 8;

/// FileLog is a durable `Log` backed by a single append-only file.
///
/// Every entry is framed with its length and a CRC32 of its payload. All retained entries are
/// mirrored in memory so reads never touch the disk. Compaction rewrites the file through a
/// temporary file and an atomic rename.
pub struct FileLog<E: Entry> {
    path: PathBuf,
    file: File,
    first_index: Index,
    records: Vec<Vec<u8>>,
    // File offset at which the frame of `records[i]` starts.
    offsets: Vec<u64>,
    end_offset: u64,
    _pd: PhantomData<E>,
}

impl<E: Entry> FileLog<E> {
    /// Opens the log at `path`, creating an empty one if the file doesn't exist. An existing file
    /// that fails validation is reported as `StorageError::Corruption` and left untouched.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            write_log_file(&path, Index::start_index(), &[])?;
        }

        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;

        let first_index = parse_header(&contents)?;
        let (records, offsets) = parse_frames(&contents)?;

        Ok(FileLog {
            path,
            file,
            first_index,
            records,
            offsets,
            end_offset: contents.len() as u64,
            _pd: PhantomData::default(),
        })
    }

    fn vec_index(&self, index: Index) -> Result<usize, StorageError> {
        if index < self.first_index {
            return Err(StorageError::Compacted(index));
        }
        Ok((index.as_u64() - self.first_index.as_u64()) as usize)
    }

    fn write_frames(&mut self, payloads: Vec<Vec<u8>>) -> Result<(), StorageError> {
        let mut buf = Vec::new();
        let mut new_offsets = Vec::with_capacity(payloads.len());
        for payload in payloads.iter() {
            new_offsets.push(self.end_offset + buf.len() as u64);
            encode_frame(&mut buf, payload);
        }

        self.file.seek(SeekFrom::Start(self.end_offset))?;
        self.file.write_all(&buf)?;
        self.file.sync_data()?;

        self.end_offset += buf.len() as u64;
        self.offsets.extend(new_offsets);
        self.records.extend(payloads);
        Ok(())
    }
}

impl<E: Entry> Log<E> for FileLog<E> {
    fn append(&mut self, entry: E) -> Result<Index, StorageError> {
        self.write_frames(vec![entry.into()])?;

        Ok(self.first_index.plus(self.records.len() as u64 - 1))
    }

    fn append_all(&mut self, entries: Vec<E>) -> Result<Option<Index>, StorageError> {
        if entries.is_empty() {
            return Ok(None);
        }

        self.write_frames(entries.into_iter().map(Into::into).collect())?;

        Ok(Some(self.first_index.plus(self.records.len() as u64 - 1)))
    }

    fn read(&self, index: Index) -> Result<Option<E>, StorageError> {
        let vec_index = self.vec_index(index)?;
        match self.records.get(vec_index).cloned() {
            Some(bytes) => E::try_from(bytes).map(Some),
            None => Ok(None),
        }
    }

    fn truncate(&mut self, index: Index) -> Result<(), StorageError> {
        let vec_index = self.vec_index(index)?;
        if vec_index >= self.records.len() {
            return Ok(());
        }

        let new_len = self.offsets[vec_index];
        self.file.set_len(new_len)?;
        self.file.sync_all()?;

        self.records.truncate(vec_index);
        self.offsets.truncate(vec_index);
        self.end_offset = new_len;
        Ok(())
    }

    fn compact_through(&mut self, index: Index) -> Result<(), StorageError> {
        if index < self.first_index {
            return Ok(());
        }

        let num_to_drop = (index.as_u64() - self.first_index.as_u64() + 1) as usize;
        let retained: &[Vec<u8>] = if num_to_drop >= self.records.len() {
            &[]
        } else {
            &self.records[num_to_drop..]
        };
        let new_first_index = index.plus(1);

        let tmp_path = self.path.with_extension("compacting");
        write_log_file(&tmp_path, new_first_index, retained)?;
        fs::rename(&tmp_path, &self.path)?;

        // Reload from the rewritten file so offsets and handle agree with what's on disk.
        *self = FileLog::open(&self.path)?;
        Ok(())
    }

    fn first_index(&self) -> Index {
        self.first_index
    }

    fn next_index(&self) -> Index {
        self.first_index.plus(self.records.len() as u64)
    }
}

fn encode_frame(buf: &mut Vec<u8>, payload: &[u8]) {
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    buf.extend_from_slice(payload);
}

fn write_log_file(path: &Path, first_index: Index, records: &[Vec<u8>]) -> Result<(), StorageError> {
    let mut buf = Vec::with_capacity(HEADER_LEN);
    buf.extend_from_slice(MAGIC);
    buf.push(FORMAT_VERSION);
    buf.extend_from_slice(&[0; 3]);
    buf.extend_from_slice(&first_index.as_u64().to_le_bytes());
    for record in records {
        encode_frame(&mut buf, record);
    }

    let mut file = File::create(path)?;
    file.write_all(&buf)?;
    file.sync_all()?;
    Ok(())
}

fn parse_header(contents: &[u8]) -> Result<Index, StorageError> {
    if contents.len() < HEADER_LEN {
        return Err(StorageError::Corruption(format!(
            "log header is {} bytes, expected {}",
            contents.len(),
            HEADER_LEN
        )));
    }
    if &contents[0..4] != MAGIC {
        return Err(StorageError::Corruption("log file has bad magic".into()));
    }
    if contents[4] != FORMAT_VERSION {
        return Err(StorageError::Corruption(format!(
            "unknown log format version {}",
            contents[4]
        )));
    }

    let first_index = read_u64(&contents[8..16]);
    Index::from_u64(first_index)
        .ok_or_else(|| StorageError::Corruption("log header has first index 0".into()))
}

fn parse_frames(contents: &[u8]) -> Result<(Vec<Vec<u8>>, Vec<u64>), StorageError> {
    let mut records = Vec::new();
    let mut offsets = Vec::new();
    let mut pos = HEADER_LEN;

    while pos < contents.len() {
        if contents.len() - pos < FRAME_HEADER_LEN {
            return Err(StorageError::Corruption(format!(
                "partial frame header at offset {}",
                pos
            )));
        }
        let len = read_u32(&contents[pos..pos + 4]) as usize;
        let crc = read_u32(&contents[pos + 4..pos + 8]);

        let start = pos + FRAME_HEADER_LEN;
        if contents.len() - start < len {
            return Err(StorageError::Corruption(format!(
                "frame at offset {} claims {} bytes but only {} remain",
                pos,
                len,
                contents.len() - start
            )));
        }
        let payload = &contents[start..start + len];
        if crc32fast::hash(payload) != crc {
            return Err(StorageError::Corruption(format!(
                "checksum mismatch for frame at offset {}",
                pos
            )));
        }

        offsets.push(pos as u64);
        records.push(payload.to_vec());
        pos = start + len;
    }

    Ok((records, offsets))
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut arr = [0; 4];
    arr.copy_from_slice(bytes);
    u32::from_le_bytes(arr)
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut arr = [0; 8];
    arr.copy_from_slice(bytes);
    u64::from_le_bytes(arr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitlog::in_memory::tests::TestEntry;
    use tempfile::TempDir;

    fn entry(b: u8) -> TestEntry {
        TestEntry(vec![b; 5])
    }

    fn open(dir: &TempDir) -> Result<FileLog<TestEntry>, StorageError> {
        FileLog::open(dir.path().join("log"))
    }

    #[test]
    fn entries_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = open(&dir).unwrap();
            log.append(entry(1)).unwrap();
            log.append_all(vec![entry(2), entry(3)]).unwrap();
        }

        let log = open(&dir).unwrap();
        assert_eq!(log.next_index(), Index::new(4));
        assert_eq!(log.read(Index::new(1)).unwrap(), Some(entry(1)));
        assert_eq!(log.read(Index::new(3)).unwrap(), Some(entry(3)));
    }

    #[test]
    fn truncate_is_durable() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = open(&dir).unwrap();
            log.append_all(vec![entry(1), entry(2), entry(3)]).unwrap();
            log.truncate(Index::new(2)).unwrap();
            assert_eq!(log.append(entry(7)).unwrap(), Index::new(2));
        }

        let log = open(&dir).unwrap();
        assert_eq!(log.next_index(), Index::new(3));
        assert_eq!(log.read(Index::new(2)).unwrap(), Some(entry(7)));
    }

    #[test]
    fn compaction_is_durable() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = open(&dir).unwrap();
            log.append_all((1..=5).map(entry).collect()).unwrap();
            log.compact_through(Index::new(3)).unwrap();
            assert_eq!(log.append(entry(6)).unwrap(), Index::new(6));
        }

        let log = open(&dir).unwrap();
        assert_eq!(log.first_index(), Index::new(4));
        assert_eq!(log.next_index(), Index::new(7));
        assert!(matches!(log.read(Index::new(2)), Err(StorageError::Compacted(_))));
        assert_eq!(log.read(Index::new(6)).unwrap(), Some(entry(6)));
    }

    #[test]
    fn flipped_byte_is_corruption() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = open(&dir).unwrap();
            log.append(entry(1)).unwrap();
        }

        let path = dir.path().join("log");
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        assert!(matches!(open(&dir), Err(StorageError::Corruption(_))));
    }

    #[test]
    fn torn_tail_is_corruption() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = open(&dir).unwrap();
            log.append_all(vec![entry(1), entry(2)]).unwrap();
        }

        let path = dir.path().join("log");
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 2]).unwrap();

        assert!(matches!(open(&dir), Err(StorageError::Corruption(_))));
    }
}
