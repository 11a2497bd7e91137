//! Memory-mapped corpus files and the [`CorpusReader`] that streams them.
//!
//! A corpus is a single binary file of variable-width items plus fixed-width
//! target rows. Backed by `mmap`, so only the pages a batch touches are
//! resident; a corpus much larger than RAM streams fine.
//!
//! File layout, all integers little-endian `u32`:
//!
//! ```text
//! magic "LDRC" | version | item count N | target width T
//! N item lengths
//! packed item bytes
//! N × T target bytes
//! ```

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use memmap2::Mmap;

use crate::buffer::BufferPair;
use crate::error::{Error, Result};
use crate::reader::Reader;

const MAGIC: &[u8; 4] = b"LDRC";
const VERSION: u32 = 1;
const HEADER_BYTES: usize = 16;

/// Write a corpus file from parallel item and target slices.
///
/// Every target row must have the same width. Used by ingestion tooling and
/// by tests to build fixtures.
pub fn write_corpus<P, I, T>(path: P, items: &[I], targets: &[T]) -> Result<()>
where
    P: AsRef<Path>,
    I: AsRef<[u8]>,
    T: AsRef<[u8]>,
{
    if items.is_empty() {
        return Err(Error::InvalidArgument {
            arg: "items",
            reason: "corpus must contain at least one item".to_string(),
        });
    }
    if items.len() != targets.len() {
        return Err(Error::InvalidArgument {
            arg: "targets",
            reason: format!("{} targets for {} items", targets.len(), items.len()),
        });
    }
    let target_size = targets[0].as_ref().len();
    if targets.iter().any(|t| t.as_ref().len() != target_size) {
        return Err(Error::InvalidArgument {
            arg: "targets",
            reason: "target rows must all have the same width".to_string(),
        });
    }

    let mut w = BufWriter::new(File::create(path)?);
    w.write_all(MAGIC)?;
    w.write_all(&VERSION.to_le_bytes())?;
    w.write_all(&(items.len() as u32).to_le_bytes())?;
    w.write_all(&(target_size as u32).to_le_bytes())?;
    for item in items {
        w.write_all(&(item.as_ref().len() as u32).to_le_bytes())?;
    }
    for item in items {
        w.write_all(item.as_ref())?;
    }
    for target in targets {
        w.write_all(target.as_ref())?;
    }
    w.flush()?;
    Ok(())
}

/// A memory-mapped, immutable view of one corpus file.
struct Corpus {
    mmap: Mmap,
    items: Vec<(usize, usize)>,
    targets_start: usize,
    target_size: usize,
}

impl Corpus {
    fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::Corpus {
            reason: format!("failed to open {}: {e}", path.display()),
        })?;
        // SAFETY: the file is opened read-only and only sliced as bytes.
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < HEADER_BYTES {
            return Err(Error::Corpus {
                reason: format!("file is {} bytes, shorter than the header", mmap.len()),
            });
        }
        if &mmap[..4] != MAGIC {
            return Err(Error::Corpus {
                reason: "bad magic (not a corpus file)".to_string(),
            });
        }
        let version = read_u32(&mmap, 4);
        if version != VERSION {
            return Err(Error::Corpus {
                reason: format!("unsupported version {version} (expected {VERSION})"),
            });
        }
        let count = read_u32(&mmap, 8) as usize;
        let target_size = read_u32(&mmap, 12) as usize;
        if count == 0 {
            return Err(Error::Corpus {
                reason: "corpus contains no items".to_string(),
            });
        }

        let lengths_end = HEADER_BYTES + count * 4;
        if mmap.len() < lengths_end {
            return Err(Error::Corpus {
                reason: "truncated item length table".to_string(),
            });
        }

        let mut items = Vec::with_capacity(count);
        let mut offset = lengths_end;
        for i in 0..count {
            let len = read_u32(&mmap, HEADER_BYTES + i * 4) as usize;
            items.push((offset, len));
            offset += len;
        }
        let targets_start = offset;
        let expected = targets_start + count * target_size;
        if mmap.len() < expected {
            return Err(Error::Corpus {
                reason: format!(
                    "file is {} bytes but layout requires {expected}",
                    mmap.len()
                ),
            });
        }

        Ok(Self {
            mmap,
            items,
            targets_start,
            target_size,
        })
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn item(&self, index: usize) -> &[u8] {
        let (off, len) = self.items[index];
        &self.mmap[off..off + len]
    }

    fn target(&self, index: usize) -> &[u8] {
        let off = self.targets_start + index * self.target_size;
        &self.mmap[off..off + self.target_size]
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(word)
}

/// Options for iterating a corpus.
#[derive(Debug, Clone)]
pub struct CorpusConfig {
    /// Items per raw batch.
    pub batch_size: usize,
    /// Visit items in a seeded random permutation instead of file order.
    pub shuffle: bool,
    /// Draw a fresh permutation each time the corpus wraps.
    pub reshuffle: bool,
    /// Seed for the shuffle permutation.
    pub seed: u64,
    /// Position in the visit order to begin at.
    pub start_index: usize,
    /// Restrict reading to the leading percentage of items, `1..=100`.
    pub subset_percent: u32,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            shuffle: false,
            reshuffle: false,
            seed: 0,
            start_index: 0,
            subset_percent: 100,
        }
    }
}

impl CorpusConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_shuffle(mut self, shuffle: bool, reshuffle: bool) -> Self {
        self.shuffle = shuffle;
        self.reshuffle = reshuffle;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_start_index(mut self, start_index: usize) -> Self {
        self.start_index = start_index;
        self
    }

    pub fn with_subset_percent(mut self, subset_percent: u32) -> Self {
        self.subset_percent = subset_percent;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidArgument {
                arg: "batch_size",
                reason: "must be > 0".to_string(),
            });
        }
        if self.subset_percent == 0 || self.subset_percent > 100 {
            return Err(Error::InvalidArgument {
                arg: "subset_percent",
                reason: format!("{} is outside 1..=100", self.subset_percent),
            });
        }
        Ok(())
    }
}

/// Generate shuffled indices `[0..len)` deterministically from a seed.
///
/// Uses splitmix64 + Fisher-Yates for a uniform permutation reproducible
/// across platforms.
fn shuffled_indices(len: usize, seed: u64) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..len).collect();
    if len <= 1 {
        return indices;
    }

    let mut state = seed;
    let mut next_u64 = move || -> u64 {
        state = state.wrapping_add(0x9e3779b97f4a7c15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
        z ^ (z >> 31)
    };

    // Fisher-Yates shuffle
    for i in (1..len).rev() {
        let j = (next_u64() as usize) % (i + 1);
        indices.swap(i, j);
    }

    indices
}

/// Streams raw batches out of a memory-mapped corpus file.
///
/// Wraps at the corpus boundary so every batch is full. With `shuffle` the
/// visit order is a seeded permutation; with `reshuffle` a fresh permutation
/// is drawn per wrap (seed + wrap count, so the stream is still fully
/// deterministic). `reset` replays the stream from its initial state.
pub struct CorpusReader {
    corpus: Corpus,
    config: CorpusConfig,
    order: Vec<usize>,
    cursor: usize,
    wraps: u64,
}

impl CorpusReader {
    /// Open `path` and position the visit order per `config`.
    pub fn open<P: AsRef<Path>>(path: P, config: CorpusConfig) -> Result<Self> {
        config.validate()?;
        let corpus = Corpus::open(path.as_ref())?;

        let active = (corpus.len() * config.subset_percent as usize / 100).max(1);
        let mut reader = Self {
            corpus,
            config,
            order: Vec::new(),
            cursor: 0,
            wraps: 0,
        };
        reader.order = reader.permutation(active);
        reader.cursor = reader.config.start_index % active;
        Ok(reader)
    }

    /// Number of items in the active subset.
    pub fn active_items(&self) -> usize {
        self.order.len()
    }

    /// Width of one target row in bytes.
    pub fn target_size(&self) -> usize {
        self.corpus.target_size
    }

    fn permutation(&self, active: usize) -> Vec<usize> {
        if self.config.shuffle {
            shuffled_indices(active, self.config.seed.wrapping_add(self.wraps))
        } else {
            (0..active).collect()
        }
    }

    fn advance(&mut self) {
        self.cursor += 1;
        if self.cursor == self.order.len() {
            self.cursor = 0;
            self.wraps += 1;
            if self.config.shuffle && self.config.reshuffle {
                self.order = self.permutation(self.order.len());
            }
        }
    }
}

impl Reader for CorpusReader {
    fn read(&mut self, out: &mut BufferPair) -> Result<()> {
        out.data.begin_fill();
        out.targets.begin_fill();
        for _ in 0..self.config.batch_size {
            let index = self.order[self.cursor];
            out.data.push_item(self.corpus.item(index))?;
            out.targets.push_item(self.corpus.target(index))?;
            self.advance();
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.wraps = 0;
        self.order = self.permutation(self.order.len());
        self.cursor = self.config.start_index % self.order.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::NamedTempFile;

    fn fixture(n: usize, target_size: usize) -> NamedTempFile {
        let f = NamedTempFile::new().unwrap();
        let items: Vec<Vec<u8>> = (0..n).map(|i| vec![i as u8; 3]).collect();
        let targets: Vec<Vec<u8>> = (0..n).map(|i| vec![i as u8; target_size]).collect();
        write_corpus(f.path(), &items, &targets).unwrap();
        f
    }

    fn read_batch(reader: &mut CorpusReader, batch_size: usize) -> Vec<u8> {
        let mut pair = BufferPair::alloc(batch_size * 3, batch_size, false).unwrap();
        reader.read(&mut pair).unwrap();
        (0..batch_size)
            .map(|i| pair.data.item(i).unwrap()[0])
            .collect()
    }

    #[test]
    fn test_write_open_roundtrip() {
        let f = NamedTempFile::new().unwrap();
        write_corpus(f.path(), &[b"abc".to_vec(), b"de".to_vec()], &[[1u8], [2u8]]).unwrap();

        let corpus = Corpus::open(f.path()).unwrap();
        assert_eq!(corpus.len(), 2);
        assert_eq!(corpus.item(0), b"abc");
        assert_eq!(corpus.item(1), b"de");
        assert_eq!(corpus.target(0), &[1]);
        assert_eq!(corpus.target(1), &[2]);
    }

    #[test]
    fn test_open_rejects_bad_magic() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(b"NOPE\0\0\0\0\0\0\0\0\0\0\0\0").unwrap();
        f.flush().unwrap();
        assert!(Corpus::open(f.path()).is_err());
    }

    #[test]
    fn test_open_rejects_truncated_file() {
        let f = NamedTempFile::new().unwrap();
        write_corpus(f.path(), &[b"abcdef".to_vec()], &[[1u8]]).unwrap();
        let bytes = std::fs::read(f.path()).unwrap();
        std::fs::write(f.path(), &bytes[..bytes.len() - 3]).unwrap();
        assert!(Corpus::open(f.path()).is_err());
    }

    #[test]
    fn test_sequential_order_wraps() {
        let f = fixture(5, 1);
        let config = CorpusConfig::default().with_batch_size(4);
        let mut reader = CorpusReader::open(f.path(), config).unwrap();

        assert_eq!(read_batch(&mut reader, 4), vec![0, 1, 2, 3]);
        assert_eq!(read_batch(&mut reader, 4), vec![4, 0, 1, 2]);
    }

    #[test]
    fn test_shuffle_is_deterministic() {
        let f = fixture(16, 1);
        let config = CorpusConfig::default()
            .with_batch_size(16)
            .with_shuffle(true, false)
            .with_seed(42);

        let mut a = CorpusReader::open(f.path(), config.clone()).unwrap();
        let mut b = CorpusReader::open(f.path(), config).unwrap();
        let first = read_batch(&mut a, 16);
        assert_eq!(first, read_batch(&mut b, 16));

        // A permutation, not the identity, and not a constant.
        let mut sorted = first.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..16).collect::<Vec<u8>>());
        assert_ne!(first, (0..16).collect::<Vec<u8>>());
    }

    #[test]
    fn test_reshuffle_changes_second_pass() {
        let f = fixture(16, 1);
        let config = CorpusConfig::default()
            .with_batch_size(16)
            .with_shuffle(true, true)
            .with_seed(7);
        let mut reader = CorpusReader::open(f.path(), config).unwrap();

        let pass1 = read_batch(&mut reader, 16);
        let pass2 = read_batch(&mut reader, 16);
        assert_ne!(pass1, pass2);
    }

    #[test]
    fn test_reset_replays_stream() {
        let f = fixture(8, 1);
        let config = CorpusConfig::default()
            .with_batch_size(3)
            .with_shuffle(true, true)
            .with_seed(9);
        let mut reader = CorpusReader::open(f.path(), config).unwrap();

        let first = read_batch(&mut reader, 3);
        read_batch(&mut reader, 3);
        read_batch(&mut reader, 3); // wraps, reshuffles

        reader.reset();
        assert_eq!(read_batch(&mut reader, 3), first);
    }

    #[test]
    fn test_subset_percent_restricts_items() {
        let f = fixture(10, 1);
        let config = CorpusConfig::default()
            .with_batch_size(6)
            .with_subset_percent(50);
        let mut reader = CorpusReader::open(f.path(), config).unwrap();

        assert_eq!(reader.active_items(), 5);
        assert_eq!(read_batch(&mut reader, 6), vec![0, 1, 2, 3, 4, 0]);
    }

    #[test]
    fn test_start_index_offsets_stream() {
        let f = fixture(6, 1);
        let config = CorpusConfig::default().with_batch_size(3).with_start_index(4);
        let mut reader = CorpusReader::open(f.path(), config).unwrap();
        assert_eq!(read_batch(&mut reader, 3), vec![4, 5, 0]);
    }

    #[test]
    fn test_targets_follow_items() {
        let f = fixture(4, 2);
        let config = CorpusConfig::default().with_batch_size(2).with_start_index(1);
        let mut reader = CorpusReader::open(f.path(), config).unwrap();

        let mut pair = BufferPair::alloc(6, 4, false).unwrap();
        reader.read(&mut pair).unwrap();
        assert_eq!(pair.targets.item(0).unwrap(), &[1, 1]);
        assert_eq!(pair.targets.item(1).unwrap(), &[2, 2]);
    }

    #[test]
    fn test_config_validation() {
        let f = fixture(4, 1);
        let zero_batch = CorpusConfig::default().with_batch_size(0);
        assert!(CorpusReader::open(f.path(), zero_batch).is_err());

        let bad_subset = CorpusConfig::default().with_subset_percent(0);
        assert!(CorpusReader::open(f.path(), bad_subset).is_err());
    }

    #[test]
    fn test_read_overflows_small_buffer() {
        let f = fixture(4, 1);
        let config = CorpusConfig::default().with_batch_size(4);
        let mut reader = CorpusReader::open(f.path(), config).unwrap();

        let mut pair = BufferPair::alloc(4, 4, false).unwrap();
        assert!(reader.read(&mut pair).is_err());
    }
}
