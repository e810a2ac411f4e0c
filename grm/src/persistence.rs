//! Spilling tile graphs to disk.
//!
//! A graph file is a header (`node count`, `band count`) followed by one record
//! per node:
//!
//! | field                         | encoding                      |
//! |-------------------------------|-------------------------------|
//! | bounding box x, y, w, h       | 4 x i32                       |
//! | perimeter, area, band count   | 3 x i32                       |
//! | mean, sum, square sum, std    | 4 x f32 per band              |
//! | id, flags, owner row, col     | 4 x i32, flags reserved (0)   |
//! | horizontal cracks             | i32 count, then (x, y) pairs  |
//! | vertical cracks               | i32 count, then (x, y) pairs  |
//!
//! Everything is 4-byte big-endian; floats are written from their bit
//! pattern, so a round trip is bit-exact. Adjacency is not stored, it is
//! rebuilt from the contours on load.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::geometry::{Contour, Crack, CrackKind, Rect};
use crate::node::{BandStats, Node};
use crate::tiling::TileKey;

/// Upper bound for capacity taken from a file header.
pub(crate) const PREALLOCATE_LIMIT: usize = 1 << 16;

type IoErrorFn = fn(PathBuf, io::Error) -> Error;

fn invalid_data(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

// =============================================================================
// Big-endian record streams
// =============================================================================

/// Buffered big-endian writer that tags I/O failures with the file path.
pub struct RecordWriter<W: Write> {
    inner: BufWriter<W>,
    path: PathBuf,
    on_error: IoErrorFn,
}

impl<W: Write> RecordWriter<W> {
    pub fn new(inner: W, path: impl Into<PathBuf>, on_error: IoErrorFn) -> Self {
        Self {
            inner: BufWriter::new(inner),
            path: path.into(),
            on_error,
        }
    }

    fn fail(&self, source: io::Error) -> Error {
        (self.on_error)(self.path.clone(), source)
    }

    pub fn write_i32(&mut self, value: i32) -> Result<()> {
        self.inner
            .write_all(&value.to_be_bytes())
            .map_err(|e| self.fail(e))
    }

    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        let value = i32::try_from(value)
            .map_err(|_| self.fail(invalid_data(format!("{value} does not fit a record field"))))?;
        self.write_i32(value)
    }

    pub fn write_f32(&mut self, value: f32) -> Result<()> {
        self.inner
            .write_all(&value.to_bits().to_be_bytes())
            .map_err(|e| self.fail(e))
    }

    pub fn write_node(&mut self, node: &Node) -> Result<()> {
        let bbox = node.bbox;
        for value in [bbox.x, bbox.y, bbox.width, bbox.height] {
            self.write_u32(value)?;
        }
        self.write_u32(node.perimeter)?;
        self.write_u32(node.area)?;
        self.write_u32(node.bands.len() as u32)?;
        for band in &node.bands {
            self.write_f32(band.mean)?;
            self.write_f32(band.sum)?;
            self.write_f32(band.square_sum)?;
            self.write_f32(band.std)?;
        }

        self.write_u32(node.id)?;
        self.write_i32(0)?;
        self.write_u32(node.owner.row)?;
        self.write_u32(node.owner.col)?;
        for kind in [CrackKind::Horizontal, CrackKind::Vertical] {
            let count = node
                .contour
                .cracks()
                .iter()
                .filter(|crack| crack.kind == kind)
                .count();
            self.write_u32(count as u32)?;
            for crack in node.contour.cracks().iter().filter(|crack| crack.kind == kind) {
                self.write_u32(crack.x)?;
                self.write_u32(crack.y)?;
            }
        }
        Ok(())
    }

    pub fn finish(mut self) -> Result<W> {
        self.inner.flush().map_err(|e| self.fail(e))?;
        let path = self.path;
        let on_error = self.on_error;
        self.inner
            .into_inner()
            .map_err(|e| on_error(path, e.into_error()))
    }
}

/// Buffered big-endian reader; a short read surfaces as `UnexpectedEof`.
pub struct RecordReader<R: Read> {
    inner: BufReader<R>,
    path: PathBuf,
    on_error: IoErrorFn,
}

impl<R: Read> RecordReader<R> {
    pub fn new(inner: R, path: impl Into<PathBuf>, on_error: IoErrorFn) -> Self {
        Self {
            inner: BufReader::new(inner),
            path: path.into(),
            on_error,
        }
    }

    fn fail(&self, source: io::Error) -> Error {
        (self.on_error)(self.path.clone(), source)
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        let mut buf = [0u8; 4];
        self.inner.read_exact(&mut buf).map_err(|e| self.fail(e))?;
        Ok(i32::from_be_bytes(buf))
    }

    /// Reads a non-negative integer.
    pub fn read_u32(&mut self) -> Result<u32> {
        let value = self.read_i32()?;
        u32::try_from(value)
            .map_err(|_| self.fail(invalid_data(format!("negative field value {value}"))))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        let mut buf = [0u8; 4];
        self.inner.read_exact(&mut buf).map_err(|e| self.fail(e))?;
        Ok(f32::from_bits(u32::from_be_bytes(buf)))
    }

    /// True when the stream has no bytes left.
    pub fn at_end(&mut self) -> Result<bool> {
        use std::io::BufRead;
        match self.inner.fill_buf() {
            Ok(buf) => Ok(buf.is_empty()),
            Err(e) => Err(self.fail(e)),
        }
    }

    pub fn read_node(&mut self, band_count: usize) -> Result<Node> {
        let bbox = Rect::new(
            self.read_u32()?,
            self.read_u32()?,
            self.read_u32()?,
            self.read_u32()?,
        );
        let perimeter = self.read_u32()?;
        let area = self.read_u32()?;
        let components = self.read_u32()? as usize;
        if components != band_count {
            return Err(Error::BandCountMismatch {
                expected: band_count,
                found: components,
            });
        }
        let mut bands = Vec::with_capacity(band_count);
        for _ in 0..band_count {
            bands.push(BandStats {
                mean: self.read_f32()?,
                sum: self.read_f32()?,
                square_sum: self.read_f32()?,
                std: self.read_f32()?,
            });
        }

        let id = self.read_u32()?;
        let flags = self.read_i32()?;
        if flags != 0 {
            return Err(self.fail(invalid_data(format!("node {id} has reserved flags {flags:#x}"))));
        }
        let owner = TileKey::new(self.read_u32()?, self.read_u32()?);

        let mut cracks = Vec::new();
        for kind in [CrackKind::Horizontal, CrackKind::Vertical] {
            let count = self.read_u32()?;
            for _ in 0..count {
                let (x, y) = (self.read_u32()?, self.read_u32()?);
                cracks.push(Crack { y, x, kind });
            }
        }
        cracks.sort_unstable();
        let contour = Contour::from_sorted(cracks)
            .ok_or_else(|| self.fail(invalid_data(format!("duplicate cracks in node {id}"))))?;
        let anchor = contour
            .anchor()
            .ok_or_else(|| self.fail(invalid_data(format!("node {id} has an empty contour"))))?;

        Ok(Node {
            id,
            anchor,
            owner,
            bbox,
            contour,
            perimeter,
            area,
            bands,
        })
    }
}

/// Writes a complete graph file.
pub fn write_graph<W: Write>(writer: &mut RecordWriter<W>, band_count: usize, nodes: &[Node]) -> Result<()> {
    writer.write_u32(nodes.len() as u32)?;
    writer.write_u32(band_count as u32)?;
    for node in nodes {
        writer.write_node(node)?;
    }
    Ok(())
}

/// Reads a complete graph file written for `band_count` bands.
pub fn read_graph<R: Read>(reader: &mut RecordReader<R>, band_count: usize) -> Result<Vec<Node>> {
    let count = reader.read_u32()? as usize;
    let found = reader.read_u32()? as usize;
    if found != band_count {
        return Err(Error::BandCountMismatch {
            expected: band_count,
            found,
        });
    }
    let mut nodes = Vec::with_capacity(count.min(PREALLOCATE_LIMIT));
    for _ in 0..count {
        nodes.push(reader.read_node(band_count)?);
    }
    Ok(nodes)
}

// =============================================================================
// Graph store
// =============================================================================

/// Working directory of a run holding one graph file per tile.
///
/// The directory is unique per run and removed when the store is dropped.
#[derive(Debug)]
pub struct GraphStore {
    dir: PathBuf,
    band_count: usize,
}

impl GraphStore {
    /// Creates `grm-<uuid>` under `parent`, or under the system temp directory.
    pub fn create(parent: Option<&Path>, band_count: usize) -> Result<Self> {
        let parent = parent.map_or_else(std::env::temp_dir, Path::to_path_buf);
        let dir = parent.join(format!("grm-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).map_err(|source| Error::CreateWorkDir {
            path: dir.clone(),
            source,
        })?;
        debug!(dir = %dir.display(), "Created graph store");
        Ok(Self { dir, band_count })
    }

    #[inline]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[inline]
    pub fn band_count(&self) -> usize {
        self.band_count
    }

    pub fn graph_path(&self, key: TileKey) -> PathBuf {
        self.dir.join(format!("tile_{}_{}.bin", key.row, key.col))
    }

    pub fn labels_path(&self, key: TileKey) -> PathBuf {
        self.dir.join(format!("labels_{}_{}.bin", key.row, key.col))
    }

    /// Graph of `key` for the next stitching pass, not yet visible to readers.
    pub fn staged_path(&self, key: TileKey) -> PathBuf {
        self.dir.join(format!("tile_{}_{}.next.bin", key.row, key.col))
    }

    /// Replaces the graph of `key`.
    ///
    /// The file is written next to its destination and renamed into place, so
    /// a reader never observes a partial graph.
    pub fn save(&self, key: TileKey, nodes: &[Node]) -> Result<()> {
        self.write_to(&self.graph_path(key), nodes)
    }

    /// Writes the next graph of `key` without touching the current one.
    pub fn save_staged(&self, key: TileKey, nodes: &[Node]) -> Result<()> {
        self.write_to(&self.staged_path(key), nodes)
    }

    /// Makes the staged graph of `key` current.
    pub fn commit_staged(&self, key: TileKey) -> Result<()> {
        let path = self.graph_path(key);
        fs::rename(self.staged_path(key), &path).map_err(|source| Error::WriteGraph { path, source })
    }

    fn write_to(&self, path: &Path, nodes: &[Node]) -> Result<()> {
        let partial = path.with_extension("partial");
        let write_graph_error = |path: PathBuf, source: io::Error| Error::WriteGraph { path, source };

        let file = File::create(&partial).map_err(|source| write_graph_error(partial.clone(), source))?;
        let mut writer = RecordWriter::new(file, &partial, write_graph_error);
        write_graph(&mut writer, self.band_count, nodes)?;
        writer.finish()?;
        fs::rename(&partial, path).map_err(|source| write_graph_error(path.to_path_buf(), source))?;
        Ok(())
    }

    pub fn load(&self, key: TileKey) -> Result<Vec<Node>> {
        let path = self.graph_path(key);
        let read_graph_error = |path: PathBuf, source: io::Error| Error::ReadGraph { path, source };
        let file = File::open(&path).map_err(|source| read_graph_error(path.clone(), source))?;
        let mut reader = RecordReader::new(file, &path, read_graph_error);
        let nodes = read_graph(&mut reader, self.band_count)?;
        if !reader.at_end()? {
            return Err(read_graph_error(path, invalid_data("trailing bytes after last node")));
        }
        Ok(nodes)
    }

    pub fn exists(&self, key: TileKey) -> bool {
        self.graph_path(key).exists()
    }

    /// Deletes the graph of `key`; a missing file is not an error.
    pub fn remove(&self, key: TileKey) -> Result<()> {
        let path = self.graph_path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(Error::WriteGraph { path, source }),
        }
    }
}

impl Drop for GraphStore {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_dir_all(&self.dir) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(dir = %self.dir.display(), error = %err, "Failed to remove graph store");
            }
        }
    }
}
