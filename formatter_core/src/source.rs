use crate::error::{FormatterError, Result};
use crate::models::{Category, Timescale};
use log::debug;
use polars::prelude::*;
use std::fs::File;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use zip::result::ZipError;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Read access to the raw results of one simulation partition.
pub trait ResultSource {
    /// Short name used in diagnostics.
    fn name(&self) -> &str;

    /// Raw table for `(category, property)` at the given timescale, or
    /// `None` when the partition does not report that property.
    fn query(&self, category: Category, property: &str, timescale: Timescale) -> Result<Option<DataFrame>>;

    /// `parent`/`child` membership table such as `region_generators`.
    fn relation(&self, name: &str) -> Result<Option<DataFrame>>;

    /// `name`/`category` object listing for a class such as `generator`.
    fn objects(&self, class: &str) -> Result<Option<DataFrame>>;
}

/// A partition stored as a zip archive of parquet tables.
pub struct ZipPartition {
    path: PathBuf,
    name: String,
}

impl ZipPartition {
    /// Open a partition archive, failing if it is not a readable zip file.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        ZipArchive::new(file).map_err(|source| FormatterError::Partition {
            path: path.to_path_buf(),
            source,
        })?;

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());

        Ok(Self {
            path: path.to_path_buf(),
            name,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_entry(&self, entry: &str) -> Result<Option<DataFrame>> {
        let mut archive = ZipArchive::new(File::open(&self.path)?)?;
        let mut buffer = Vec::new();

        match archive.by_name(entry) {
            Ok(mut file) => {
                file.read_to_end(&mut buffer)?;
            }
            Err(ZipError::FileNotFound) => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        debug!("Read {} ({} bytes) from {}", entry, buffer.len(), self.name);
        Ok(Some(parquet_to_frame(buffer)?))
    }
}

impl ResultSource for ZipPartition {
    fn name(&self) -> &str {
        &self.name
    }

    fn query(&self, category: Category, property: &str, timescale: Timescale) -> Result<Option<DataFrame>> {
        self.read_entry(&data_entry(timescale, category.source_class(), property))
    }

    fn relation(&self, name: &str) -> Result<Option<DataFrame>> {
        self.read_entry(&format!("metadata/relations/{}.parquet", name))
    }

    fn objects(&self, class: &str) -> Result<Option<DataFrame>> {
        self.read_entry(&format!("metadata/objects/{}.parquet", class))
    }
}

/// Assembles partition archives in the layout [`ZipPartition`] reads.
pub struct PartitionWriter {
    writer: ZipWriter<File>,
}

impl PartitionWriter {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            writer: ZipWriter::new(File::create(path)?),
        })
    }

    pub fn add_table(
        &mut self,
        timescale: Timescale,
        class: &str,
        property: &str,
        df: &mut DataFrame,
    ) -> Result<()> {
        self.add_entry(&data_entry(timescale, class, property), df)
    }

    pub fn add_relation(&mut self, name: &str, df: &mut DataFrame) -> Result<()> {
        self.add_entry(&format!("metadata/relations/{}.parquet", name), df)
    }

    pub fn add_objects(&mut self, class: &str, df: &mut DataFrame) -> Result<()> {
        self.add_entry(&format!("metadata/objects/{}.parquet", class), df)
    }

    pub fn finish(mut self) -> Result<()> {
        self.writer.finish()?;
        Ok(())
    }

    fn add_entry(&mut self, entry: &str, df: &mut DataFrame) -> Result<()> {
        let payload = frame_to_parquet(df)?;
        // Parquet pages are already compressed.
        let options = FileOptions::default().compression_method(CompressionMethod::Stored);
        self.writer.start_file(entry, options)?;
        self.writer.write_all(&payload)?;
        Ok(())
    }
}

fn data_entry(timescale: Timescale, class: &str, property: &str) -> String {
    format!("data/{}/{}/{}.parquet", timescale, class, property)
}

pub(crate) fn frame_to_parquet(df: &mut DataFrame) -> PolarsResult<Vec<u8>> {
    let mut buffer = Vec::new();
    ParquetWriter::new(&mut buffer)
        .with_compression(ParquetCompression::Zstd(None))
        .finish(df)?;
    Ok(buffer)
}

pub(crate) fn parquet_to_frame(bytes: Vec<u8>) -> PolarsResult<DataFrame> {
    ParquetReader::new(Cursor::new(bytes)).finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn generation_table() -> DataFrame {
        df!(
            "timestamp" => &["2024-01-01 00:00", "2024-01-01 01:00"],
            "category" => &["Gas-CC", "Gas-CC"],
            "name" => &["GEN_1", "GEN_1"],
            "property" => &["Generation", "Generation"],
            "band" => &["1", "1"],
            "value" => &[120.0, 95.5]
        )
        .unwrap()
    }

    #[test]
    fn test_partition_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model_2024.zip");

        let mut writer = PartitionWriter::create(&path).unwrap();
        writer
            .add_table(Timescale::Interval, "generator", "Generation", &mut generation_table())
            .unwrap();
        writer
            .add_relation(
                "region_generators",
                &mut df!("parent" => &["North"], "child" => &["GEN_1"]).unwrap(),
            )
            .unwrap();
        writer.finish().unwrap();

        let partition = ZipPartition::open(&path).unwrap();
        assert_eq!(partition.name(), "model_2024.zip");

        let raw = partition
            .query(Category::Generator, "Generation", Timescale::Interval)
            .unwrap()
            .expect("generation table");
        assert_eq!(raw.height(), 2);
        assert_eq!(raw.column("value").unwrap().f64().unwrap().get(1), Some(95.5));

        let relation = partition.relation("region_generators").unwrap().unwrap();
        assert_eq!(relation.column("parent").unwrap().utf8().unwrap().get(0), Some("North"));
    }

    #[test]
    fn test_missing_entries_are_none() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.zip");
        PartitionWriter::create(&path).unwrap().finish().unwrap();

        let partition = ZipPartition::open(&path).unwrap();
        assert!(partition
            .query(Category::Region, "Load", Timescale::Interval)
            .unwrap()
            .is_none());
        assert!(partition.relation("zone_generators").unwrap().is_none());
        assert!(partition.objects("line").unwrap().is_none());
    }

    #[test]
    fn test_interface_reads_line_class() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lines.zip");
        let mut table = df!(
            "timestamp" => &["2024-01-01 00:00"],
            "category" => &["North-South"],
            "name" => &["IF_1"],
            "property" => &["Flow"],
            "band" => &["1"],
            "value" => &[42.0]
        )
        .unwrap();

        let mut writer = PartitionWriter::create(&path).unwrap();
        writer.add_table(Timescale::Interval, "line", "Flow", &mut table).unwrap();
        writer.finish().unwrap();

        let partition = ZipPartition::open(&path).unwrap();
        assert!(partition
            .query(Category::Interface, "Flow", Timescale::Interval)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_corrupt_archive_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.zip");
        std::fs::write(&path, b"not a zip archive").unwrap();

        match ZipPartition::open(&path) {
            Err(FormatterError::Partition { path: failed, .. }) => assert_eq!(failed, path),
            other => panic!("expected partition error, got {:?}", other.err()),
        }
    }
}
