use crate::error::Result;
use crate::models::Diagnostic;
use crate::retry::{RetryPolicy, Sleeper};
use crate::source::{frame_to_parquet, parquet_to_frame};
use log::{debug, error, info, warn};
use polars::prelude::*;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use zip::result::ZipError;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const ENTRY_SUFFIX: &str = ".parquet";

/// Per-scenario keyed table store: one zip archive holding one
/// zstd-compressed parquet entry per key.
///
/// The archive is opened for each operation and closed right after.
/// Every write rebuilds the archive in a sibling temporary file and
/// renames it over the old one, so readers never see a half-written store.
#[derive(Debug)]
pub struct CanonicalStore {
    path: PathBuf,
    fresh: bool,
    initialized: bool,
}

impl CanonicalStore {
    /// `fresh` replaces any existing store on the first write; otherwise
    /// new keys are added to what is already there.
    pub fn new(path: impl Into<PathBuf>, fresh: bool) -> Self {
        Self {
            path: path.into(),
            fresh,
            initialized: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // A fresh store hides the previous run's content until it is replaced.
    fn visible(&self) -> bool {
        (self.initialized || !self.fresh) && self.path.is_file()
    }

    pub fn keys(&self) -> Result<Vec<String>> {
        if !self.visible() {
            return Ok(Vec::new());
        }
        let archive = ZipArchive::new(File::open(&self.path)?)?;
        let mut keys: Vec<String> = archive
            .file_names()
            .filter_map(|name| name.strip_suffix(ENTRY_SUFFIX))
            .map(str::to_string)
            .collect();
        keys.sort();
        Ok(keys)
    }

    pub fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.keys()?.iter().any(|k| k == key))
    }

    pub fn read(&self, key: &str) -> Result<Option<DataFrame>> {
        if !self.visible() {
            return Ok(None);
        }
        let mut archive = ZipArchive::new(File::open(&self.path)?)?;
        let mut buffer = Vec::new();
        match archive.by_name(&entry_name(key)) {
            Ok(mut file) => {
                file.read_to_end(&mut buffer)?;
            }
            Err(ZipError::FileNotFound) => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        Ok(Some(parquet_to_frame(buffer)?))
    }

    /// Store `df` under `key`, replacing an existing entry of that key.
    pub fn write(&mut self, key: &str, df: &mut DataFrame) -> Result<()> {
        let payload = frame_to_parquet(df)?;
        self.rewrite(vec![(entry_name(key), payload)])?;
        debug!("Wrote {} ({} rows) to {}", key, df.height(), self.path.display());
        Ok(())
    }

    /// Store several tables with a single rewrite of the archive.
    pub fn write_batch(&mut self, tables: &mut [(String, DataFrame)]) -> Result<()> {
        let mut payloads = Vec::with_capacity(tables.len());
        for (key, df) in tables.iter_mut() {
            payloads.push((entry_name(key), frame_to_parquet(df)?));
        }
        self.rewrite(payloads)?;
        debug!("Wrote {} tables to {}", tables.len(), self.path.display());
        Ok(())
    }

    /// [`write`](Self::write) under `policy`. Permanent failure is
    /// returned as a [`Diagnostic::WriteContention`] instead of an error
    /// so the caller can move on to the next key.
    pub fn write_with_retry(
        &mut self,
        key: &str,
        df: &mut DataFrame,
        policy: &RetryPolicy,
        sleeper: &dyn Sleeper,
    ) -> std::result::Result<(), Diagnostic> {
        self.retrying(key, policy, sleeper, |store| store.write(key, df))
    }

    /// [`write_batch`](Self::write_batch) under `policy`. The diagnostic
    /// names every key of the batch.
    pub fn write_batch_with_retry(
        &mut self,
        tables: &mut [(String, DataFrame)],
        policy: &RetryPolicy,
        sleeper: &dyn Sleeper,
    ) -> std::result::Result<(), Diagnostic> {
        let label = tables.iter().map(|(key, _)| key.as_str()).collect::<Vec<_>>().join(", ");
        self.retrying(&label, policy, sleeper, |store| store.write_batch(tables))
    }

    fn retrying<F>(
        &mut self,
        key: &str,
        policy: &RetryPolicy,
        sleeper: &dyn Sleeper,
        mut op: F,
    ) -> std::result::Result<(), Diagnostic>
    where
        F: FnMut(&mut Self) -> Result<()>,
    {
        let result = policy.run(sleeper, |attempt| {
            let written = op(&mut *self);
            if written.is_ok() && attempt > 1 {
                info!("Saving {} succeeded on attempt {}", key, attempt);
            }
            written
        });

        result.map_err(|exhausted| {
            error!(
                "Saving {} failed after {} attempts, will not attempt again: {}",
                key, exhausted.attempts, exhausted.last
            );
            Diagnostic::WriteContention {
                key: key.to_string(),
                attempts: exhausted.attempts,
                reason: exhausted.last.to_string(),
            }
        })
    }

    // Every rewrite copies all untouched entries, so a run costs O(keys^2)
    // in copied bytes. Batch writes where several keys are ready at once.
    fn rewrite(&mut self, payloads: Vec<(String, Vec<u8>)>) -> Result<()> {
        self.initialize()?;

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let staged = NamedTempFile::new_in(&dir)?;
        {
            let mut writer = ZipWriter::new(staged.as_file());
            if self.path.is_file() {
                let mut existing = ZipArchive::new(File::open(&self.path)?)?;
                for i in 0..existing.len() {
                    let file = existing.by_index_raw(i)?;
                    if payloads.iter().any(|(entry, _)| entry == file.name()) {
                        continue;
                    }
                    writer.raw_copy_file(file)?;
                }
            }
            // Parquet pages are already compressed.
            let options = FileOptions::default().compression_method(CompressionMethod::Stored);
            for (entry, payload) in &payloads {
                writer.start_file(entry.as_str(), options)?;
                writer.write_all(payload)?;
            }
            writer.finish()?;
        }
        staged.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }

    fn initialize(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        if self.path.is_file() {
            if self.fresh {
                info!("Replacing existing store {}", self.path.display());
                fs::remove_file(&self.path)?;
            } else {
                warn!(
                    "Store {} already exists; new keys will be added to it",
                    self.path.display()
                );
            }
        }
        self.initialized = true;
        Ok(())
    }
}

fn entry_name(key: &str) -> String {
    format!("{}{}", key, ENTRY_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::tests::RecordingSleeper;
    use std::time::Duration;
    use tempfile::TempDir;

    fn generation() -> DataFrame {
        df!(
            "timestamp" => &["t0", "t0"],
            "tech" => &["Gas-CC", "Wind"],
            "gen_name" => &["GAS_1", "WIND_1"],
            "value" => &[100.0, 15.0]
        )
        .unwrap()
    }

    fn values(df: &DataFrame) -> Vec<f64> {
        df.column("value").unwrap().f64().unwrap().into_no_null_iter().collect()
    }

    #[test]
    fn test_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut store = CanonicalStore::new(dir.path().join("Base").join("Base_formatted.zip"), true);

        let mut table = generation();
        store.write("generator_Generation", &mut table).unwrap();

        let back = store.read("generator_Generation").unwrap().expect("stored table");
        assert!(back.frame_equal(&table));
        assert_eq!(back.shape(), (2, 4));
        assert_eq!(values(&back), vec![100.0, 15.0]);
        assert!(store.read("generator_Curtailment").unwrap().is_none());
        assert_eq!(store.keys().unwrap(), vec!["generator_Generation"]);
    }

    #[test]
    fn test_rewriting_a_key_replaces_it() {
        let dir = TempDir::new().unwrap();
        let mut store = CanonicalStore::new(dir.path().join("store.zip"), true);

        store.write("region_Load", &mut generation()).unwrap();
        store
            .write("generator_Generation", &mut generation())
            .unwrap();
        let mut smaller = generation().head(Some(1));
        store.write("region_Load", &mut smaller).unwrap();

        assert_eq!(store.keys().unwrap(), vec!["generator_Generation", "region_Load"]);
        assert_eq!(store.read("region_Load").unwrap().unwrap().height(), 1);
        assert_eq!(store.read("generator_Generation").unwrap().unwrap().height(), 2);
    }

    #[test]
    fn test_fresh_store_replaces_previous_run() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.zip");
        CanonicalStore::new(&path, true)
            .write("region_Load", &mut generation())
            .unwrap();

        let mut fresh = CanonicalStore::new(&path, true);
        assert!(!fresh.contains("region_Load").unwrap());
        fresh.write("zone_Load", &mut generation()).unwrap();
        assert_eq!(fresh.keys().unwrap(), vec!["zone_Load"]);

        let mut appended = CanonicalStore::new(&path, false);
        assert!(appended.contains("zone_Load").unwrap());
        appended.write("region_Load", &mut generation()).unwrap();
        assert_eq!(appended.keys().unwrap(), vec!["region_Load", "zone_Load"]);
    }

    #[test]
    fn test_batch_write_replaces_and_adds() {
        let dir = TempDir::new().unwrap();
        let mut store = CanonicalStore::new(dir.path().join("store.zip"), true);
        store.write("region_Load", &mut generation()).unwrap();

        let mut batch = vec![
            ("metadata_regions".to_string(), generation()),
            ("region_Load".to_string(), generation().head(Some(1))),
        ];
        store.write_batch(&mut batch).unwrap();

        assert_eq!(store.keys().unwrap(), vec!["metadata_regions", "region_Load"]);
        assert_eq!(store.read("region_Load").unwrap().unwrap().height(), 1);
        assert!(store
            .read("metadata_regions")
            .unwrap()
            .unwrap()
            .frame_equal(&generation()));
    }

    #[test]
    fn test_unwritable_store_reports_contention() {
        let dir = TempDir::new().unwrap();
        // A directory in place of the archive cannot be replaced.
        let path = dir.path().join("locked.zip");
        fs::create_dir_all(&path).unwrap();

        let sleeper = RecordingSleeper::default();
        let mut store = CanonicalStore::new(&path, false);
        let outcome = store.write_with_retry(
            "region_Load",
            &mut generation(),
            &RetryPolicy::store_contention(),
            &sleeper,
        );

        match outcome {
            Err(Diagnostic::WriteContention { key, attempts, .. }) => {
                assert_eq!(key, "region_Load");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected write contention, got {:?}", other),
        }
        assert_eq!(
            *sleeper.slept.borrow(),
            vec![Duration::from_secs(30), Duration::from_secs(60)]
        );
    }
}
