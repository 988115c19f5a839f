use std::fs::{self, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::info;

use crate::error::WriteError;
use crate::parser::ProductRecord;

pub const EXTRACTOR: &str = concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION"));

const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Serialize)]
pub struct BatchMetadata<'a> {
    pub batch_number: u32,
    pub timestamp: DateTime<Local>,
    pub products_in_batch: usize,
    /// Watermark: rows handed to batches up to and including this one. Rows
    /// accumulated but still waiting for a later batch are not counted.
    pub total_products_so_far: usize,
    pub base_url: &'a str,
}

#[derive(Debug, Serialize)]
struct BatchFile<'a> {
    batch_metadata: BatchMetadata<'a>,
    products: &'a [ProductRecord],
}

#[derive(Debug, Serialize)]
pub struct ExtractionMetadata<'a> {
    pub timestamp: DateTime<Local>,
    pub total_products: usize,
    pub total_batches: u32,
    pub batch_size: usize,
    pub base_url: &'a str,
    pub extractor: &'a str,
}

#[derive(Debug, Serialize)]
struct RunOutput<'a> {
    extraction_metadata: ExtractionMetadata<'a>,
    products: &'a [ProductRecord],
}

/// Writes numbered batch files into a per-run folder and the final
/// consolidated file next to it. Every file is written once, never replaced.
#[derive(Debug)]
pub struct BatchWriter {
    batch_folder: PathBuf,
    final_path: PathBuf,
    base_url: String,
    batch_size: usize,
    next_batch: u32,
    written: u32,
    failed: u32,
}

impl BatchWriter {
    /// Create `batch_data_<stamp>/` under `output_dir`. Fails if a run with
    /// the same stamp already owns that folder.
    pub fn create(
        output_dir: &Path,
        started: DateTime<Local>,
        base_url: &str,
        batch_size: usize,
    ) -> Result<Self, WriteError> {
        let stamp = started.format(STAMP_FORMAT).to_string();
        let batch_folder = output_dir.join(format!("batch_data_{}", stamp));
        let final_path = output_dir.join(format!("all_products_{}.json", stamp));
        fs::create_dir_all(output_dir).map_err(|e| WriteError::io(output_dir, e))?;
        fs::create_dir(&batch_folder).map_err(|e| match e.kind() {
            ErrorKind::AlreadyExists => WriteError::AlreadyExists(batch_folder.clone()),
            _ => WriteError::io(&batch_folder, e),
        })?;

        Ok(BatchWriter {
            batch_folder,
            final_path,
            base_url: base_url.to_string(),
            batch_size,
            next_batch: 1,
            written: 0,
            failed: 0,
        })
    }

    pub fn batch_folder(&self) -> &Path {
        &self.batch_folder
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    /// Batch files successfully written.
    pub fn written(&self) -> u32 {
        self.written
    }

    pub fn failed(&self) -> u32 {
        self.failed
    }

    /// Write one batch. The sequence number is consumed even when the write
    /// fails, so later batches never reuse it.
    pub fn write_batch(
        &mut self,
        products: &[ProductRecord],
        total_so_far: usize,
    ) -> Result<PathBuf, WriteError> {
        let batch_number = self.next_batch;
        self.next_batch += 1;

        let path = self
            .batch_folder
            .join(format!("batch_{:03}.json", batch_number));
        let doc = BatchFile {
            batch_metadata: BatchMetadata {
                batch_number,
                timestamp: Local::now(),
                products_in_batch: products.len(),
                total_products_so_far: total_so_far,
                base_url: &self.base_url,
            },
            products,
        };

        match write_json_once(&path, &doc) {
            Ok(()) => {
                self.written += 1;
                info!(
                    "Batch {} saved to {} ({} products, {} so far)",
                    batch_number,
                    path.display(),
                    products.len(),
                    total_so_far
                );
                Ok(path)
            }
            Err(e) => {
                self.failed += 1;
                Err(e)
            }
        }
    }

    /// Write the consolidated file with every accumulated product.
    pub fn write_final(&self, products: &[ProductRecord]) -> Result<PathBuf, WriteError> {
        let doc = RunOutput {
            extraction_metadata: ExtractionMetadata {
                timestamp: Local::now(),
                total_products: products.len(),
                total_batches: self.written,
                batch_size: self.batch_size,
                base_url: &self.base_url,
                extractor: EXTRACTOR,
            },
            products,
        };
        write_json_once(&self.final_path, &doc)?;
        info!(
            "Final consolidated data saved to {} ({} products, {} batches)",
            self.final_path.display(),
            products.len(),
            self.written
        );
        Ok(self.final_path.clone())
    }
}

/// Pretty JSON to a temp sibling, then rename into place. Refuses to replace
/// an existing file.
fn write_json_once<T: Serialize>(path: &Path, value: &T) -> Result<(), WriteError> {
    if path.exists() {
        return Err(WriteError::AlreadyExists(path.to_path_buf()));
    }

    let tmp = path.with_extension("json.tmp");
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&tmp)
        .map_err(|e| WriteError::io(&tmp, e))?;

    let mut out = BufWriter::new(file);
    let result = serde_json::to_writer_pretty(&mut out, value)
        .map_err(|e| WriteError::Encode {
            path: path.to_path_buf(),
            source: e,
        })
        .and_then(|()| out.flush().map_err(|e| WriteError::io(&tmp, e)));

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    drop(out);

    fs::rename(&tmp, path).map_err(|e| WriteError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn started() -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 3, 4, 5, 6, 7).unwrap()
    }

    fn rows(n: usize) -> Vec<ProductRecord> {
        (0..n)
            .map(|i| {
                let mut r = ProductRecord::empty(Utc::now());
                r.id = Some(i as i64);
                r.name = Some(format!("Product {}", i));
                r
            })
            .collect()
    }

    fn read(path: &Path) -> serde_json::Value {
        serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
    }

    #[test]
    fn names_follow_run_stamp() {
        let dir = tempfile::tempdir().unwrap();
        let w = BatchWriter::create(dir.path(), started(), "https://x.test", 10).unwrap();
        assert!(w.batch_folder().ends_with("batch_data_20250304_050607"));
        assert!(w.batch_folder().is_dir());
        assert!(w.final_path().ends_with("all_products_20250304_050607.json"));
    }

    #[test]
    fn second_run_in_same_second_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let first = BatchWriter::create(dir.path(), started(), "https://x.test", 10).unwrap();
        let err = BatchWriter::create(dir.path(), started(), "https://x.test", 10).unwrap_err();
        assert!(matches!(err, WriteError::AlreadyExists(ref p) if p == first.batch_folder()));
    }

    #[test]
    fn missing_output_dir_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("out").join("catalog");
        let w = BatchWriter::create(&nested, started(), "https://x.test", 10).unwrap();
        assert!(w.batch_folder().is_dir());
    }

    #[test]
    fn batch_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = BatchWriter::create(dir.path(), started(), "https://x.test", 10).unwrap();
        let products = rows(3);

        let first = w.write_batch(&products[..2], 2).unwrap();
        let second = w.write_batch(&products[2..], 3).unwrap();
        assert!(first.ends_with("batch_001.json"));
        assert!(second.ends_with("batch_002.json"));

        let doc = read(&second);
        let meta = &doc["batch_metadata"];
        assert_eq!(meta["batch_number"], 2);
        assert_eq!(meta["products_in_batch"], 1);
        assert_eq!(meta["total_products_so_far"], 3);
        assert_eq!(meta["base_url"], "https://x.test");
        assert!(meta["timestamp"].as_str().is_some());
        assert_eq!(doc["products"][0]["name"], "Product 2");
        assert_eq!(w.written(), 2);
    }

    #[test]
    fn final_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = BatchWriter::create(dir.path(), started(), "https://x.test", 2).unwrap();
        let products = rows(3);
        w.write_batch(&products[..2], 2).unwrap();
        w.write_batch(&products[2..], 3).unwrap();

        let path = w.write_final(&products).unwrap();
        let doc = read(&path);
        let meta = &doc["extraction_metadata"];
        assert_eq!(meta["total_products"], 3);
        assert_eq!(meta["total_batches"], 2);
        assert_eq!(meta["batch_size"], 2);
        assert_eq!(meta["extractor"], EXTRACTOR);
        assert_eq!(doc["products"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn existing_file_is_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let w = BatchWriter::create(dir.path(), started(), "https://x.test", 2).unwrap();
        fs::write(w.final_path(), "keep me").unwrap();

        let err = w.write_final(&rows(1)).unwrap_err();
        assert!(matches!(err, WriteError::AlreadyExists(_)));
        assert_eq!(fs::read_to_string(w.final_path()).unwrap(), "keep me");
    }

    #[test]
    fn failed_batch_consumes_its_number() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = BatchWriter::create(dir.path(), started(), "https://x.test", 2).unwrap();
        fs::write(w.batch_folder().join("batch_001.json"), "{}").unwrap();

        assert!(w.write_batch(&rows(1), 1).is_err());
        let next = w.write_batch(&rows(1), 2).unwrap();
        assert!(next.ends_with("batch_002.json"));
        assert_eq!(w.written(), 1);
        assert_eq!(w.failed(), 1);
    }

    #[test]
    fn no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = BatchWriter::create(dir.path(), started(), "https://x.test", 2).unwrap();
        w.write_batch(&rows(2), 2).unwrap();
        let leftovers: Vec<_> = fs::read_dir(w.batch_folder())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
