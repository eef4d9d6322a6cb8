//! Directory-backed key/value store standing in for the device's SD card.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use log::debug;
use meter_core::storage::{FaultKind, KeyValueStore};

/// One file per key under `dir`. Puts are staged in memory; `flush` writes
/// each staged value to a temporary file, syncs it and renames it over the
/// old one, so a crash leaves either the old or the new total on disk.
pub struct FileStore {
    dir: PathBuf,
    staged: BTreeMap<String, Vec<u8>>,
}

impl FileStore {
    pub fn open(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            staged: BTreeMap::new(),
        })
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.dat"))
    }
}

impl KeyValueStore for FileStore {
    type Error = io::Error;

    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, Self::Error> {
        if let Some(value) = self.staged.get(key) {
            return Ok(Some(value.clone()));
        }
        match fs::read(self.path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), Self::Error> {
        self.staged.insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        while let Some((key, value)) = self.staged.pop_first() {
            let path = self.path(&key);
            let tmp = path.with_extension("tmp");
            let result = (|| {
                let mut file = File::create(&tmp)?;
                file.write_all(&value)?;
                file.sync_all()?;
                fs::rename(&tmp, &path)
            })();
            if let Err(e) = result {
                // Keep it staged so the next flush tries again
                self.staged.insert(key, value);
                return Err(e);
            }
            debug!("Wrote {} ({} bytes)", path.display(), value.len());
        }
        Ok(())
    }

    fn classify(&self, error: &Self::Error) -> FaultKind {
        match error.kind() {
            ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut => {
                FaultKind::Transient
            }
            _ => FaultKind::Corruption,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn scratch_dir() -> PathBuf {
        static NEXT: AtomicU32 = AtomicU32::new(0);
        let dir = std::env::temp_dir().join(format!(
            "meter-simulator-{}-{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        ));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_missing_key_is_none() {
        let mut store = FileStore::open(scratch_dir()).unwrap();
        assert!(store.get("kwh").unwrap().is_none());
    }

    #[test]
    fn test_put_then_flush_survives_reopen() {
        let dir = scratch_dir();
        let mut store = FileStore::open(&dir).unwrap();
        store.put("kwh", b"12.345").unwrap();
        assert!(!dir.join("kwh.dat").exists());

        store.flush().unwrap();
        drop(store);

        let mut reopened = FileStore::open(&dir).unwrap();
        assert_eq!(reopened.get("kwh").unwrap().as_deref(), Some(&b"12.345"[..]));
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_meter_resumes_from_disk() {
        use meter_core::{MeterConfig, PowerMeter, Work};

        let dir = scratch_dir();
        let config = MeterConfig {
            flush_threshold: 1,
            ..MeterConfig::default()
        };

        let mut meter = PowerMeter::open(FileStore::open(&dir).unwrap(), &config).unwrap();
        meter.calibrate(10.0).unwrap();
        meter.run(Work::Pulses(5), 0);
        drop(meter);

        let meter = PowerMeter::open(FileStore::open(&dir).unwrap(), &config).unwrap();
        assert_eq!(meter.kwh(), 9.995);
        fs::remove_dir_all(dir).unwrap();
    }
}
