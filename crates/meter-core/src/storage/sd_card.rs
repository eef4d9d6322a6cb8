use embedded_sdmmc::{Mode, SdCard, SdCardError, ShortFileName, TimeSource, VolumeIdx, VolumeManager};
use heapless::String;
use log::debug;

extern crate alloc;
use alloc::vec::Vec;

use super::{FaultKind, KeyValueStore};

type SdError = embedded_sdmmc::Error<SdCardError>;

/// SD card backed key/value store, one file per key in the root directory.
///
/// Keys map to 8.3 names (`kwh` -> `KWH.DAT`). A `put` only stages the value;
/// `flush` opens, truncates, writes and closes the file so the directory
/// entry is committed before returning.
///
/// These operations are blocking. That is fine at pulse rates of a few Hz.
pub struct SdCardStore<S, D, T>
where
    S: embedded_hal::spi::SpiDevice<u8>,
    D: embedded_hal::delay::DelayNs,
    T: TimeSource,
{
    volume_mgr: VolumeManager<SdCard<S, D>, T, 4, 4, 1>,
    staged: Option<(String<12>, Vec<u8>)>,
}

impl<S, D, T> SdCardStore<S, D, T>
where
    S: embedded_hal::spi::SpiDevice<u8>,
    D: embedded_hal::delay::DelayNs,
    T: TimeSource,
{
    pub fn new(sd_card: SdCard<S, D>, ts: T) -> Self {
        let volume_mgr = VolumeManager::new(sd_card, ts);

        Self {
            volume_mgr,
            staged: None,
        }
    }

    fn file_name(key: &str) -> Result<String<12>, SdError> {
        let mut name = String::new();
        for c in key.chars().take(8) {
            name.push(c.to_ascii_uppercase())
                .map_err(|_| SdError::FilenameError(embedded_sdmmc::FilenameError::NameTooLong))?;
        }
        name.push_str(".DAT")
            .map_err(|_| SdError::FilenameError(embedded_sdmmc::FilenameError::NameTooLong))?;
        // Validate early so a bad key fails on put, not on flush
        ShortFileName::create_from_str(&name).map_err(SdError::FilenameError)?;
        Ok(name)
    }

    fn read_file(&self, name: &str) -> Result<Option<Vec<u8>>, SdError> {
        let volume0 = self.volume_mgr.open_volume(VolumeIdx(0))?;
        let root_dir = volume0.open_root_dir()?;

        let file = match root_dir.open_file_in_dir(name, Mode::ReadOnly) {
            Ok(file) => file,
            Err(SdError::NotFound) => return Ok(None),
            Err(e) => return Err(e),
        };

        let mut contents = Vec::new();
        let mut chunk = [0u8; 32];
        loop {
            let bytes_read = file.read(&mut chunk)?;
            if bytes_read == 0 {
                break; // EOF
            }
            contents.extend_from_slice(&chunk[..bytes_read]);
        }

        file.close()?;
        root_dir.close()?;
        volume0.close()?;

        Ok(Some(contents))
    }

    fn write_file(&self, name: &str, data: &[u8]) -> Result<(), SdError> {
        let volume0 = self.volume_mgr.open_volume(VolumeIdx(0))?;
        let root_dir = volume0.open_root_dir()?;
        let file = root_dir.open_file_in_dir(name, Mode::ReadWriteCreateOrTruncate)?;

        file.write(data)?;

        // Closing writes back the directory entry, which is what makes the
        // new length durable.
        file.close()?;
        root_dir.close()?;
        volume0.close()?;

        Ok(())
    }
}

impl<S, D, T> KeyValueStore for SdCardStore<S, D, T>
where
    S: embedded_hal::spi::SpiDevice<u8>,
    D: embedded_hal::delay::DelayNs,
    T: TimeSource,
{
    type Error = SdError;

    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, Self::Error> {
        let name = Self::file_name(key)?;
        if let Some((staged_name, value)) = &self.staged {
            if *staged_name == name {
                return Ok(Some(value.clone()));
            }
        }
        self.read_file(&name)
    }

    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), Self::Error> {
        let name = Self::file_name(key)?;
        if let Some((staged_name, _)) = &self.staged {
            if *staged_name != name {
                // Only one record is staged at a time; commit the other key first
                self.flush()?;
            }
        }
        self.staged = Some((name, value.to_vec()));
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        let Some((name, value)) = &self.staged else {
            return Ok(());
        };
        self.write_file(name, value)?;
        debug!("Committed {} ({} bytes) to SD card", name, value.len());
        self.staged = None;
        Ok(())
    }

    fn classify(&self, error: &Self::Error) -> FaultKind {
        match error {
            embedded_sdmmc::Error::DeviceError(_) => FaultKind::Transient,
            _ => FaultKind::Corruption,
        }
    }
}
