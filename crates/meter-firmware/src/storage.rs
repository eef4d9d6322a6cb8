//! SD card bring-up for the counter store.

use embedded_hal_bus::spi::{ExclusiveDevice, NoDelay};
use embedded_sdmmc::{SdCard, TimeSource, Timestamp};
use esp_hal::Blocking;
use esp_hal::delay::Delay;
use esp_hal::gpio::{AnyPin, Level, Output, OutputConfig};
use esp_hal::peripherals::SPI2;
use esp_hal::spi::master::{Config, Spi};
use esp_hal::time::Rate;
use log::info;
use meter_core::storage::SdCardStore;

pub type SdSpi = ExclusiveDevice<Spi<'static, Blocking>, Output<'static>, NoDelay>;

pub type MeterStore = SdCardStore<SdSpi, Delay, FixedTimeSource>;

/// FAT timestamps for files the meter writes.
///
/// The RTC is not synced when the store is opened, and nothing reads these
/// back, so every file gets the same date.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedTimeSource;

impl TimeSource for FixedTimeSource {
    fn get_timestamp(&self) -> Timestamp {
        Timestamp {
            year_since_1970: 55,
            zero_indexed_month: 0,
            zero_indexed_day: 0,
            hours: 0,
            minutes: 0,
            seconds: 0,
        }
    }
}

pub struct SdCardPins {
    pub sck: AnyPin<'static>,
    pub mosi: AnyPin<'static>,
    pub miso: AnyPin<'static>,
    pub cs: AnyPin<'static>,
}

/// Build the counter store on an SD card wired to SPI2.
pub fn init_sd_card(spi: SPI2<'static>, pins: SdCardPins) -> MeterStore {
    // Cards must be initialised at 400 kHz or less
    let spi_bus = Spi::new(spi, Config::default().with_frequency(Rate::from_khz(400)))
        .expect("Failed to configure SD card SPI bus")
        .with_sck(pins.sck)
        .with_mosi(pins.mosi)
        .with_miso(pins.miso);

    let cs = Output::new(pins.cs, Level::High, OutputConfig::default());
    let spi_device =
        ExclusiveDevice::new_no_delay(spi_bus, cs).expect("Failed to create SD card SPI device");

    let sd_card = SdCard::new(spi_device, Delay::new());
    info!("SD card store ready");
    SdCardStore::new(sd_card, FixedTimeSource)
}
