//! MLX90614 infrared thermometer driver.
//!
//! Reads the object temperature register over SMBus and validates the
//! packet error code before a reading is accepted. A reply that fails PEC
//! validation is reported as [`BusError::ChecksumMismatch`] so the hub can
//! keep the last-known-good sample.

use crc::{CRC_8_SMBUS, Crc};
use log::trace;

use crate::bus::{BusError, BusGuard, BusTransport};
use crate::sensors::{Probe, TemperatureReading};

/// Factory default SMBus address.
pub const MLX90614_ADDR: u8 = 0x5A;

/// RAM register holding the object temperature (Tobj1).
const CMD_TOBJ1: u8 = 0x07;

/// Scale of the raw register value, in Kelvin per LSB.
const KELVIN_PER_LSB: f32 = 0.02;

const ZERO_CELSIUS_KELVIN: f32 = 273.15;

const PEC: Crc<u8> = Crc::<u8>::new(&CRC_8_SMBUS);

pub struct Mlx90614 {
    address: u8,
}

impl Mlx90614 {
    pub const fn new() -> Self {
        Self {
            address: MLX90614_ADDR,
        }
    }
}

impl Default for Mlx90614 {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: BusTransport> Probe<B> for Mlx90614 {
    type Reading = TemperatureReading;

    async fn read(
        &mut self,
        bus: &mut BusGuard<'_, B>,
    ) -> Result<TemperatureReading, BusError> {
        let mut buf = [0u8; 3];
        bus.write_then_read(self.address, &[CMD_TOBJ1], &mut buf)
            .await?;
        let [lsb, msb, pec] = buf;

        // The PEC covers the full SMBus byte stream of the read word
        // transaction, both address phases included.
        let expected = PEC.checksum(&[
            self.address << 1,
            CMD_TOBJ1,
            (self.address << 1) | 1,
            lsb,
            msb,
        ]);
        if pec != expected {
            return Err(BusError::ChecksumMismatch);
        }

        let raw = u16::from_le_bytes([lsb, msb]);
        // The device raises the high bit of the data word to flag an
        // internal measurement fault.
        if raw & 0x8000 != 0 {
            return Err(BusError::Nack);
        }

        let celsius = f32::from(raw) * KELVIN_PER_LSB - ZERO_CELSIUS_KELVIN;
        trace!("mlx90614 raw {raw:#06x} -> {celsius:.2} C");
        Ok(TemperatureReading { celsius })
    }
}
