//! Flash-backed config region at the top of the 2 MiB XIP flash.
//!
//! The region is exactly one [`PERSISTED_CONFIG_SIZE`] erase sector, so a
//! save is a single erase-then-program pair. The embassy-rp flash driver
//! runs that pair from RAM with interrupts masked, which is what keeps
//! the XIP core from faulting while the array is busy; callers only see
//! a blocking call that must stay out of latency-sensitive paths (the
//! main loop runs it only on an explicit persist request).

use embassy_rp::flash::{Blocking, Error as FlashError, Flash};
use embassy_rp::peripherals::FLASH;
use remapper_core::PERSISTED_CONFIG_SIZE;

/// Total flash on the Pico-class boards this targets.
pub const FLASH_SIZE: usize = 2 * 1024 * 1024;

/// Byte offset of the config sector.
pub const CONFIG_OFFSET: u32 = (FLASH_SIZE - PERSISTED_CONFIG_SIZE) as u32;

/// Owner of the flash peripheral for config load/save and the board
/// unique id.
pub struct ConfigFlash<'d> {
    flash: Flash<'d, FLASH, Blocking, FLASH_SIZE>,
}

impl<'d> ConfigFlash<'d> {
    pub fn new(flash: Flash<'d, FLASH, Blocking, FLASH_SIZE>) -> Self {
        Self { flash }
    }

    /// Read the persisted config image. A read failure is reported as an
    /// all-0xFF (erased-looking) image so config loading falls back to
    /// defaults instead of propagating.
    pub fn load(&mut self, image: &mut [u8; PERSISTED_CONFIG_SIZE]) {
        if let Err(e) = self.flash.blocking_read(CONFIG_OFFSET, image) {
            defmt::warn!("config flash read failed: {}", e);
            image.fill(0xFF);
        }
    }

    /// Erase the config sector and program the new image.
    pub fn save(&mut self, image: &[u8; PERSISTED_CONFIG_SIZE]) -> Result<(), FlashError> {
        self.flash
            .blocking_erase(CONFIG_OFFSET, CONFIG_OFFSET + PERSISTED_CONFIG_SIZE as u32)?;
        self.flash.blocking_write(CONFIG_OFFSET, image)
    }

    /// 8-byte board-unique id from the flash chip, used as the USB
    /// serial number.
    pub fn unique_id(&mut self) -> [u8; 8] {
        let mut id = [0u8; 8];
        if let Err(e) = self.flash.blocking_unique_id(&mut id) {
            defmt::warn!("unique id read failed: {}", e);
        }
        id
    }
}
