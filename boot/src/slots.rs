//! The flash areas the bootloader works with.

use core::cell::RefCell;

use log::{info, warn};
use storage::Flash;

use crate::{
    status::{SlotInfo, StatusLayout, MAX_WRITE_SIZE},
    Error, Result,
};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Slot {
    /// The slot images are run from.
    Primary,
    /// The slot new images are downloaded into.
    Secondary,
    /// Holds one sector while it is being exchanged.
    Scratch,
}

/// The three flash areas.  They are shared, so that the caller can keep
/// using the devices once the bootloader is done.
pub struct Slots<'f, F> {
    pub primary: &'f RefCell<F>,
    pub secondary: &'f RefCell<F>,
    pub scratch: &'f RefCell<F>,
}

impl<'f, F> Slots<'f, F> {
    pub fn new(
        primary: &'f RefCell<F>,
        secondary: &'f RefCell<F>,
        scratch: &'f RefCell<F>,
    ) -> Slots<'f, F> {
        Slots {
            primary,
            secondary,
            scratch,
        }
    }

    pub fn get(&self, slot: Slot) -> &'f RefCell<F> {
        match slot {
            Slot::Primary => self.primary,
            Slot::Secondary => self.secondary,
            Slot::Scratch => self.scratch,
        }
    }
}

/// The sizes everything else is derived from.
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    /// The unit of the swap, the largest erase size of the three areas.
    pub sector_size: usize,
    /// Bytes at the start of each slot that images may occupy.
    pub image_area: usize,
    pub primary: StatusLayout,
    pub secondary: StatusLayout,
}

impl Geometry {
    pub fn from_slots<F: Flash>(slots: &Slots<'_, F>) -> Result<Geometry> {
        let primary = SlotInfo::from_flash(&*slots.primary.borrow());
        let secondary = SlotInfo::from_flash(&*slots.secondary.borrow());
        let scratch = SlotInfo::from_flash(&*slots.scratch.borrow());

        for info in [&primary, &secondary, &scratch] {
            if !info.erase_size.is_power_of_two() {
                warn!("Erase size {} is not a power of two", info.erase_size);
                return Err(Error::InvalidLayout);
            }
        }
        let sector_size = primary
            .erase_size
            .max(secondary.erase_size)
            .max(scratch.erase_size);

        if scratch.capacity < sector_size
            || !scratch.write_size.is_power_of_two()
            || scratch.write_size > MAX_WRITE_SIZE
        {
            warn!("Scratch area cannot hold a sector of {} bytes", sector_size);
            return Err(Error::InvalidLayout);
        }

        let primary = primary.status_layout(sector_size)?;
        let secondary = secondary.status_layout(sector_size)?;
        let image_area = primary.trailer_base.min(secondary.trailer_base);

        info!(
            "Sector size 0x{:x}, image area 0x{:x}",
            sector_size, image_area
        );
        Ok(Geometry {
            sector_size,
            image_area,
            primary,
            secondary,
        })
    }

    /// Number of sectors exchanged for a swap of `swap_size` bytes.
    pub fn sectors(&self, swap_size: usize) -> usize {
        swap_size.div_ceil(self.sector_size)
    }
}

fn write_failed(e: storage::Error) -> Error {
    warn!("Flash update failed: {:?}", e);
    Error::FlashWriteFailed
}

/// Write `data` at `pos`, and read it back.
pub(crate) fn program<F: Flash>(flash: &RefCell<F>, pos: usize, data: &[u8]) -> Result<()> {
    let mut flash = flash.borrow_mut();
    flash.write(pos, data).map_err(write_failed)?;

    let mut check = [0u8; 64];
    let mut offset = 0;
    for chunk in data.chunks(check.len()) {
        let check = &mut check[..chunk.len()];
        flash.read(pos + offset, check)?;
        if check != chunk {
            warn!("Readback mismatch at 0x{:x}", pos + offset);
            return Err(Error::FlashWriteFailed);
        }
        offset += chunk.len();
    }
    Ok(())
}

/// Erase `len` bytes at `pos`.
pub(crate) fn erase<F: Flash>(flash: &RefCell<F>, pos: usize, len: usize) -> Result<()> {
    flash
        .borrow_mut()
        .erase(pos, pos + len)
        .map_err(write_failed)
}
