//! Exchanging the contents of the primary and secondary slots.
//!
//! Sectors are exchanged from the highest one down, each in three steps
//! through scratch:
//!
//! 1. secondary -> scratch
//! 2. primary -> secondary
//! 3. scratch -> primary
//!
//! The step is recorded in the ledger once its copy has been read back.  Each
//! step only overwrites data that is held somewhere else, so after a reset the
//! step following the last recorded one can simply be done again.

use log::{debug, info};
use storage::Flash;

use crate::{
    slots::{erase, program, Geometry, Slot, Slots},
    status::{Ledger, SectorStatus, TrailerStore},
    Result,
};

/// Largest piece of a sector copied at a time.
const COPY_CHUNK: usize = 256;

pub(crate) struct Swapper<'a, 'f, F> {
    slots: &'a Slots<'f, F>,
    geometry: &'a Geometry,
    status: &'a TrailerStore<'f, F>,
}

impl<'a, 'f, F: Flash> Swapper<'a, 'f, F> {
    pub fn new(
        slots: &'a Slots<'f, F>,
        geometry: &'a Geometry,
        status: &'a TrailerStore<'f, F>,
    ) -> Swapper<'a, 'f, F> {
        Swapper {
            slots,
            geometry,
            status,
        }
    }

    /// Run, or continue, the exchange of the first `swap_size` bytes of the
    /// slots, tracking progress in `ledger`.
    pub fn run(&self, ledger: Ledger, swap_size: usize) -> Result<()> {
        let count = self.geometry.sectors(swap_size);
        info!("Exchanging {} sectors ({:?})", count, ledger);

        for index in (0..count).rev() {
            let mut status = self.status.sector_status(ledger, index)?;
            if status != SectorStatus::Unstarted {
                debug!("Sector {} resumes from {:?}", index, status);
            }
            while let Some(next) = status.next() {
                self.step(index, next)?;
                self.status.mark_sector(ledger, index, next)?;
                status = next;
            }
        }
        Ok(())
    }

    fn step(&self, index: usize, target: SectorStatus) -> Result<()> {
        let offset = index * self.geometry.sector_size;
        match target {
            SectorStatus::Unstarted => Ok(()),
            SectorStatus::CopiedToScratch => {
                self.copy_sector(Slot::Secondary, offset, Slot::Scratch, 0)
            }
            SectorStatus::PrimaryMoved => {
                self.copy_sector(Slot::Primary, offset, Slot::Secondary, offset)
            }
            SectorStatus::CopiedFromScratch => {
                self.copy_sector(Slot::Scratch, 0, Slot::Primary, offset)
            }
        }
    }

    /// Erase the destination sector, and copy one sector into it.
    fn copy_sector(&self, from: Slot, from_pos: usize, to: Slot, to_pos: usize) -> Result<()> {
        debug!(
            "Copy {:?}@0x{:x} -> {:?}@0x{:x}",
            from, from_pos, to, to_pos
        );
        let sector_size = self.geometry.sector_size;
        let source = self.slots.get(from);
        let dest = self.slots.get(to);

        erase(dest, to_pos, sector_size)?;
        let erased = dest.borrow().erased_value();

        let mut buf = [0u8; COPY_CHUNK];
        let buf = &mut buf[..COPY_CHUNK.min(sector_size)];
        let mut pos = 0;
        while pos < sector_size {
            source.borrow_mut().read(from_pos + pos, buf)?;
            // The destination is already erased.
            if buf.iter().any(|&b| b != erased) {
                program(dest, to_pos + pos, buf)?;
            }
            pos += buf.len();
        }
        Ok(())
    }
}
