//! Image upgrade status
//!
//! The image upgrade keeps track of its progress through a set of 'status' data
//! that is represented at the end of the primary and secondary slots.  This
//! trailer starts on a sector boundary and is never part of the swapped region.
//!
//! The status represents one of a small number of states that we can be in:
//!
//! - None. The images are just present, and we aren't expecting to do an
//!   upgrade.
//! - Request. A new image is in the upgrade slot, and it has been marked for
//!   an upgrade (magic in the secondary trailer, image ok for a permanent one).
//! - Started. The primary trailer records the swap size and type.
//! - Copy done.  The swap itself is finished.
//! - Image ok.  The image is valid, and a revert will not be attempted.
//! - Revert / Revert done.  An unconfirmed test image is being swapped back.
//!
//! Every field is written once between erases, going from erased to set, so a
//! reset in the middle of a write can only ever leave the old value or the new
//! one.  A trailer is only created by erasing the region, writing the fields,
//! and writing the magic last.
//!
//! The primary trailer is laid out as follows (high address at the top, each
//! field starts on a write boundary and is padded to one):
//!
//! +--------------------------------+
//! | magic
//! | meta: swap size, swap type, version, log2 sector and write size
//! | flag - copy done
//! | flag - image ok
//! | flag - revert
//! | flag - revert done
//! | revert ledger: 3 flags per sector
//! | forward ledger: 3 flags per sector
//! |   .. pad down to a sector boundary ..
//! +--------------------------------+
//!
//! The secondary trailer uses the same layout, but only ever holds the magic
//! and image ok, as a request from the application.
//!
//! Each ledger entry records how far the exchange of that sector got, see
//! `SectorStatus`.  A flag is a single 0x01 byte followed by erased padding, so
//! a partially written flag still reads as either erased or set.

use core::{cell::RefCell, mem::size_of};

use asraw::{AsMutRaw, AsRaw};
use log::{debug, warn};
use storage::Flash;

use crate::{
    resolve::{SwapRequest, SwapType},
    slots::{erase, program},
    Error, Result,
};

/// The magic value written last into a trailer.
pub const BOOT_MAGIC: [u8; 16] = [
    0x77, 0xc2, 0x95, 0xf3, 0x60, 0xd2, 0xef, 0x7f, 0x35, 0x52, 0x50, 0x0f, 0x2c, 0xb6, 0x79,
    0x80,
];

/// The largest write size the trailer format supports.  Devices that write
/// in larger pages would need a paged status format.
pub const MAX_WRITE_SIZE: usize = 32;

/// Format version kept in the meta data.
const TRAILER_VERSION: u8 = 1;

/// Value of the first byte of a set flag.
const FLAG_SET: u8 = 0x01;

/// Checkpoints recorded for each sector.
const STAGES: usize = 3;

/// Information needed to calculate status layout.
#[derive(Debug, Clone, Copy)]
pub struct SlotInfo {
    /// Device write size.
    pub write_size: usize,
    /// Device erase size.
    pub erase_size: usize,
    /// Size of full flash slot.
    pub capacity: usize,
    /// Value of erased bytes.
    pub erased: u8,
}

impl SlotInfo {
    /// Build SlotInfo out of a flash device.
    pub fn from_flash<F: Flash>(flash: &F) -> SlotInfo {
        SlotInfo {
            write_size: flash.write_size(),
            erase_size: flash.erase_size(),
            capacity: flash.capacity(),
            erased: flash.erased_value(),
        }
    }

    /// Given our info, compute the status layout for this particular slot.
    /// `sector_size` is the unit of the swap, common to all of the slots.
    pub fn status_layout(&self, sector_size: usize) -> Result<StatusLayout> {
        let w = self.write_size;
        if !w.is_power_of_two() || w > MAX_WRITE_SIZE {
            return Err(Error::InvalidLayout);
        }
        if !sector_size.is_power_of_two()
            || sector_size < self.erase_size
            || sector_size < w
            || self.capacity == 0
            || self.capacity % sector_size != 0
        {
            return Err(Error::InvalidLayout);
        }

        let max_sectors = self.capacity / sector_size;
        let magic_unit = BOOT_MAGIC.len().next_multiple_of(w);
        let meta_unit = size_of::<TrailerMeta>().next_multiple_of(w);
        let ledger_size = max_sectors * STAGES * w;

        let mut pos = self.capacity;
        pos -= magic_unit;
        let magic_pos = pos;

        pos -= meta_unit;
        let meta_pos = pos;

        let mut flags = [0; 4];
        for flag in flags.iter_mut() {
            pos -= w;
            *flag = pos;
        }

        pos = pos.checked_sub(ledger_size).ok_or(Error::InvalidLayout)?;
        let revert_ledger = pos;
        pos = pos.checked_sub(ledger_size).ok_or(Error::InvalidLayout)?;
        let forward_ledger = pos;

        let trailer_base = pos & !(sector_size - 1);
        if trailer_base == 0 {
            // Nothing left for an image.
            return Err(Error::InvalidLayout);
        }

        Ok(StatusLayout {
            sector_size,
            write_size: w,
            erased: self.erased,
            capacity: self.capacity,
            trailer_base,
            magic_pos,
            magic_unit,
            meta_pos,
            meta_unit,
            flags,
            ledgers: [forward_ledger, revert_ledger],
            max_sectors,
        })
    }
}

/// Where each part of the trailer lives within a slot.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct StatusLayout {
    pub sector_size: usize,
    pub write_size: usize,
    pub erased: u8,
    pub capacity: usize,
    /// Start of the trailer, on a sector boundary.  Images end before this.
    pub trailer_base: usize,
    pub magic_pos: usize,
    magic_unit: usize,
    pub meta_pos: usize,
    meta_unit: usize,
    flags: [usize; 4],
    ledgers: [usize; 2],
    /// Number of sectors each ledger has room for.
    pub max_sectors: usize,
}

impl StatusLayout {
    /// Offset of a flag.
    pub fn flag_pos(&self, flag: Flag) -> usize {
        self.flags[flag as usize]
    }

    /// Offset of one checkpoint of a sector.  `stage` counts from 1.
    pub fn stage_pos(&self, ledger: Ledger, index: usize, stage: usize) -> usize {
        self.ledgers[ledger as usize] + (index * STAGES + stage - 1) * self.write_size
    }

    /// Number of sectors the trailer occupies.
    pub fn trailer_sectors(&self) -> usize {
        (self.capacity - self.trailer_base) / self.sector_size
    }
}

/// The single write unit fields of the trailer.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Flag {
    CopyDone = 0,
    ImageOk = 1,
    Revert = 2,
    RevertDone = 3,
}

/// Which of the two sector ledgers an exchange records its progress in.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Ledger {
    Forward = 0,
    Revert = 1,
}

/// How far the exchange of one sector has progressed.  Each state is one more
/// durable checkpoint than the last.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub enum SectorStatus {
    /// Nothing has been done to this sector.
    Unstarted,
    /// The secondary sector is in scratch.
    CopiedToScratch,
    /// The primary sector has been written over the secondary one.
    PrimaryMoved,
    /// Scratch has been written over the primary sector.  The sector is done.
    CopiedFromScratch,
}

impl SectorStatus {
    fn from_stages(stages: usize) -> SectorStatus {
        match stages {
            0 => SectorStatus::Unstarted,
            1 => SectorStatus::CopiedToScratch,
            2 => SectorStatus::PrimaryMoved,
            _ => SectorStatus::CopiedFromScratch,
        }
    }

    /// Number of checkpoints this state has recorded.
    pub fn stages(self) -> usize {
        self as usize
    }

    /// The checkpoint that follows this one.
    pub fn next(self) -> Option<SectorStatus> {
        match self {
            SectorStatus::Unstarted => Some(SectorStatus::CopiedToScratch),
            SectorStatus::CopiedToScratch => Some(SectorStatus::PrimaryMoved),
            SectorStatus::PrimaryMoved => Some(SectorStatus::CopiedFromScratch),
            SectorStatus::CopiedFromScratch => None,
        }
    }
}

/// The decoded trailer of the primary slot.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Trailer {
    /// Bytes at the start of each slot that take part in the exchange.
    pub swap_size: u32,
    /// TEST or PERM, as requested when the swap started.
    pub swap_type: SwapType,
    pub copy_done: bool,
    pub image_ok: bool,
    pub revert: bool,
    pub revert_done: bool,
}

impl Trailer {
    /// A freshly started swap.
    pub fn new(swap_type: SwapType, swap_size: u32) -> Trailer {
        Trailer {
            swap_size,
            swap_type,
            copy_done: false,
            image_ok: false,
            revert: false,
            revert_done: false,
        }
    }

    /// The swap type, taking a started revert into account.
    pub fn effective_type(&self) -> SwapType {
        if self.revert {
            SwapType::Revert
        } else {
            self.swap_type
        }
    }

    /// The ledger of the exchange currently recorded.
    pub fn ledger(&self) -> Ledger {
        if self.revert {
            Ledger::Revert
        } else {
            Ledger::Forward
        }
    }

    /// The exchange currently recorded has finished.
    pub fn swap_done(&self) -> bool {
        if self.revert {
            self.revert_done
        } else {
            self.copy_done
        }
    }
}

/// The meta data record.  Written once, before the magic.
#[derive(Debug, Default)]
#[repr(C)]
struct TrailerMeta {
    swap_size: u32,
    swap_type: u8,
    version: u8,
    /// Log2 of the sector size used by the swap.
    sector_log: u8,
    /// Log2 of the write size of this slot.
    write_log: u8,
}

impl AsRaw for TrailerMeta {}
unsafe impl AsMutRaw for TrailerMeta {}

#[derive(Debug, Eq, PartialEq)]
enum Magic {
    Good,
    Blank,
    Bad,
}

/// Reads and writes the trailer of one slot.
pub struct TrailerStore<'f, F> {
    flash: &'f RefCell<F>,
    layout: StatusLayout,
}

impl<'f, F: Flash> TrailerStore<'f, F> {
    pub fn new(flash: &'f RefCell<F>, layout: StatusLayout) -> TrailerStore<'f, F> {
        TrailerStore { flash, layout }
    }

    pub fn layout(&self) -> &StatusLayout {
        &self.layout
    }

    /// Read the trailer.  A blank or torn trailer, or one holding only the
    /// magic, is None.
    pub fn read(&self) -> Result<Option<Trailer>> {
        match self.read_magic()? {
            Magic::Good => (),
            Magic::Blank => return Ok(None),
            Magic::Bad => {
                debug!("Trailer magic invalid, treating as blank");
                return Ok(None);
            }
        }

        let mut buf = [0u8; MAX_WRITE_SIZE];
        let unit = &mut buf[..self.layout.meta_unit];
        self.flash.borrow_mut().read(self.layout.meta_pos, unit)?;
        if self.is_erased(unit) {
            // Written by the image tool, with no swap started.
            debug!("Trailer has magic but no swap info");
            return Ok(None);
        }

        let meta = TrailerMeta::copy_from(unit).ok_or(Error::TrailerCorrupt)?;
        if meta.version != TRAILER_VERSION
            || meta.sector_log as u32 != self.layout.sector_size.trailing_zeros()
            || meta.write_log as u32 != self.layout.write_size.trailing_zeros()
        {
            warn!("Trailer format mismatch: {:?}", meta);
            return Err(Error::TrailerCorrupt);
        }
        let swap_type = match SwapType::from_raw(meta.swap_type) {
            Some(t @ (SwapType::Test | SwapType::Perm)) => t,
            _ => {
                warn!("Trailer swap type invalid: {}", meta.swap_type);
                return Err(Error::TrailerCorrupt);
            }
        };
        if meta.swap_size == 0 || meta.swap_size as usize > self.layout.trailer_base {
            warn!("Trailer swap size out of range: 0x{:x}", meta.swap_size);
            return Err(Error::TrailerCorrupt);
        }

        let trailer = Trailer {
            swap_size: meta.swap_size,
            swap_type,
            copy_done: self.flag(Flag::CopyDone)?,
            image_ok: self.flag(Flag::ImageOk)?,
            revert: self.flag(Flag::Revert)?,
            revert_done: self.flag(Flag::RevertDone)?,
        };
        if (trailer.revert && !trailer.copy_done) || (trailer.revert_done && !trailer.revert) {
            warn!("Trailer flags out of order: {:?}", trailer);
            return Err(Error::TrailerCorrupt);
        }
        Ok(Some(trailer))
    }

    /// Write a new trailer, replacing whatever was there.
    pub fn write(&self, trailer: &Trailer) -> Result<()> {
        self.clear()?;

        let meta = TrailerMeta {
            swap_size: trailer.swap_size,
            swap_type: trailer.swap_type as u8,
            version: TRAILER_VERSION,
            sector_log: self.layout.sector_size.trailing_zeros() as u8,
            write_log: self.layout.write_size.trailing_zeros() as u8,
        };
        let mut buf = [self.layout.erased; MAX_WRITE_SIZE];
        let unit = &mut buf[..self.layout.meta_unit];
        meta.copy_to(unit).ok_or(Error::InvalidLayout)?;
        program(self.flash, self.layout.meta_pos, unit)?;

        let flags = [
            (Flag::CopyDone, trailer.copy_done),
            (Flag::ImageOk, trailer.image_ok),
            (Flag::Revert, trailer.revert),
            (Flag::RevertDone, trailer.revert_done),
        ];
        for (flag, set) in flags {
            if set {
                self.set_flag(flag)?;
            }
        }

        self.write_magic()
    }

    /// Erase the trailer, starting with the sector holding the magic.
    pub fn clear(&self) -> Result<()> {
        let size = self.layout.sector_size;
        let mut pos = self.layout.capacity;
        while pos > self.layout.trailer_base {
            pos -= size;
            erase(self.flash, pos, size)?;
        }
        Ok(())
    }

    /// Is the given flag set?
    pub fn flag(&self, flag: Flag) -> Result<bool> {
        self.read_unit(self.layout.flag_pos(flag))
    }

    /// Set a flag.  Does nothing if it is already set.
    pub fn set_flag(&self, flag: Flag) -> Result<()> {
        debug!("Set flag {:?}", flag);
        self.write_unit(self.layout.flag_pos(flag))
    }

    /// How far the exchange of sector `index` has progressed.
    pub fn sector_status(&self, ledger: Ledger, index: usize) -> Result<SectorStatus> {
        if index >= self.layout.max_sectors {
            return Err(Error::TrailerCorrupt);
        }
        let mut stages = 0;
        for stage in 1..=STAGES {
            let set = self.read_unit(self.layout.stage_pos(ledger, index, stage))?;
            match (set, stages + 1 == stage) {
                (true, true) => stages = stage,
                (true, false) => {
                    warn!("Sector {} checkpoint {} set out of order", index, stage);
                    return Err(Error::TrailerCorrupt);
                }
                (false, _) => (),
            }
        }
        Ok(SectorStatus::from_stages(stages))
    }

    /// Record that sector `index` has reached `status`.  Checkpoints are
    /// written in order, each read back before the next.
    pub fn mark_sector(&self, ledger: Ledger, index: usize, status: SectorStatus) -> Result<()> {
        let current = self.sector_status(ledger, index)?;
        for stage in current.stages() + 1..=status.stages() {
            self.write_unit(self.layout.stage_pos(ledger, index, stage))?;
        }
        Ok(())
    }

    /// Read a request left by the application, only meaningful in the
    /// secondary slot.
    pub fn read_request(&self) -> Result<Option<SwapRequest>> {
        if self.read_magic()? != Magic::Good {
            return Ok(None);
        }
        if self.flag(Flag::ImageOk)? {
            Ok(Some(SwapRequest::Perm))
        } else {
            Ok(Some(SwapRequest::Test))
        }
    }

    /// Leave a request for the bootloader, in the secondary slot.
    pub fn write_request(&self, request: SwapRequest) -> Result<()> {
        self.clear()?;
        if request == SwapRequest::Perm {
            self.set_flag(Flag::ImageOk)?;
        }
        self.write_magic()
    }

    fn read_magic(&self) -> Result<Magic> {
        let mut magic = [0u8; 16];
        self.flash.borrow_mut().read(self.layout.magic_pos, &mut magic)?;
        if magic == BOOT_MAGIC {
            Ok(Magic::Good)
        } else if self.is_erased(&magic) {
            Ok(Magic::Blank)
        } else {
            Ok(Magic::Bad)
        }
    }

    fn write_magic(&self) -> Result<()> {
        let mut buf = [self.layout.erased; MAX_WRITE_SIZE];
        let unit = &mut buf[..self.layout.magic_unit];
        unit[..BOOT_MAGIC.len()].copy_from_slice(&BOOT_MAGIC);
        program(self.flash, self.layout.magic_pos, unit)
    }

    fn read_unit(&self, pos: usize) -> Result<bool> {
        let mut buf = [0u8; MAX_WRITE_SIZE];
        let unit = &mut buf[..self.layout.write_size];
        self.flash.borrow_mut().read(pos, unit)?;
        if self.is_erased(unit) {
            Ok(false)
        } else if unit[0] == FLAG_SET && self.is_erased(&unit[1..]) {
            Ok(true)
        } else {
            warn!("Malformed trailer flag at 0x{:x}", pos);
            Err(Error::TrailerCorrupt)
        }
    }

    fn write_unit(&self, pos: usize) -> Result<()> {
        if self.read_unit(pos)? {
            return Ok(());
        }
        let mut buf = [self.layout.erased; MAX_WRITE_SIZE];
        let unit = &mut buf[..self.layout.write_size];
        unit[0] = FLAG_SET;
        program(self.flash, pos, unit)
    }

    fn is_erased(&self, bytes: &[u8]) -> bool {
        bytes.iter().all(|&b| b == self.layout.erased)
    }
}
