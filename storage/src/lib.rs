//! Storage types.
//!
//! The flash interface the boot engine consumes.  A device (or a partition of
//! one) is addressed from offset zero up to its capacity.  Writes must land on
//! erased locations; the engine never assumes a write is atomic beyond a single
//! write unit.

#![cfg_attr(not(any(feature = "std", test)), no_std)]

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Error {
    NotAligned,
    OutOfBounds,
    NotWritten,
    NotErased,
    /// The device reported a failed program or erase.
    Failed,
    /// Power was lost before the operation completed.  Only simulators can
    /// report this, real hardware simply stops.
    Interrupted,
}

pub type Result<T> = core::result::Result<T, Error>;

/// Read only interface into flash.
pub trait ReadFlash {
    /// What is the read size (alignment and size multiple).
    fn read_size(&self) -> usize;
    fn read(&mut self, offset: usize, bytes: &mut [u8]) -> Result<()>;
    fn capacity(&self) -> usize;
}

/// Flash that can be written to.
pub trait Flash: ReadFlash {
    /// Write size (alignment and size multiple).
    fn write_size(&self) -> usize;
    /// Erase size (alignment and size multiple).
    fn erase_size(&self) -> usize;

    /// The value every byte reads as after an erase.
    fn erased_value(&self) -> u8 {
        0xff
    }

    fn erase(&mut self, from: usize, to: usize) -> Result<()>;
    fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<()>;

    /// Number of erase sectors in the device.
    fn sector_count(&self) -> usize {
        self.capacity() / self.erase_size()
    }

    /// Erase a single sector, by index.
    fn erase_sector(&mut self, index: usize) -> Result<()> {
        let size = self.erase_size();
        let from = index.checked_mul(size).ok_or(Error::OutOfBounds)?;
        let to = from.checked_add(size).ok_or(Error::OutOfBounds)?;
        self.erase(from, to)
    }
}

// Utilities taken from embedded-storage for validating arguments.
pub fn check_read<T: ReadFlash>(flash: &T, offset: usize, length: usize) -> Result<()> {
    check_slice(flash, flash.read_size(), offset, length)
}

pub fn check_erase<T: Flash>(flash: &T, from: usize, to: usize) -> Result<()> {
    if from > to || to > flash.capacity() {
        return Err(Error::OutOfBounds);
    }
    if from % flash.erase_size() != 0 || to % flash.erase_size() != 0 {
        return Err(Error::NotAligned);
    }
    Ok(())
}

pub fn check_write<T: Flash>(flash: &T, offset: usize, length: usize) -> Result<()> {
    check_slice(flash, flash.write_size(), offset, length)
}

pub fn check_slice<T: ReadFlash>(
    flash: &T,
    align: usize,
    offset: usize,
    length: usize,
) -> Result<()> {
    if length > flash.capacity() || offset > flash.capacity() - length {
        return Err(Error::OutOfBounds);
    }
    if offset % align != 0 || length % align != 0 {
        return Err(Error::NotAligned);
    }
    Ok(())
}
