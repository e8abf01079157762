//! Simulated flash
//!
//! The NOR-type flashes used in microcontrollers differs quite a bit in terms
//! of capabilities provided.  This simulator attempts to capture the diversity
//! of these devices, and to be stricter than any of them.
//!
//! A device has a read size, an erase size, and a write size.  We require that
//! the erase size be a multiple of the write size (they can be the same).  At
//! this point in time, the read size is always 1.  There are a couple of
//! different families of devices that are common:
//!
//! - Old style: erase size is 4k-128k, write size is typically 1-8, sometimes
//!   as much as 16 or 32.
//! - Large write: erase size is 128k, write size is 32.  Large to write, but
//!   also large erase sizes.
//! - Paged: erase size is 512, write size is 512.  These are not supported by
//!   the bootloader's status format.
//!
//! Every byte may be written once between erases.  Writing a byte a second
//! time is reported as `NotErased`, even if the value would not change.
//!
//! Power loss is simulated with a `PowerCut`, shared between all of the areas
//! of one device.  Once the counted number of writes and erases have
//! completed, the next one is interrupted: an erase does nothing, and a write
//! only gets the first half of its write units down.  From then on, every
//! operation fails with `Interrupted` until power is restored.

use std::{cell::Cell, fs, path::Path, rc::Rc};

use anyhow::{anyhow, Result as AnyResult};
use log::{debug, warn};
use rand::Rng;
use storage::{check_erase, check_read, check_write, Error, Flash, ReadFlash, Result};

pub mod gen;
pub mod styles;

/// Shared control over the power of a simulated device.
#[derive(Clone, Debug, Default)]
pub struct PowerCut {
    state: Rc<PowerState>,
}

#[derive(Debug, Default)]
struct PowerState {
    /// Mutating operations that have completed.
    ops: Cell<usize>,
    /// Operation number that loses power.
    cut_at: Cell<Option<usize>>,
    tripped: Cell<bool>,
}

impl PowerCut {
    pub fn new() -> PowerCut {
        PowerCut::default()
    }

    /// Let `count` more writes or erases complete, and cut power during the
    /// one after.
    pub fn arm(&self, count: usize) {
        self.state.cut_at.set(Some(self.state.ops.get() + count));
        self.state.tripped.set(false);
    }

    /// Restore power, and stop counting down.
    pub fn restore(&self) {
        self.state.cut_at.set(None);
        self.state.tripped.set(false);
    }

    /// Has the power been cut?
    pub fn tripped(&self) -> bool {
        self.state.tripped.get()
    }

    /// Number of writes and erases completed so far.
    pub fn ops(&self) -> usize {
        self.state.ops.get()
    }

    fn live(&self) -> Result<()> {
        if self.state.tripped.get() {
            Err(Error::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Account for a mutating operation.  Returns false for the operation
    /// that loses power.
    fn tick(&self) -> Result<bool> {
        self.live()?;
        if self.state.cut_at.get() == Some(self.state.ops.get()) {
            self.state.tripped.set(true);
            return Ok(false);
        }
        self.state.ops.set(self.state.ops.get() + 1);
        Ok(true)
    }
}

/// Operation counts.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Stats {
    pub reads: usize,
    pub writes: usize,
    pub erases: usize,
}

/// How a write to a bad region goes wrong.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Failure {
    /// The driver returns `Failed`, and nothing is written.
    Reported,
    /// The driver claims success, but nothing is written.
    Silent,
}

#[derive(Clone, Debug)]
struct BadRegion {
    start: usize,
    end: usize,
    /// Probability a write touching this region fails.
    rate: f64,
    failure: Failure,
}

#[derive(Clone, Debug)]
pub struct SimFlash {
    data: Vec<u8>,
    /// Bytes that may still be written.
    writable: Vec<bool>,
    read_size: usize,
    write_size: usize,
    erase_size: usize,
    erased: u8,
    power: PowerCut,
    bad: Vec<BadRegion>,
    stats: Stats,
}

impl SimFlash {
    /// Build an erased device of `sectors` erase sectors.
    pub fn new(
        read_size: usize,
        write_size: usize,
        erase_size: usize,
        sectors: usize,
    ) -> Result<SimFlash> {
        if !read_size.is_power_of_two()
            || !write_size.is_power_of_two()
            || !erase_size.is_power_of_two()
            || erase_size < write_size
        {
            return Err(Error::NotAligned);
        }
        let capacity = erase_size * sectors;
        Ok(SimFlash {
            data: vec![0xff; capacity],
            writable: vec![true; capacity],
            read_size,
            write_size,
            erase_size,
            erased: 0xff,
            power: PowerCut::new(),
            bad: Vec::new(),
            stats: Stats::default(),
        })
    }

    /// Use a different erased value, erasing the whole device.
    pub fn with_erased_value(mut self, erased: u8) -> SimFlash {
        self.erased = erased;
        self.data.fill(erased);
        self.writable.fill(true);
        self
    }

    /// Share a power supply with other areas.
    pub fn with_power(mut self, power: PowerCut) -> SimFlash {
        self.power = power;
        self
    }

    pub fn power(&self) -> &PowerCut {
        &self.power
    }

    /// Write data into the device at `offset`, padding it out to the write
    /// size.  The area must be erased.
    pub fn install(&mut self, data: &[u8], offset: usize) -> Result<()> {
        let mut buf = data.to_vec();
        buf.resize(data.len().next_multiple_of(self.write_size), self.erased);
        self.write(offset, &buf)
    }

    /// The raw contents.
    pub fn contents(&self) -> &[u8] {
        &self.data
    }

    /// Flip bits in a byte, behind the back of the write-once tracking.
    pub fn corrupt(&mut self, offset: usize, xor: u8) {
        if let Some(byte) = self.data.get_mut(offset) {
            *byte ^= xor;
        }
    }

    /// Make writes that touch the given range fail with probability `rate`.
    pub fn add_bad_region(&mut self, start: usize, len: usize, rate: f64) -> Result<()> {
        self.add_failing_region(start, len, rate, Failure::Reported)
    }

    /// Make writes that touch the given range get lost with probability
    /// `rate`, without the driver noticing.  Only reading the data back shows
    /// the failure.
    pub fn add_silent_region(&mut self, start: usize, len: usize, rate: f64) -> Result<()> {
        self.add_failing_region(start, len, rate, Failure::Silent)
    }

    fn add_failing_region(
        &mut self,
        start: usize,
        len: usize,
        rate: f64,
        failure: Failure,
    ) -> Result<()> {
        if start + len > self.data.len() {
            return Err(Error::OutOfBounds);
        }
        self.bad.push(BadRegion {
            start,
            end: start + len,
            rate,
            failure,
        });
        Ok(())
    }

    pub fn reset_bad_regions(&mut self) {
        self.bad.clear();
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = Stats::default();
    }

    /// Save the contents of the device.
    pub fn write_file<P: AsRef<Path>>(&self, path: P) -> AnyResult<()> {
        fs::write(path, &self.data)?;
        Ok(())
    }

    /// Load contents previously saved with `write_file`.  Every byte is
    /// considered written, other than erased ones.
    pub fn load_file<P: AsRef<Path>>(&mut self, path: P) -> AnyResult<()> {
        let data = fs::read(path)?;
        if data.len() != self.data.len() {
            return Err(anyhow!(
                "Flash image is {} bytes, device is {}",
                data.len(),
                self.data.len()
            ));
        }
        for (safe, &byte) in self.writable.iter_mut().zip(&data) {
            *safe = byte == self.erased;
        }
        self.data = data;
        Ok(())
    }

    fn write_failure(&self, offset: usize, len: usize) -> Option<Failure> {
        let end = offset + len;
        self.bad
            .iter()
            .filter(|r| offset < r.end && r.start < end)
            .find(|r| rand::thread_rng().gen_bool(r.rate))
            .map(|r| r.failure)
    }
}

impl ReadFlash for SimFlash {
    fn read_size(&self) -> usize {
        self.read_size
    }

    fn read(&mut self, offset: usize, bytes: &mut [u8]) -> Result<()> {
        check_read(self, offset, bytes.len())?;
        self.power.live()?;
        self.stats.reads += 1;
        bytes.copy_from_slice(&self.data[offset..offset + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }
}

impl Flash for SimFlash {
    fn write_size(&self) -> usize {
        self.write_size
    }

    fn erase_size(&self) -> usize {
        self.erase_size
    }

    fn erased_value(&self) -> u8 {
        self.erased
    }

    fn erase(&mut self, from: usize, to: usize) -> Result<()> {
        check_erase(self, from, to)?;
        if !self.power.tick()? {
            warn!("Power lost during erase of 0x{:x}..0x{:x}", from, to);
            return Err(Error::Interrupted);
        }
        self.stats.erases += 1;
        self.data[from..to].fill(self.erased);
        self.writable[from..to].fill(true);
        Ok(())
    }

    fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        check_write(self, offset, bytes.len())?;
        let end = offset + bytes.len();
        if let Some(pos) = self.writable[offset..end].iter().position(|&w| !w) {
            debug!("Write to unerased byte at 0x{:x}", offset + pos);
            return Err(Error::NotErased);
        }

        let len = if self.power.tick()? {
            bytes.len()
        } else {
            let units = bytes.len() / self.write_size;
            warn!("Power lost during write of 0x{:x}", offset);
            units / 2 * self.write_size
        };

        if len == bytes.len() {
            match self.write_failure(offset, len) {
                Some(Failure::Reported) => return Err(Error::Failed),
                Some(Failure::Silent) => {
                    debug!("Dropping write of 0x{:x}", offset);
                    self.stats.writes += 1;
                    return Ok(());
                }
                None => (),
            }
        }

        self.stats.writes += 1;
        self.data[offset..offset + len].copy_from_slice(&bytes[..len]);
        self.writable[offset..offset + len].fill(false);

        if len == bytes.len() {
            Ok(())
        } else {
            Err(Error::Interrupted)
        }
    }
}
