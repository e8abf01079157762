// Shared test setup.

#![allow(dead_code)]

use std::cell::RefCell;

use boot::{BootConfig, BootLoader, Slots};
use log::LevelFilter;
use simflash::{gen::GenBuilder, styles::Device, PowerCut, SimFlash};
use simple_logger::SimpleLogger;

pub fn init_logging() {
    let _ = SimpleLogger::new().with_level(LevelFilter::Info).init();
}

/// A device, with its areas shareable by the bootloader.
pub struct Rig {
    pub name: &'static str,
    pub primary: RefCell<SimFlash>,
    pub secondary: RefCell<SimFlash>,
    pub scratch: RefCell<SimFlash>,
    pub power: PowerCut,
}

impl Rig {
    pub fn new(device: Device) -> Rig {
        Rig {
            name: device.name,
            primary: RefCell::new(device.primary),
            secondary: RefCell::new(device.secondary),
            scratch: RefCell::new(device.scratch),
            power: device.power,
        }
    }

    /// A copy of the current state, with its own power supply.
    pub fn fork(&self) -> Rig {
        Rig::new(self.device())
    }

    pub fn device(&self) -> Device {
        Device {
            name: self.name,
            primary: self.primary.borrow().clone(),
            secondary: self.secondary.borrow().clone(),
            scratch: self.scratch.borrow().clone(),
            power: self.power.clone(),
        }
        .fork()
    }

    pub fn slots(&self) -> Slots<'_, SimFlash> {
        Slots::new(&self.primary, &self.secondary, &self.scratch)
    }

    pub fn loader(&self) -> BootLoader<'_, 'static, SimFlash> {
        self.loader_with(BootConfig::default())
    }

    pub fn loader_with<'k>(&self, config: BootConfig<'k>) -> BootLoader<'_, 'k, SimFlash> {
        BootLoader::new(self.slots(), config).unwrap()
    }

    /// The two slot contents, excluding scratch.
    pub fn contents(&self) -> (Vec<u8>, Vec<u8>) {
        (
            self.primary.borrow().contents().to_vec(),
            self.secondary.borrow().contents().to_vec(),
        )
    }

    pub fn total_writes(&self) -> (usize, usize) {
        let mut writes = 0;
        let mut erases = 0;
        for area in [&self.primary, &self.secondary, &self.scratch] {
            let stats = area.borrow().stats();
            writes += stats.writes;
            erases += stats.erases;
        }
        (writes, erases)
    }

    pub fn reset_stats(&self) {
        for area in [&self.primary, &self.secondary, &self.scratch] {
            area.borrow_mut().reset_stats();
        }
    }
}

/// Pick image sizes that fit the device.
pub fn image_sizes(rig: &Rig) -> (usize, usize) {
    if rig.primary.borrow().contents().len() < 64 * 1024 {
        (5_000, 6_311)
    } else {
        (71_842, 76_173)
    }
}

/// Install an old image in the primary slot and a new one in the secondary.
pub fn install_pair(rig: &Rig) -> (Vec<u8>, Vec<u8>) {
    let (old_size, new_size) = image_sizes(rig);
    let old = GenBuilder::default()
        .size(old_size)
        .seed(1)
        .version("1.0.0")
        .build()
        .unwrap();
    let new = GenBuilder::default()
        .size(new_size)
        .seed(2)
        .version("1.1.0")
        .build()
        .unwrap();
    rig.primary.borrow_mut().install(&old.data, 0).unwrap();
    rig.secondary.borrow_mut().install(&new.data, 0).unwrap();
    rig.reset_stats();
    (old.data, new.data)
}
