//! Flash styles
//!
//! Various microcontrollers have various types of flash memories available to them.
//! Each device here has a primary and a secondary slot, and a scratch area
//! large enough for one of the largest sectors.

use storage::Result;

use crate::{PowerCut, SimFlash};

/// The configuration of a single flash area.
#[derive(Debug)]
pub struct AreaLayout {
    pub read_size: usize,
    pub write_size: usize,
    pub erase_size: usize,
    pub sectors: usize,
}

impl AreaLayout {
    pub fn build(&self) -> Result<SimFlash> {
        SimFlash::new(
            self.read_size,
            self.write_size,
            self.erase_size,
            self.sectors,
        )
    }
}

/// The three areas of a device.
#[derive(Debug)]
pub struct DeviceLayout {
    pub name: &'static str,
    pub primary: AreaLayout,
    pub secondary: AreaLayout,
    pub scratch: AreaLayout,
}

impl DeviceLayout {
    pub fn build(&self) -> Result<Device> {
        let power = PowerCut::new();
        Ok(Device {
            name: self.name,
            primary: self.primary.build()?.with_power(power.clone()),
            secondary: self.secondary.build()?.with_power(power.clone()),
            scratch: self.scratch.build()?.with_power(power.clone()),
            power,
        })
    }
}

/// A simulated device, with one power supply for all of its areas.
#[derive(Debug)]
pub struct Device {
    pub name: &'static str,
    pub primary: SimFlash,
    pub secondary: SimFlash,
    pub scratch: SimFlash,
    pub power: PowerCut,
}

impl Device {
    /// A copy of the device, with its own power supply.
    pub fn fork(&self) -> Device {
        let power = PowerCut::new();
        Device {
            name: self.name,
            primary: self.primary.clone().with_power(power.clone()),
            secondary: self.secondary.clone().with_power(power.clone()),
            scratch: self.scratch.clone().with_power(power.clone()),
            power,
        }
    }
}

/// STM32F4-style.
/// These devices have a fairly small number of relatively large sectors.  Each
/// slot is an image sector plus a sector for the status trailer, and the swap
/// goes through a single sector of scratch.
pub static STM32F: DeviceLayout = DeviceLayout {
    name: "stm32f",
    primary: AreaLayout {
        read_size: 1,
        write_size: 8,
        erase_size: 128 * 1024,
        sectors: 2,
    },
    secondary: AreaLayout {
        read_size: 1,
        write_size: 8,
        erase_size: 128 * 1024,
        sectors: 2,
    },
    scratch: AreaLayout {
        read_size: 1,
        write_size: 8,
        erase_size: 128 * 1024,
        sectors: 1,
    },
};

/// K64-style.
/// These devices have small uniform sectors.
pub static K64: DeviceLayout = DeviceLayout {
    name: "k64",
    primary: AreaLayout {
        read_size: 1,
        write_size: 8,
        erase_size: 4 * 1024,
        sectors: 128 / 4 + 1,
    },
    secondary: AreaLayout {
        read_size: 1,
        write_size: 8,
        erase_size: 4 * 1024,
        sectors: 128 / 4 + 1,
    },
    scratch: AreaLayout {
        read_size: 1,
        write_size: 8,
        erase_size: 4 * 1024,
        sectors: 1,
    },
};

/// External flash configuration.  The upgrade slot lives on an external part
/// with a larger write alignment, so its trailer takes more room.
pub static EXT: DeviceLayout = DeviceLayout {
    name: "ext",
    primary: AreaLayout {
        read_size: 1,
        write_size: 4,
        erase_size: 4 * 1024,
        sectors: 128 / 4,
    },
    secondary: AreaLayout {
        read_size: 1,
        write_size: 32,
        erase_size: 4 * 1024,
        sectors: 128 / 4,
    },
    scratch: AreaLayout {
        read_size: 1,
        write_size: 4,
        erase_size: 4 * 1024,
        sectors: 2,
    },
};

/// Another large write, based on the STM32H745.  The scratch area is on a
/// part with small sectors, which are erased several at a time.
pub static STM32H: DeviceLayout = DeviceLayout {
    name: "stm32h",
    primary: AreaLayout {
        read_size: 1,
        write_size: 32,
        erase_size: 128 * 1024,
        sectors: 4,
    },
    secondary: AreaLayout {
        read_size: 1,
        write_size: 32,
        erase_size: 128 * 1024,
        sectors: 3,
    },
    scratch: AreaLayout {
        read_size: 1,
        write_size: 8,
        erase_size: 8 * 1024,
        sectors: 16,
    },
};

/// A small part with 1k sectors.  Small enough that every interruption point
/// of a swap can be tried.
pub static SMALL: DeviceLayout = DeviceLayout {
    name: "small",
    primary: AreaLayout {
        read_size: 1,
        write_size: 4,
        erase_size: 1024,
        sectors: 9,
    },
    secondary: AreaLayout {
        read_size: 1,
        write_size: 4,
        erase_size: 1024,
        sectors: 9,
    },
    scratch: AreaLayout {
        read_size: 1,
        write_size: 4,
        erase_size: 1024,
        sectors: 1,
    },
};

/// All of the devices.
pub static ALL_DEVICES: [&DeviceLayout; 5] = [&STM32F, &K64, &EXT, &STM32H, &SMALL];

/// An iterator that builds each of the devices.
pub fn all_devices() -> impl Iterator<Item = Result<Device>> {
    ALL_DEVICES.iter().map(|layout| layout.build())
}

#[cfg(test)]
mod tests {
    use storage::{Flash, ReadFlash};

    use super::*;

    #[test]
    fn devices_build() {
        for dev in all_devices() {
            let dev = dev.unwrap();
            let sector = dev
                .primary
                .erase_size()
                .max(dev.secondary.erase_size())
                .max(dev.scratch.erase_size());
            assert!(dev.scratch.capacity() >= sector, "{}", dev.name);
            assert_eq!(dev.primary.capacity() % sector, 0, "{}", dev.name);
            assert_eq!(dev.secondary.capacity() % sector, 0, "{}", dev.name);
        }
    }

    #[test]
    fn shared_power() {
        let mut dev = K64.build().unwrap();
        dev.power.arm(0);
        assert!(dev.primary.erase(0, 4096).is_err());
        assert!(dev.secondary.erase(0, 4096).is_err());
        dev.power.restore();

        let mut fork = dev.fork();
        fork.power.arm(0);
        assert!(fork.primary.erase(0, 4096).is_err());
        assert!(dev.primary.erase(0, 4096).is_ok());
    }
}
