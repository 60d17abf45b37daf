//! Per-family flash layout descriptors.
//!
//! A descriptor is selected by the product ID reported by `GET_ID`; an
//! unknown PID aborts the session for that target.

use std::fmt;

/// One flash erase unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sector {
    pub index: u16,
    pub start: u32,
    pub size: u32,
}

impl Sector {
    pub fn end(&self) -> u32 {
        self.start + self.size
    }

    pub fn contains(&self, address: u32) -> bool {
        address >= self.start && address < self.end()
    }
}

/// Immutable description of one MCU family's flash and bootloader.
#[derive(Clone, Debug)]
pub struct McuDescriptor {
    pub family: &'static str,
    /// 12-bit product ID reported by `GET_ID`.
    pub pid: u16,
    /// Ascending, contiguous erase sectors.
    pub sectors: Vec<Sector>,
    /// Write/read chunk granularity; divides every sector size.
    pub page_size: usize,
    pub flash_lo: u32,
    pub flash_hi: u32,
    /// Largest read/write payload the bootloader accepts.
    pub max_payload: usize,
    /// Whether the bootloader implements the two-byte erase command.
    pub extended_erase: bool,
}

impl McuDescriptor {
    /// STM32F405/407/415/417: 4x16 KiB + 1x64 KiB + 7x128 KiB from
    /// `0x0800_0000`, extended erase, PID 0x413.
    pub fn stm32f40x() -> Self {
        const FLASH_BASE: u32 = 0x0800_0000;
        let mut sectors = Vec::with_capacity(12);
        let mut start = FLASH_BASE;
        for index in 0..12u16 {
            let size = match index {
                0..=3 => 16 * 1024,
                4 => 64 * 1024,
                _ => 128 * 1024,
            };
            sectors.push(Sector { index, start, size });
            start += size;
        }
        Self {
            family: "STM32F405/407/415/417",
            pid: 0x413,
            sectors,
            page_size: 256,
            flash_lo: FLASH_BASE,
            flash_hi: start,
            max_payload: 256,
            extended_erase: true,
        }
    }

    /// Looks a descriptor up by product ID.
    pub fn for_pid(pid: u16) -> Option<Self> {
        match pid {
            0x413 => Some(Self::stm32f40x()),
            _ => None,
        }
    }

    /// The sector owning `address`, if any.
    pub fn sector_of(&self, address: u32) -> Option<&Sector> {
        self.sectors.iter().find(|s| s.contains(address))
    }

    pub fn flash_len(&self) -> usize {
        (self.flash_hi - self.flash_lo) as usize
    }
}

impl fmt::Display for McuDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (PID 0x{:03X}, {} KiB flash at 0x{:08X})",
            self.family,
            self.pid,
            self.flash_len() / 1024,
            self.flash_lo
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn f40x_layout() {
        let descriptor = McuDescriptor::stm32f40x();
        assert_eq!(descriptor.sectors.len(), 12);
        assert_eq!(descriptor.sectors[0].start, 0x0800_0000);
        assert_eq!(descriptor.sectors[0].size, 0x4000);
        assert_eq!(descriptor.sectors[4].start, 0x0801_0000);
        assert_eq!(descriptor.sectors[4].size, 0x1_0000);
        assert_eq!(descriptor.sectors[11].end(), 0x0810_0000);
        assert_eq!(descriptor.flash_hi, 0x0810_0000);

        // Sectors tile the window without gaps.
        for pair in descriptor.sectors.windows(2) {
            assert_eq!(pair[0].end(), pair[1].start);
        }
    }

    #[test]
    fn pid_lookup() {
        assert!(McuDescriptor::for_pid(0x413).is_some());
        assert!(McuDescriptor::for_pid(0x999).is_none());
    }

    #[test]
    fn sector_lookup() {
        let descriptor = McuDescriptor::stm32f40x();
        assert_eq!(descriptor.sector_of(0x0800_0000).unwrap().index, 0);
        assert_eq!(descriptor.sector_of(0x0800_3FFF).unwrap().index, 0);
        assert_eq!(descriptor.sector_of(0x0800_4000).unwrap().index, 1);
        assert_eq!(descriptor.sector_of(0x080F_FFFF).unwrap().index, 11);
        assert!(descriptor.sector_of(0x0810_0000).is_none());
        assert!(descriptor.sector_of(0x0000_0000).is_none());
    }
}
