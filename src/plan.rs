//! Chunk planner.
//!
//! Splits the firmware image into page-sized write/verify chunks keyed by
//! their owning sector.  The plan covers exactly the pages the image
//! touches, in ascending address order; the set of sectors it mentions is
//! what the session erases.

use log::debug;

use crate::device::McuDescriptor;
use crate::error::{Error, Result};
use crate::image::HexImage;

/// One page-sized write/verify unit.
///
/// Invariants: `address` is page-aligned within its sector, the whole chunk
/// lies inside sector `sector_index`, and `bytes.len()` equals the page
/// size.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub sector_index: u16,
    /// Page number within the owning sector.
    pub page_index: u32,
    pub address: u32,
    pub bytes: Vec<u8>,
}

/// Ordered list of chunks covering exactly the touched pages.
#[derive(Clone, Debug, Default)]
pub struct Plan {
    chunks: Vec<Chunk>,
    page_size: usize,
}

impl Plan {
    /// Derives the plan for `image` on `descriptor`.
    ///
    /// Rejects descriptors whose page size does not divide every sector
    /// size and images that reach outside the descriptor's flash window.
    pub fn build(image: &HexImage, descriptor: &McuDescriptor) -> Result<Self> {
        let page_size = descriptor.page_size;
        validate_descriptor(descriptor)?;

        let mut chunks: Vec<Chunk> = Vec::new();
        for address in image.addresses() {
            let sector = descriptor.sector_of(address).ok_or_else(|| {
                Error::Plan(format!(
                    "image byte at 0x{address:08X} is outside {} flash",
                    descriptor.family
                ))
            })?;
            let page_index = (address - sector.start) / page_size as u32;
            let page_addr = sector.start + page_index * page_size as u32;

            if let Some(last) = chunks.last() {
                if last.address == page_addr {
                    continue;
                }
            }
            // Page size divides the sector size, so a page never straddles
            // a sector boundary; treat anything else as a planner bug.
            if page_addr + page_size as u32 > sector.end() {
                return Err(Error::Plan(format!(
                    "page at 0x{page_addr:08X} crosses the end of sector {}",
                    sector.index
                )));
            }
            chunks.push(Chunk {
                sector_index: sector.index,
                page_index,
                address: page_addr,
                bytes: image.page_bytes(page_addr, page_size),
            });
        }

        debug!(
            "plan: {} chunks across {} sectors",
            chunks.len(),
            dirty_sectors(&chunks).len()
        );
        Ok(Self { chunks, page_size })
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Sector indices touched by the plan, ascending.
    pub fn dirty_sectors(&self) -> Vec<u16> {
        dirty_sectors(&self.chunks)
    }

    /// Chunks of one sector, in ascending address order.
    pub fn chunks_in_sector(&self, sector: u16) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter().filter(move |c| c.sector_index == sector)
    }
}

fn dirty_sectors(chunks: &[Chunk]) -> Vec<u16> {
    let mut sectors: Vec<u16> = chunks.iter().map(|c| c.sector_index).collect();
    sectors.dedup();
    sectors
}

fn validate_descriptor(descriptor: &McuDescriptor) -> Result<()> {
    let page_size = descriptor.page_size as u32;
    if page_size == 0 || page_size % 4 != 0 {
        return Err(Error::Plan(format!(
            "page size {page_size} is not a positive multiple of four"
        )));
    }
    if descriptor.page_size > descriptor.max_payload {
        return Err(Error::Plan(format!(
            "page size {page_size} exceeds the bootloader payload limit of {}",
            descriptor.max_payload
        )));
    }
    if descriptor.sectors.is_empty() {
        return Err(Error::Plan(String::from("descriptor has no sectors")));
    }
    let mut expected_start = descriptor.flash_lo;
    for sector in &descriptor.sectors {
        if sector.start != expected_start {
            return Err(Error::Plan(format!(
                "sector {} does not start at 0x{expected_start:08X}",
                sector.index
            )));
        }
        if sector.size % page_size != 0 {
            return Err(Error::Plan(format!(
                "page size {page_size} does not divide sector {} ({} bytes)",
                sector.index, sector.size
            )));
        }
        expected_start = sector.end();
    }
    if expected_start != descriptor.flash_hi {
        return Err(Error::Plan(format!(
            "sectors end at 0x{expected_start:08X}, flash window at 0x{:08X}",
            descriptor.flash_hi
        )));
    }
    Ok(())
}
