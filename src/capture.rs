// Copyright 2020 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Capturing free memory: one anonymous private mapping sized to the capacity
//! estimate, write-touched page by page so that every page gets physical
//! backing.

use std::hint::black_box;
use std::io;
use std::ptr::{self, NonNull};

use log::{debug, info};

use crate::error::{Error, Result};
use crate::estimate::{Checkpoint, Estimate};
use crate::kernel::Kernel;
use crate::PAGE_SIZE;

/// An anonymous, private, read/write mapping owned by this process.  It is
/// unmapped on drop.
pub struct Mapping {
    base: NonNull<u8>,
    pages: usize,
}

impl Mapping {
    /// Reserves |pages| pages.  No physical memory is committed until the
    /// pages are touched.  An empty mapping makes no system call.
    pub fn anonymous(pages: usize) -> Result<Mapping> {
        if pages == 0 {
            return Ok(Mapping {
                base: NonNull::dangling(),
                pages,
            });
        }
        let length = pages
            .checked_mul(PAGE_SIZE)
            .ok_or_else(|| Error::Map(io::Error::from_raw_os_error(libc::ENOMEM)))?;
        // Safe because we ask for a fresh anonymous mapping at an address of
        // the kernel's choosing, and check the result.
        let address = unsafe {
            libc::mmap(
                ptr::null_mut(),
                length,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if address == libc::MAP_FAILED {
            return Err(Error::Map(io::Error::last_os_error()));
        }
        match NonNull::new(address as *mut u8) {
            Some(base) => Ok(Mapping { base, pages }),
            None => Err(Error::Map(io::Error::from_raw_os_error(libc::EFAULT))),
        }
    }

    /// Number of pages reserved.
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Returns the address of the start of |page|.
    pub fn page_ptr(&self, page: usize) -> Result<*mut u8> {
        if page >= self.pages {
            return Err(Error::PageOutOfRange {
                page,
                pages: self.pages,
            });
        }
        // Within bounds, checked above.
        Ok(unsafe { self.base.as_ptr().add(page * PAGE_SIZE) })
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if self.pages == 0 {
            return;
        }
        // Safe because the range is exactly the one returned by mmap.
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.pages * PAGE_SIZE);
        }
    }
}

/// Writes the first machine word of |page|, which forces the kernel to back
/// it with a physical page.
fn touch(mapping: &Mapping, page: usize) -> Result<()> {
    let word = mapping.page_ptr(page)? as *mut usize;
    // Safe because |word| is page aligned and inside the mapping.
    unsafe { ptr::write_volatile(word, black_box(0)) };
    Ok(())
}

/// Memory captured by `capture`.
pub struct Capture {
    mapping: Mapping,
    pages: usize,
    estimate: Estimate,
}

impl Capture {
    pub fn mapping(&self) -> &Mapping {
        &self.mapping
    }

    /// Number of pages touched, hence physically backed.
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// The estimate as it stood when capture completed.
    pub fn estimate(&self) -> Estimate {
        self.estimate
    }
}

/// Maps |estimate| pages and touches them in address order.  The estimate is
/// re-checked at each checkpoint, using the number of pages touched so far as
/// the pages already owned, and touching stops at the revised bound.
pub fn capture<K: Kernel>(kernel: &mut K, mut estimate: Estimate) -> Result<Capture> {
    info!("Allocating every free page.");
    let mapping = Mapping::anonymous(estimate.pages())?;

    info!("Touching all allocated pages.");
    let mut checkpoint = Checkpoint::new(estimate.pages());
    let mut index = 0;
    while index < estimate.pages() {
        if checkpoint.due(index) {
            estimate.tighten(kernel, index)?;
            checkpoint.advance(index, estimate.pages());
            if index >= estimate.pages() {
                break;
            }
        }
        touch(&mapping, index)?;
        index += 1;
    }
    debug!("touched {} of {} mapped pages", index, mapping.pages());

    Ok(Capture {
        mapping,
        pages: index,
        estimate,
    })
}
