// Copyright 2020 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-page timed writes: capture every free page, time a serialized direct
//! write to each page over a number of rounds, then print the timings of each
//! page and release it before moving on to the next.
//!
//! The samples of a page are kept inside the page itself, in the cache lines
//! following the one that receives the timed writes.

use std::fmt::{self, Display};
use std::hint::black_box;
use std::io::Write;
use std::mem;

use log::info;

use crate::capture::{capture, Mapping};
use crate::cycles::{direct_write, CycleClock};
use crate::error::{Error, Result};
use crate::estimate::observe_free_memory;
use crate::kernel::Kernel;
use crate::PAGE_SIZE;

/// Size of a cache line.
pub const LINE_SIZE: usize = 64;

/// Number of timing rounds a page has room for.
pub const TIME_ROUNDS: usize = 64;

// How a captured page is used by the timing experiment.
#[repr(C)]
struct TimedPage {
    target: u32,
    _target_line: [u8; LINE_SIZE - mem::size_of::<u32>()],
    times: [u32; TIME_ROUNDS],
    _rest: [u8; PAGE_SIZE - LINE_SIZE - TIME_ROUNDS * mem::size_of::<u32>()],
}

const _: () = assert!(mem::size_of::<TimedPage>() == PAGE_SIZE);

// Returns |page| of |mapping| viewed as a TimedPage.  The page is aligned
// and any content is valid for plain integer arrays.
fn timed_page(mapping: &Mapping, page: usize) -> Result<*mut TimedPage> {
    Ok(mapping.page_ptr(page)? as *mut TimedPage)
}

/// The timings of one page, keyed by the page's virtual address.  Printed as
/// `0x<address>,<t0>,<t1>,...`.
pub struct PageRecord<'a> {
    pub address: usize,
    pub times: &'a [u32],
}

impl<'a> Display for PageRecord<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.address)?;
        for time in self.times {
            write!(f, ",{}", time)?;
        }
        Ok(())
    }
}

// Fails unless every round has a slot in the page.
fn check_rounds(rounds: usize) -> Result<()> {
    if rounds > TIME_ROUNDS {
        return Err(Error::TooManyRounds {
            rounds,
            max: TIME_ROUNDS,
        });
    }
    Ok(())
}

/// Times one direct write per page per round, for |rounds| rounds over the
/// first |pages| pages of |mapping|, in address order within each round.
pub fn time_pages<C: CycleClock>(
    clock: &mut C,
    mapping: &Mapping,
    pages: usize,
    rounds: usize,
) -> Result<()> {
    check_rounds(rounds)?;
    for round in 0..rounds {
        for index in 0..pages {
            // Safe because no other reference to the page is alive.
            let page = unsafe { &mut *timed_page(mapping, index)? };
            page.times[round] = direct_write(clock, &mut page.target, black_box(0));
        }
    }
    Ok(())
}

/// Writes the record of each of the first |pages| pages to |out| in address
/// order, releasing each page right after its record is out.
pub fn emit_and_release<K: Kernel, W: Write>(
    kernel: &mut K,
    mapping: &Mapping,
    pages: usize,
    rounds: usize,
    out: &mut W,
) -> Result<()> {
    check_rounds(rounds)?;
    for index in 0..pages {
        {
            // Safe because no other reference to the page is alive, and this
            // one is gone before the page is released.
            let page = unsafe { &*timed_page(mapping, index)? };
            let record = PageRecord {
                address: page as *const TimedPage as usize,
                times: &page.times[..rounds],
            };
            writeln!(out, "{}", record).map_err(Error::WriteRecord)?;
            out.flush().map_err(Error::WriteRecord)?;
        }
        kernel.release(mapping, index)?;
    }
    Ok(())
}

/// Runs the whole experiment with |rounds| timing rounds, printing records to
/// |out|.  Returns the number of pages timed and released.  More than
/// `TIME_ROUNDS` rounds is refused before any memory is claimed.
pub fn run<K: Kernel, C: CycleClock, W: Write>(
    kernel: &mut K,
    clock: &mut C,
    out: &mut W,
    rounds: usize,
) -> Result<usize> {
    check_rounds(rounds)?;
    let estimate = observe_free_memory(kernel)?;
    let captured = capture(kernel, estimate)?;

    info!("Timing all allocated pages.");
    time_pages(clock, captured.mapping(), captured.pages(), rounds)?;

    // Free memory as we go to avoid paging.
    info!("Printing all collected times.");
    emit_and_release(kernel, captured.mapping(), captured.pages(), rounds, out)?;

    info!("Done.");
    Ok(captured.pages())
}
