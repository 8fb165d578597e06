// Copyright 2020 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The capacity estimate: how many physical pages the harness believes it
//! can own.  Once capture starts the estimate only ever moves down.

use std::cmp::min;

use log::{debug, info, warn};

use crate::error::Result;
use crate::kernel::Kernel;

/// Returns the tightened estimate given |owned| pages already claimed and
/// |free| pages still reported free.  A candidate above |current| is not
/// trusted.
pub fn tighten(current: usize, owned: usize, free: usize) -> usize {
    min(current, owned.saturating_add(free))
}

/// The single-owner capacity estimate, threaded through capture and release.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Estimate {
    pages: usize,
}

impl Estimate {
    pub fn new(pages: usize) -> Estimate {
        Estimate { pages }
    }

    /// Takes the initial estimate from the live free page count.
    pub fn observe<K: Kernel>(kernel: &mut K) -> Result<Estimate> {
        Ok(Estimate::new(kernel.free_pages()?))
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Re-reads the free page count and lowers the estimate if the pages
    /// already |owned| plus those still free fall short of it.  Returns the
    /// correction when there was one.
    pub fn tighten<K: Kernel>(&mut self, kernel: &mut K, owned: usize) -> Result<Option<usize>> {
        let free = kernel.free_pages()?;
        let pages = tighten(self.pages, owned, free);
        if pages == self.pages {
            return Ok(None);
        }
        let correction = self.pages - pages;
        info!("- Adjusting free pages by {} to {}.", correction, pages);
        self.pages = pages;
        Ok(Some(correction))
    }
}

/// Syncs and drops caches, so that reclaimable cache does not hide among the
/// used pages, then takes the initial estimate.  A failed cache drop is
/// logged and otherwise ignored.
pub fn observe_free_memory<K: Kernel>(kernel: &mut K) -> Result<Estimate> {
    info!("Syncing and dropping cache pages.");
    if let Err(e) = kernel.drop_caches() {
        warn!("{}", e);
    }
    let estimate = Estimate::observe(kernel)?;
    info!("See {} free pages after drop and sync.", estimate.pages());
    Ok(estimate)
}

/// Decides when a long loop should re-check the estimate.  The first check
/// happens at the middle of the range, then each one halves the distance
/// remaining to the end, so checks get denser as the loop nears completion.
/// Any range of one page or more is checked at least once.
#[derive(Clone, Copy, Debug)]
pub struct Checkpoint {
    limit: usize,
}

impl Checkpoint {
    pub fn new(end: usize) -> Checkpoint {
        Checkpoint { limit: end / 2 }
    }

    pub fn due(&self, index: usize) -> bool {
        index >= self.limit
    }

    /// Moves the next checkpoint to the middle of [index, end).
    pub fn advance(&mut self, index: usize, end: usize) {
        self.limit = index + end.saturating_sub(index) / 2;
        debug!("next checkpoint at page {}", self.limit);
    }
}
