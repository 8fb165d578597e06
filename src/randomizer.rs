// Copyright 2020 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Randomized eviction: capture every free page, then hand the pages back to
//! the kernel in a uniformly random order, unrelated to the sequential order
//! in which they were touched.

use chrono::Utc;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::capture::{capture, Mapping};
use crate::error::Result;
use crate::estimate::observe_free_memory;
use crate::kernel::Kernel;

/// Returns a generator seeded from the wall clock.  Runs are not meant to be
/// reproducible.
pub fn time_seeded_rng() -> StdRng {
    let now = Utc::now();
    let seed = ((now.timestamp() as u64) << 32) ^ u64::from(now.timestamp_subsec_nanos());
    debug!("walk seed {:#x}", seed);
    StdRng::seed_from_u64(seed)
}

/// Returns [0, 1, ..., pages - 1].
pub fn identity(pages: usize) -> Vec<usize> {
    (0..pages).collect()
}

/// Cuts the identity |walk| down to the first |pages| entries and shuffles
/// it, which leaves a uniformly random permutation of [0, pages).
pub fn prepare_walk<R: Rng + ?Sized>(walk: &mut Vec<usize>, pages: usize, rng: &mut R) {
    walk.truncate(pages);
    walk.shuffle(rng);
}

/// Releases the pages of |mapping| in the order given by |walk|.
pub fn release_walk<K: Kernel>(kernel: &mut K, mapping: &Mapping, walk: &[usize]) -> Result<()> {
    for &page in walk {
        kernel.release(mapping, page)?;
    }
    Ok(())
}

/// Runs the whole experiment and returns the number of pages released.
pub fn run<K: Kernel, R: Rng + ?Sized>(kernel: &mut K, rng: &mut R) -> Result<usize> {
    let mut estimate = observe_free_memory(kernel)?;

    // The walk must cover all free pages.  Build it now so that the memory
    // it takes is no longer counted as free.
    let mut walk = identity(estimate.pages());
    estimate.tighten(kernel, 0)?;

    let captured = capture(kernel, estimate)?;

    info!("Preparing random walk through allocated pages.");
    prepare_walk(&mut walk, captured.pages(), rng);

    info!("Releasing all allocated pages.");
    release_walk(kernel, captured.mapping(), &walk)?;

    info!("Done.");
    Ok(walk.len())
}
