// Copyright 2020 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Physical memory probing harness.
//!
//! Both experiments start the same way: drop caches, estimate how many pages
//! are free, and capture them into one mapping while re-checking the estimate
//! as the capture proceeds.  `randomizer` then releases the pages in random
//! order; `timer` times a serialized write to every page and prints the
//! timings before releasing each page.

pub mod capture;
pub mod cycles;
pub mod error;
pub mod estimate;
pub mod kernel;
pub mod logging;
pub mod randomizer;
pub mod timer;

pub use crate::error::{Error, Result};

/// Size of the pages captured and released.
pub const PAGE_SIZE: usize = 4096;
