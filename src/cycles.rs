// Copyright 2020 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Cycle counting for the serialized direct write.
//!
//! A timed write is bracketed by two fenced counter reads.  The fence before
//! each read drains every memory operation issued earlier, so the interval
//! between the reads covers the store and nothing else.

use std::collections::VecDeque;
use std::sync::atomic::{compiler_fence, Ordering};

#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::{__rdtscp, _mm_mfence, _mm_stream_si32};

/// A source of cycle counts read behind a full memory fence.
pub trait CycleClock {
    /// Issues a full memory fence and then reads the counter.  Memory
    /// operations issued before the call complete before the read, and none
    /// issued after the call may move ahead of it.
    fn fenced_cycle_read(&mut self) -> u64;
}

/// The time stamp counter, read with `mfence; rdtscp`.
#[cfg(target_arch = "x86_64")]
#[derive(Default)]
pub struct TscClock;

#[cfg(target_arch = "x86_64")]
impl CycleClock for TscClock {
    #[inline(always)]
    fn fenced_cycle_read(&mut self) -> u64 {
        let mut aux = 0u32;
        compiler_fence(Ordering::SeqCst);
        // Safe because mfence and rdtscp have no memory operands other than
        // |aux|, which is a valid local.
        let cycles = unsafe {
            _mm_mfence();
            __rdtscp(&mut aux)
        };
        compiler_fence(Ordering::SeqCst);
        cycles
    }
}

/// Fallback for targets without an accessible cycle counter: a sequentially
/// consistent fence followed by the monotonic clock, in nanoseconds.
#[derive(Default)]
pub struct MonotonicClock;

impl CycleClock for MonotonicClock {
    fn fenced_cycle_read(&mut self) -> u64 {
        std::sync::atomic::fence(Ordering::SeqCst);
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // Safe because |ts| is the correct size and only needs to last long
        // enough for the call to return.  CLOCK_MONOTONIC is always supported
        // and |ts| is writable, so the call cannot fail.
        let status = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        debug_assert_eq!(status, 0);
        let nanos = (ts.tv_sec as u64) * 1_000_000_000 + (ts.tv_nsec as u64);
        std::sync::atomic::fence(Ordering::SeqCst);
        nanos
    }
}

/// The best clock for the build target.
#[cfg(target_arch = "x86_64")]
pub type NativeClock = TscClock;
#[cfg(not(target_arch = "x86_64"))]
pub type NativeClock = MonotonicClock;

/// A clock for testing.  Serves scripted readings first, then ticks forward
/// by a fixed step on every read.
pub struct MockClock {
    readings: VecDeque<u64>,
    now: u64,
    step: u64,
    pub reads: usize,
}

impl MockClock {
    pub fn new(readings: &[u64]) -> MockClock {
        MockClock {
            readings: readings.iter().cloned().collect(),
            now: 0,
            step: 1,
            reads: 0,
        }
    }

    /// A clock that reads |start|, then advances by |step| per read.
    pub fn ticking(start: u64, step: u64) -> MockClock {
        MockClock {
            readings: VecDeque::new(),
            now: start.wrapping_sub(step),
            step,
            reads: 0,
        }
    }
}

impl CycleClock for MockClock {
    fn fenced_cycle_read(&mut self) -> u64 {
        self.reads += 1;
        self.now = match self.readings.pop_front() {
            Some(reading) => reading,
            None => self.now.wrapping_add(self.step),
        };
        self.now
    }
}

// Stores |value| without allocating a cache line for it.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
fn stream_store(field: &mut u32, value: u32) {
    // Safe because |field| is a valid, aligned u32.  sse2 is part of the
    // x86_64 baseline.
    unsafe { _mm_stream_si32(field as *mut u32 as *mut i32, value as i32) }
}

#[cfg(not(target_arch = "x86_64"))]
#[inline(always)]
fn stream_store(field: &mut u32, value: u32) {
    // Safe because |field| is a valid, aligned u32.
    unsafe { std::ptr::write_volatile(field as *mut u32, value) }
}

/// Performs one serialized, non-temporal write of |value| to |field| and
/// returns the cycles it took: the second fenced read minus the first,
/// truncated to 32 bits.
#[inline(always)]
pub fn direct_write<C: CycleClock>(clock: &mut C, field: &mut u32, value: u32) -> u32 {
    let before = clock.fenced_cycle_read();
    stream_store(field, value);
    let after = clock.fenced_cycle_read();
    after.wrapping_sub(before) as u32
}
