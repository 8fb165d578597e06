// Copyright 2020 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Access to the kernel services the harness depends on: the free page
//! counter in /proc/vmstat, the cache-drop control file, and discarding the
//! contents of captured pages.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::rc::Rc;

use crate::capture::Mapping;
use crate::error::{Error, Result};
use crate::PAGE_SIZE;

/// The vmstat field holding the number of free physical pages.
pub const FREE_PAGES_KEY: &str = "nr_free_pages";

/// Value written to drop_caches: free page cache, dentries and inodes.
pub const DROP_CACHES_MODE: u32 = 3;

/// The kernel capabilities used by the capture and release logic.
pub trait Kernel {
    /// Flushes dirty data to storage and asks the kernel to drop all
    /// reclaimable caches.
    fn drop_caches(&mut self) -> Result<()>;

    /// Returns the current number of free physical pages.
    fn free_pages(&mut self) -> Result<usize>;

    /// Tells the kernel that the contents of |page| in |mapping| may be
    /// discarded, which frees its backing physical page.
    fn release(&mut self, mapping: &Mapping, page: usize) -> Result<()>;
}

/// Locations of the kernel files used by the program.  They are collected
/// here because they get different values when testing.
#[derive(Clone, Debug)]
pub struct Paths {
    pub vmstat: PathBuf,
    pub drop_caches: PathBuf,
    pub testing_root: PathBuf,
}

const VMSTAT_PATH: &str = "/proc/vmstat";
const DROP_CACHES_PATH: &str = "/proc/sys/vm/drop_caches";

impl Paths {
    /// Returns the paths of the live kernel files.
    pub fn system() -> Paths {
        Paths::rooted("")
    }

    /// Returns paths which all live under |root|, for testing.
    pub fn testing(root: &str) -> Paths {
        Paths::rooted(root)
    }

    fn rooted(root: &str) -> Paths {
        Paths {
            vmstat: PathBuf::from(format!("{}{}", root, VMSTAT_PATH)),
            drop_caches: PathBuf::from(format!("{}{}", root, DROP_CACHES_PATH)),
            testing_root: PathBuf::from(root),
        }
    }
}

/// Finds the free page count in the content of /proc/vmstat, whose format is
/// (<name> <integer-value>\n)+.  The first line whose name matches wins.
pub fn parse_free_pages(content: &str) -> Result<usize> {
    for line in content.lines() {
        let mut tokens = line.split_whitespace();
        if tokens.next() != Some(FREE_PAGES_KEY) {
            continue;
        }
        let value = tokens.next().unwrap_or("");
        return value
            .parse::<usize>()
            .map_err(|e| Error::ParseStats(format!("{} {:?}: {}", FREE_PAGES_KEY, value, e)));
    }
    Err(Error::MissingFreePages)
}

/// The genuine kernel interface, backed by procfs and madvise(2).
pub struct ProcKernel {
    paths: Paths,
    // Kept open to reduce the number of syscalls between checkpoints.
    vmstat_file: File,
    buffer: String,
}

impl ProcKernel {
    pub fn new(paths: Paths) -> Result<ProcKernel> {
        let vmstat_file = File::open(&paths.vmstat).map_err(Error::ReadStats)?;
        Ok(ProcKernel {
            paths,
            vmstat_file,
            buffer: String::new(),
        })
    }
}

impl Kernel for ProcKernel {
    fn drop_caches(&mut self) -> Result<()> {
        // sync() is always safe to call.
        unsafe { libc::sync() };
        let mut file = OpenOptions::new()
            .write(true)
            .open(&self.paths.drop_caches)
            .map_err(Error::DropCaches)?;
        writeln!(file, "{}", DROP_CACHES_MODE).map_err(Error::DropCaches)
    }

    fn free_pages(&mut self) -> Result<usize> {
        self.buffer.clear();
        self.vmstat_file
            .seek(SeekFrom::Start(0))
            .map_err(Error::ReadStats)?;
        self.vmstat_file
            .read_to_string(&mut self.buffer)
            .map_err(Error::ReadStats)?;
        parse_free_pages(&self.buffer)
    }

    fn release(&mut self, mapping: &Mapping, page: usize) -> Result<()> {
        let address = mapping.page_ptr(page)?;
        // Safe because |address| is the start of one whole page inside a
        // mapping owned by this process, and nothing holds references into
        // it.  Its content is allowed to read back as zeroes afterwards.
        let status =
            unsafe { libc::madvise(address as *mut libc::c_void, PAGE_SIZE, libc::MADV_DONTNEED) };
        if status != 0 {
            return Err(Error::Release(io::Error::last_os_error()));
        }
        Ok(())
    }
}

/// A kernel double for testing.  Free page counts are served from a script
/// (the last value repeats forever) and every call is recorded.
pub struct MockKernel {
    free_pages: VecDeque<usize>,
    last_free_pages: usize,
    pub drop_caches_calls: usize,
    pub free_pages_calls: usize,
    pub released: Vec<usize>,
    journal: Option<Rc<RefCell<Vec<String>>>>,
}

impl MockKernel {
    pub fn new(free_pages: &[usize]) -> MockKernel {
        MockKernel {
            free_pages: free_pages.iter().cloned().collect(),
            last_free_pages: 0,
            drop_caches_calls: 0,
            free_pages_calls: 0,
            released: Vec::new(),
            journal: None,
        }
    }

    /// Returns a kernel which also appends "release <page>" to |journal|, so
    /// that releases can be ordered against other recorded events.
    pub fn with_journal(free_pages: &[usize], journal: Rc<RefCell<Vec<String>>>) -> MockKernel {
        MockKernel {
            journal: Some(journal),
            ..MockKernel::new(free_pages)
        }
    }
}

impl Kernel for MockKernel {
    fn drop_caches(&mut self) -> Result<()> {
        self.drop_caches_calls += 1;
        Ok(())
    }

    fn free_pages(&mut self) -> Result<usize> {
        self.free_pages_calls += 1;
        if let Some(n) = self.free_pages.pop_front() {
            self.last_free_pages = n;
        }
        Ok(self.last_free_pages)
    }

    fn release(&mut self, mapping: &Mapping, page: usize) -> Result<()> {
        mapping.page_ptr(page)?;
        if let Some(journal) = &self.journal {
            journal.borrow_mut().push(format!("release {}", page));
        }
        self.released.push(page);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;
    use std::ptr;

    const VMSTAT_CONTENT: &str = "\
nr_free_pages 50489
nr_alloc_batch 3326
nr_inactive_anon 48591
nr_active_anon 145673
nr_inactive_file 49597
nr_active_file 50199
nr_free_cma 0
pgpgin 41070493
pgfree 140534607
";

    fn testing_root(tag: &str) -> String {
        // Calling getpid() is always safe.
        format!("/tmp/frame-probe-testing-root-{}-{}", unsafe { libc::getpid() }, tag)
    }

    fn setup_test_environment(paths: &Paths, vmstat: &str) {
        fs::create_dir_all(paths.vmstat.parent().unwrap()).expect("cannot create /proc");
        fs::create_dir_all(paths.drop_caches.parent().unwrap()).expect("cannot create /proc/sys/vm");
        fs::write(&paths.vmstat, vmstat).expect("cannot initialize vmstat");
        fs::write(&paths.drop_caches, "").expect("cannot initialize drop_caches");
    }

    fn teardown_test_environment(paths: &Paths) {
        let _ = fs::remove_dir_all(&paths.testing_root);
    }

    #[test]
    fn parses_free_pages() {
        assert_eq!(parse_free_pages(VMSTAT_CONTENT).unwrap(), 50489);
    }

    #[test]
    fn free_pages_need_not_come_first() {
        let content = "nr_alloc_batch 3326\nnr_free_pages_extra 1\nnr_free_pages 17\n";
        assert_eq!(parse_free_pages(content).unwrap(), 17);
    }

    #[test]
    fn missing_free_pages() {
        match parse_free_pages("nr_alloc_batch 3326\npgfree 1\n") {
            Err(Error::MissingFreePages) => {}
            other => panic!("unexpected result {:?}", other),
        }
        match parse_free_pages("") {
            Err(Error::MissingFreePages) => {}
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn malformed_free_pages() {
        match parse_free_pages("nr_free_pages lots\n") {
            Err(Error::ParseStats(_)) => {}
            other => panic!("unexpected result {:?}", other),
        }
        match parse_free_pages("nr_free_pages\n") {
            Err(Error::ParseStats(_)) => {}
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn testing_paths_are_rooted() {
        let paths = Paths::testing("/tmp/root");
        assert_eq!(paths.vmstat, PathBuf::from("/tmp/root/proc/vmstat"));
        assert_eq!(paths.drop_caches, PathBuf::from("/tmp/root/proc/sys/vm/drop_caches"));
        let paths = Paths::system();
        assert_eq!(paths.vmstat, PathBuf::from("/proc/vmstat"));
    }

    #[test]
    fn proc_kernel_rereads_vmstat() {
        let root = testing_root("reread");
        let paths = Paths::testing(&root);
        setup_test_environment(&paths, VMSTAT_CONTENT);

        let mut kernel = ProcKernel::new(paths.clone()).expect("cannot open fake vmstat");
        assert_eq!(kernel.free_pages().unwrap(), 50489);
        fs::write(&paths.vmstat, "nr_free_pages 12\n").unwrap();
        assert_eq!(kernel.free_pages().unwrap(), 12);

        kernel.drop_caches().expect("drop_caches");
        assert_eq!(fs::read_to_string(&paths.drop_caches).unwrap(), "3\n");

        teardown_test_environment(&paths);
    }

    #[test]
    fn proc_kernel_without_vmstat() {
        let paths = Paths::testing(&testing_root("absent"));
        match ProcKernel::new(paths) {
            Err(e @ Error::ReadStats(_)) => assert_eq!(e.exit_code(), libc::ENOKEY),
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("opened a vmstat file that does not exist"),
        }
    }

    #[test]
    fn proc_kernel_release_discards_contents() {
        let root = testing_root("release");
        let paths = Paths::testing(&root);
        setup_test_environment(&paths, VMSTAT_CONTENT);
        let mut kernel = ProcKernel::new(paths.clone()).expect("cannot open fake vmstat");

        let mapping = Mapping::anonymous(2).expect("mmap");
        let word = mapping.page_ptr(1).unwrap() as *mut u32;
        // Safe because |word| is the aligned start of a mapped page.
        unsafe { ptr::write_volatile(word, 77) };
        assert_eq!(unsafe { ptr::read_volatile(word) }, 77);

        kernel.release(&mapping, 1).expect("madvise");
        assert_eq!(unsafe { ptr::read_volatile(word) }, 0);

        teardown_test_environment(&paths);
    }

    #[test]
    fn proc_kernel_release_of_locked_page() {
        let root = testing_root("release-locked");
        let paths = Paths::testing(&root);
        setup_test_environment(&paths, VMSTAT_CONTENT);
        let mut kernel = ProcKernel::new(paths.clone()).expect("cannot open fake vmstat");

        let mapping = Mapping::anonymous(2).expect("mmap");
        let page = mapping.page_ptr(1).unwrap();
        // The kernel refuses MADV_DONTNEED on locked pages.
        let status = unsafe { libc::mlock(page as *const libc::c_void, PAGE_SIZE) };
        assert_eq!(status, 0, "mlock: {}", io::Error::last_os_error());

        match kernel.release(&mapping, 1) {
            Err(e @ Error::Release(_)) => assert_eq!(e.exit_code(), libc::EINVAL),
            Err(e) => panic!("unexpected error {}", e),
            Ok(()) => panic!("released a locked page"),
        }
        kernel.release(&mapping, 0).expect("madvise");

        teardown_test_environment(&paths);
    }

    #[test]
    fn mock_repeats_last_reading() {
        let mut kernel = MockKernel::new(&[10, 7]);
        assert_eq!(kernel.free_pages().unwrap(), 10);
        assert_eq!(kernel.free_pages().unwrap(), 7);
        assert_eq!(kernel.free_pages().unwrap(), 7);
        assert_eq!(kernel.free_pages_calls, 3);
    }
}
