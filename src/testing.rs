/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use anyhow::{anyhow, Result};
use nix::sys::signal::Signal;
use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::ffi::OsStr;
use std::fs::{create_dir_all, write};
use std::os::unix::fs::symlink;
use std::path::Path;
use std::rc::Rc;
use tempfile::{tempdir, TempDir};

thread_local! {
    static TEST: RefCell<Option<Rc<Test>>> = const { RefCell::new(None) };
}

#[macro_export]
macro_rules! enum_roundtrip {
    ($enum:ident => $value:literal : str = $variant:ident) => {
        assert_eq!($enum::$variant.to_string(), $value);
        assert_eq!($enum::from_str($value).unwrap(), $enum::$variant);
    };

    ($enum:ident { $($value:literal : $ty:ident = $variant:ident,)+ }) => {
        $(enum_roundtrip!($enum => $value : $ty = $variant);)+
    };
}

pub fn start() -> TestHandle {
    TEST.with(|lock| {
        assert!(lock.borrow().as_ref().is_none());
        let test: Rc<Test> = Rc::new(Test {
            base: tempdir().expect("Couldn't create test directory"),
            process_cb: Cell::new(|_, _| Err(anyhow!("No current process_cb"))),
            signals: RefCell::new(Vec::new()),
            stubborn: RefCell::new(HashSet::new()),
        });
        *lock.borrow_mut() = Some(test.clone());
        TestHandle { test }
    })
}

pub fn stop() {
    TEST.with(|lock| {
        (*lock.borrow_mut()).take();
    });
}

pub fn current() -> Rc<Test> {
    TEST.with(|lock| lock.borrow().as_ref().unwrap().clone())
}

pub struct Test {
    base: TempDir,
    pub process_cb: Cell<fn(&str, &[&OsStr]) -> Result<(i32, String)>>,
    /// Every signal the process reconciler sent, in order.
    pub signals: RefCell<Vec<(u32, Signal)>>,
    /// Fake processes that survive SIGTERM.
    pub stubborn: RefCell<HashSet<u32>>,
}

pub struct TestHandle {
    pub test: Rc<Test>,
}

impl Test {
    pub fn path(&self) -> &Path {
        self.base.path()
    }

    /// Populates the fake /proc with a process whose exe link points at `exe`.
    pub fn spawn_process(&self, pid: u32, exe: &str, comm: &str) {
        let base = self.path().join(format!("proc/{pid}"));
        create_dir_all(&base).expect("create_dir_all");
        write(base.join("comm"), format!("{comm}\n")).expect("comm");
        symlink(exe, base.join("exe")).expect("exe");
    }

    /// Like [`Test::spawn_process`], with the process placed in the cgroup of
    /// systemd unit `unit`.
    pub fn spawn_unit_process(&self, pid: u32, exe: &str, comm: &str, unit: &str) {
        self.spawn_process(pid, exe, comm);
        let cgroup = self.path().join(format!("proc/{pid}/cgroup"));
        write(cgroup, format!("0::/system.slice/{unit}\n")).expect("cgroup");
    }

    pub fn signals_for(&self, pid: u32) -> Vec<Signal> {
        self.signals
            .borrow()
            .iter()
            .filter(|(p, _)| *p == pid)
            .map(|(_, signal)| *signal)
            .collect()
    }
}

impl Drop for TestHandle {
    fn drop(&mut self) {
        stop();
    }
}
