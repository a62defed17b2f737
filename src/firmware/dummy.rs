// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy firmware channel whose only purpose is to record what the driver
//! sends, so the state machines can be tested in isolation. Tests play the part of the firmware by
//! delivering responses themselves.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use crate::firmware::Command;
use crate::firmware::FirmwareChannel;
use crate::firmware::Scope;
use crate::firmware::SendError;

#[derive(Default)]
pub(crate) struct RecordingChannel {
    sent: Mutex<Vec<(Scope, Command)>>,
    closed: AtomicBool,
    /// Commands whose next send fails.
    failing: Mutex<Vec<Command>>,
}

impl RecordingChannel {
    pub(crate) fn sent(&self) -> Vec<(Scope, Command)> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn commands(&self) -> Vec<Command> {
        self.sent().into_iter().map(|(_, command)| command).collect()
    }

    pub(crate) fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Makes the next send of `command` fail.
    pub(crate) fn fail_once(&self, command: Command) {
        self.failing.lock().unwrap().push(command);
    }
}

impl FirmwareChannel for RecordingChannel {
    fn send(&self, scope: Scope, command: Command) -> Result<(), SendError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SendError::Closed);
        }
        {
            let mut failing = self.failing.lock().unwrap();
            if let Some(pos) = failing.iter().position(|c| *c == command) {
                failing.remove(pos);
                return Err(SendError::Closed);
            }
        }

        self.sent.lock().unwrap().push((scope, command));
        Ok(())
    }
}
