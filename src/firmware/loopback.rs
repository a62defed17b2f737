// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Firmware stand-in answering commands from its own thread.
//!
//! [`LoopbackFirmware`] acknowledges every command it receives with a successful response of the
//! expected kind, delivered asynchronously to the attached [`ResponseSink`] like a real transport
//! would. Buffers are either returned right away or held until the client releases them, a flush
//! or stop returns them, so that buffer accounting and clock scaling can be exercised. Single
//! responses can be silenced to simulate an unresponsive firmware, and arbitrary responses
//! injected to simulate errors.

use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::Weak;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::eventfd::EfdFlags;
use nix::sys::eventfd::EventFd;
use thiserror::Error;

use crate::buffer::BufferId;
use crate::buffer::ReturnStatus;
use crate::firmware::Command;
use crate::firmware::FirmwareChannel;
use crate::firmware::FlushMode;
use crate::firmware::Response;
use crate::firmware::ResponseKind;
use crate::firmware::ResponseSink;
use crate::firmware::Scope;
use crate::firmware::SendError;
use crate::Port;

#[derive(Debug, Error)]
pub enum LoopbackError {
    #[error("failed to create EventFd for the dispatcher: {0}")]
    EventFd(Errno),
    #[error("failed to spawn the dispatcher thread: {0}")]
    Spawn(std::io::Error),
}

enum Message {
    Command(Scope, Command),
    Inject(Scope, ResponseKind, Response),
    Release(ReturnStatus),
    Barrier(mpsc::SyncSender<()>),
    Shutdown,
}

/// Buffer the firmware is holding on to.
#[derive(Copy, Clone, Debug)]
struct Held {
    scope: Scope,
    port: Port,
    buffer: BufferId,
}

impl Held {
    fn done_kind(&self) -> ResponseKind {
        match self.port {
            Port::Output => ResponseKind::SessionEtbDone,
            Port::Capture => ResponseKind::SessionFtbDone,
        }
    }
}

struct Inner {
    queue: Mutex<VecDeque<Message>>,
    wake: EventFd,
    sink: Mutex<Option<Weak<dyn ResponseSink>>>,
    history: Mutex<Vec<(Scope, Command)>>,
    silenced: Mutex<BTreeSet<ResponseKind>>,
    held: Mutex<Vec<Held>>,
    auto_return: AtomicBool,
    closed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn push(&self, message: Message) -> Result<(), Errno> {
        lock(&self.queue).push_back(message);
        self.wake.write(1).map(|_| ())
    }

    fn process_loop(&self) {
        loop {
            if let Err(e) = self.wake.read() {
                log::error!("Loopback dispatcher cannot wait for messages: {e}");
                break;
            }

            let Some(message) = lock(&self.queue).pop_front() else {
                continue;
            };
            match message {
                Message::Command(scope, command) => self.handle_command(scope, command),
                Message::Inject(scope, kind, response) => self.deliver(scope, kind, response),
                Message::Release(status) => self.return_held(|_| true, status),
                Message::Barrier(done) => {
                    let _ = done.send(());
                }
                Message::Shutdown => break,
            }
        }
        log::debug!("Loopback dispatcher exiting");
    }

    fn deliver(&self, scope: Scope, kind: ResponseKind, response: Response) {
        if lock(&self.silenced).contains(&kind) {
            log::debug!("Loopback swallowing {kind:?} for {scope:?}");
            return;
        }

        let sink = lock(&self.sink).as_ref().and_then(Weak::upgrade);
        match sink {
            Some(sink) => sink.on_response(scope, kind, response),
            None => log::warn!("Loopback dropping {kind:?}: no sink attached"),
        }
    }

    fn return_held<F: Fn(&Held) -> bool>(&self, select: F, status: ReturnStatus) {
        let returned = {
            let mut held = lock(&self.held);
            let (returned, kept) = held.drain(..).partition::<Vec<_>, _>(|h| select(h));
            *held = kept;
            returned
        };

        for h in returned {
            self.deliver(h.scope, h.done_kind(), Response::buffer_done(h.buffer, status));
        }
    }

    fn handle_command(&self, scope: Scope, command: Command) {
        log::trace!("Loopback received {command:?} for {scope:?}");
        lock(&self.history).push((scope, command.clone()));

        let held = match command {
            Command::EmptyThisBuffer { buffer, .. } => Some((Port::Output, buffer)),
            Command::FillThisBuffer { buffer, .. } => Some((Port::Capture, buffer)),
            Command::Stop => {
                self.return_held(|h| h.scope == scope, ReturnStatus::Completed);
                None
            }
            Command::Flush(mode) => {
                self.return_held(
                    |h| h.scope == scope && mode.covers(h.port),
                    ReturnStatus::Completed,
                );
                None
            }
            _ => None,
        };

        if let Some((port, buffer)) = held {
            let held = Held {
                scope,
                port,
                buffer,
            };
            if self.auto_return.load(Ordering::SeqCst) {
                self.deliver(
                    scope,
                    held.done_kind(),
                    Response::buffer_done(buffer, ReturnStatus::Completed),
                );
            } else {
                lock(&self.held).push(held);
            }
            return;
        }

        if let Some(kind) = command.expected_response() {
            self.deliver(scope, kind, Response::ok());
        }
    }
}

pub struct LoopbackFirmware {
    inner: Arc<Inner>,
    dispatcher: Option<JoinHandle<()>>,
}

impl LoopbackFirmware {
    /// Starts the dispatcher. Buffers are returned as soon as they are submitted if `auto_return`
    /// is set, and held otherwise.
    pub fn new(auto_return: bool) -> Result<Self, LoopbackError> {
        let inner = Arc::new(Inner {
            queue: Default::default(),
            wake: EventFd::from_flags(EfdFlags::EFD_SEMAPHORE).map_err(LoopbackError::EventFd)?,
            sink: Default::default(),
            history: Default::default(),
            silenced: Default::default(),
            held: Default::default(),
            auto_return: AtomicBool::new(auto_return),
            closed: AtomicBool::new(false),
        });

        let dispatcher = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name("vidc-loopback".into())
                .spawn(move || inner.process_loop())
                .map_err(LoopbackError::Spawn)?
        };

        Ok(Self {
            inner,
            dispatcher: Some(dispatcher),
        })
    }

    /// Sets where responses go. Only a weak reference is kept, as the sink usually owns this
    /// channel through its cores.
    pub fn attach(&self, sink: Weak<dyn ResponseSink>) {
        *lock(&self.inner.sink) = Some(sink);
    }

    pub fn set_auto_return(&self, auto_return: bool) {
        self.inner.auto_return.store(auto_return, Ordering::SeqCst);
    }

    /// Stops answering with responses of `kind`.
    pub fn silence(&self, kind: ResponseKind) {
        lock(&self.inner.silenced).insert(kind);
    }

    pub fn unsilence(&self, kind: ResponseKind) {
        lock(&self.inner.silenced).remove(&kind);
    }

    /// Queues an unsolicited response, delivered in order with the acknowledgments.
    pub fn inject(&self, scope: Scope, kind: ResponseKind, response: Response) -> Result<(), SendError> {
        self.push(Message::Inject(scope, kind, response))
    }

    /// Returns every held buffer with `status`.
    pub fn release_held(&self, status: ReturnStatus) -> Result<(), SendError> {
        self.push(Message::Release(status))
    }

    /// Number of buffers the firmware is holding.
    pub fn held_count(&self) -> usize {
        lock(&self.inner.held).len()
    }

    /// Commands received so far, in order.
    pub fn history(&self) -> Vec<(Scope, Command)> {
        lock(&self.inner.history).clone()
    }

    /// Waits until every message queued before this call has been processed.
    pub fn barrier(&self, timeout: Duration) -> anyhow::Result<()> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.push(Message::Barrier(tx))?;
        rx.recv_timeout(timeout)?;
        Ok(())
    }

    fn push(&self, message: Message) -> Result<(), SendError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(SendError::Closed);
        }
        self.inner
            .push(message)
            .map_err(|e| SendError::Other(anyhow::anyhow!("failed to wake the dispatcher: {e}")))
    }

    /// Stops accepting commands. Messages already queued are still processed.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }
}

impl FirmwareChannel for LoopbackFirmware {
    fn send(&self, scope: Scope, command: Command) -> Result<(), SendError> {
        self.push(Message::Command(scope, command))
    }
}

impl Drop for LoopbackFirmware {
    fn drop(&mut self) {
        self.close();
        if let Err(e) = self.inner.push(Message::Shutdown) {
            log::error!("Failed to stop the loopback dispatcher: {e}");
            return;
        }

        if let Some(dispatcher) = self.dispatcher.take() {
            // Dropped from a response handler: the dispatcher exits on its own.
            if dispatcher.thread().id() == thread::current().id() {
                return;
            }
            let _ = dispatcher.join();
        }
    }
}
