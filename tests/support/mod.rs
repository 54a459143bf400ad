//! Host-side test doubles for the supervisor/driver integration tests,
//! analogous in spirit to the crate's own `RamDisk` fixture: plain `std`
//! state behind the trait boundaries the real firmware would bind to an
//! RTOS and an SPI peripheral.

use sd_supervisor::fs::Filesystem;
use sd_supervisor::proto;
use sd_supervisor::supervisor::{AccessSemaphore, CardDetect, Command, CommandQueue};
use sd_supervisor::transport::{Error as TransportError, Transport};
use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A byte-level SD2 card simulator driving the full SPI init handshake.
///
/// Tracks each 6-byte command frame as it's clocked out and queues up the
/// R1 (plus any trailing data, such as an R7's echo pattern) a real card
/// would return on the following `0xFF` polls. `cmd0_fails` models a card
/// that never leaves the idle state, e.g. one that's gone bad or isn't
/// really there.
pub struct FakeCard {
    frame: Vec<u8>,
    queued: VecDeque<u8>,
    expect_acmd: bool,
    pub cmd0_fails: bool,
}

impl FakeCard {
    pub fn new() -> Self {
        FakeCard {
            frame: Vec::new(),
            queued: VecDeque::new(),
            expect_acmd: false,
            cmd0_fails: false,
        }
    }

    pub fn failing() -> Self {
        let mut card = Self::new();
        card.cmd0_fails = true;
        card
    }

    fn handle_frame(&mut self) {
        let cmd = self.frame[0] & 0x3F;
        let was_acmd = self.expect_acmd;
        self.expect_acmd = false;
        self.frame.clear();

        if was_acmd {
            self.queued.push_back(proto::R1_READY_STATE);
            return;
        }

        match cmd {
            proto::CMD0 => self.queued.push_back(if self.cmd0_fails {
                proto::R1_READY_STATE
            } else {
                proto::R1_IDLE_STATE
            }),
            proto::CMD8 => {
                self.queued.push_back(proto::R1_IDLE_STATE);
                self.queued.extend([0x00, 0x00, 0x01, 0xAA]);
            }
            proto::CMD55 => {
                self.queued.push_back(proto::R1_IDLE_STATE);
                self.expect_acmd = true;
            }
            proto::CMD58 => {
                self.queued.push_back(proto::R1_READY_STATE);
                self.queued.extend([0x40, 0x00, 0x00, 0x00]);
            }
            _ => self.queued.push_back(proto::R1_READY_STATE),
        }
    }
}

impl Default for FakeCard {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for FakeCard {
    fn exchange(&mut self, out: u8) -> Result<u8, TransportError> {
        if out != 0xFF {
            self.frame.push(out);
            if self.frame.len() == 6 {
                self.handle_frame();
            }
            return Ok(0xFF);
        }
        Ok(self.queued.pop_front().unwrap_or(0xFF))
    }

    fn dma_burst(&mut self, buffer: &mut [u8], _ceiling_ms: u32) -> Result<(), TransportError> {
        buffer.fill(0x00);
        Ok(())
    }

    fn select(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    fn deselect(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    fn set_clock_freq(&mut self, _hz: u32) {}
    fn set_dma_enabled(&mut self, _enabled: bool) {}
    fn lock(&mut self) {}
    fn unlock(&mut self) {}
    fn delay_us(&mut self, _us: u32) {}
}

/// Records the power rail's last commanded state.
pub struct FakePower {
    pub up: bool,
}

impl FakePower {
    pub fn new() -> Self {
        FakePower { up: false }
    }
}

impl Default for FakePower {
    fn default() -> Self {
        Self::new()
    }
}

impl sd_supervisor::power::PowerControl for FakePower {
    type Error = ();

    fn power_down(&mut self) -> Result<(), Self::Error> {
        self.up = false;
        Ok(())
    }

    fn power_up(&mut self) -> Result<(), Self::Error> {
        self.up = true;
        Ok(())
    }
}

/// A card-detect pin a test can flip mid-run, standing in for the
/// insertion/removal interrupt.
#[derive(Default)]
pub struct FlippableDetect {
    present: Cell<bool>,
}

impl FlippableDetect {
    pub fn new(present: bool) -> Self {
        FlippableDetect {
            present: Cell::new(present),
        }
    }

    pub fn set(&self, present: bool) {
        self.present.set(present);
    }
}

impl CardDetect for FlippableDetect {
    fn is_present(&self) -> bool {
        self.present.get()
    }
}

impl CardDetect for &FlippableDetect {
    fn is_present(&self) -> bool {
        (**self).is_present()
    }
}

/// Counts mount/unmount calls instead of doing anything with them.
#[derive(Default)]
pub struct CountingFilesystem {
    pub mounts: Cell<u32>,
    pub unmounts: Cell<u32>,
}

impl Filesystem for CountingFilesystem {
    type Error = ();

    fn mount(&self) -> Result<(), Self::Error> {
        self.mounts.set(self.mounts.get() + 1);
        Ok(())
    }

    fn unmount(&self) -> Result<(), Self::Error> {
        self.unmounts.set(self.unmounts.get() + 1);
        Ok(())
    }
}

impl Filesystem for &CountingFilesystem {
    type Error = ();

    fn mount(&self) -> Result<(), Self::Error> {
        (**self).mount()
    }

    fn unmount(&self) -> Result<(), Self::Error> {
        (**self).unmount()
    }
}

pub struct NoopDelay;

impl embedded_hal::delay::DelayNs for NoopDelay {
    fn delay_ns(&mut self, _ns: u32) {}
}

/// Bounded, capacity-2, drop-newest-on-overflow command queue. Same
/// contract as the crate's own `host::StdCommandQueue`, reimplemented here
/// since that one is only compiled in for the crate's own unit tests.
pub struct StdCommandQueue {
    state: Mutex<VecDeque<Command>>,
    cond: Condvar,
}

impl StdCommandQueue {
    pub fn new() -> Self {
        StdCommandQueue {
            state: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
        }
    }
}

impl Default for StdCommandQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandQueue for StdCommandQueue {
    fn send(&self, command: Command) -> bool {
        let mut queue = self.state.lock().unwrap();
        if queue.len() >= 2 {
            return false;
        }
        queue.push_back(command);
        self.cond.notify_one();
        true
    }

    fn receive(&self, timeout_ms: Option<u32>) -> Option<Command> {
        let mut queue = self.state.lock().unwrap();
        match timeout_ms {
            None => {
                while queue.is_empty() {
                    queue = self.cond.wait(queue).unwrap();
                }
                queue.pop_front()
            }
            Some(ms) => {
                let deadline = Instant::now() + Duration::from_millis(ms as u64);
                while queue.is_empty() {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    let (guard, result) = self.cond.wait_timeout(queue, deadline - now).unwrap();
                    queue = guard;
                    if result.timed_out() && queue.is_empty() {
                        return None;
                    }
                }
                queue.pop_front()
            }
        }
    }
}

impl CommandQueue for &StdCommandQueue {
    fn send(&self, command: Command) -> bool {
        (**self).send(command)
    }

    fn receive(&self, timeout_ms: Option<u32>) -> Option<Command> {
        (**self).receive(timeout_ms)
    }
}

/// A binary semaphore, starting "given" (available).
pub struct StdSemaphore {
    state: Mutex<bool>,
    cond: Condvar,
}

impl StdSemaphore {
    pub fn new() -> Self {
        StdSemaphore {
            state: Mutex::new(true),
            cond: Condvar::new(),
        }
    }
}

impl Default for StdSemaphore {
    fn default() -> Self {
        Self::new()
    }
}

impl AccessSemaphore for StdSemaphore {
    fn take(&self, timeout_ms: u32) -> bool {
        let mut available = self.state.lock().unwrap();
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        while !*available {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, result) = self.cond.wait_timeout(available, deadline - now).unwrap();
            available = guard;
            if result.timed_out() && !*available {
                return false;
            }
        }
        *available = false;
        true
    }

    fn give(&self) {
        let mut available = self.state.lock().unwrap();
        *available = true;
        self.cond.notify_one();
    }
}
