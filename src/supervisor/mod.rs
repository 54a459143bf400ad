//! The card supervisor: state machine, command queue dispatch, and the
//! client-facing "touch" entry point (§4.6, §4.7).
//!
//! Concurrency primitives (`CommandQueue`, `AccessSemaphore`) are traits
//! rather than a concrete RTOS binding, so the state machine here is
//! portable and host-testable; see `host` below for the `std`-backed
//! doubles used by this crate's own tests.

use crate::driver::{AcquireOpts, CardDriver};
use crate::fs::Filesystem;
use crate::power::PowerControl;
use crate::transport::Transport;
use crate::{debug, warn};
use core::cell::{Cell, RefCell};
use embedded_hal::delay::DelayNs;

/// Supervisor state (§3).
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum State {
    /// No card detected; power off; unmounted.
    NotPresent,
    /// Card present, mounted, powered down, not initialized.
    LowPower,
    /// Card powered up, initialized, ready for I/O.
    Ready,
    /// Init failed after retries; access locked out until a timeout clears it.
    Error,
}

/// Command-queue entries (§3).
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Command {
    /// The blocking receive expired.
    Timeout,
    /// A client wants to use the card.
    Access,
    /// Explicit request to sleep the card.
    GoLowPower,
    /// The card-detect pin changed.
    IoEvent,
}

/// Errors the filesystem glue (or any client) observes from the supervisor.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone)]
pub enum Error {
    /// The card did not reach `Ready` within the access window.
    Timeout,
}

/// Timing and retry knobs (§4.6/§5), with the spec's literal defaults.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How long the queue receive blocks while `Ready`/`Error`, in ms,
    /// before a `Timeout` command is synthesised.
    pub idle_shutoff_ms: u32,
    /// Bound on a client's semaphore wait while requesting access, in ms.
    pub access_timeout_ms: u32,
    /// Card-detect debounce delay, in microseconds.
    pub debounce_us: u32,
    /// Number of `initialize()` attempts before declaring `Error`.
    pub init_retries: u32,
    /// Delay between init attempts, in microseconds.
    pub init_retry_delay_us: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        SupervisorConfig {
            idle_shutoff_ms: 1_000,
            access_timeout_ms: 500,
            debounce_us: 10_000,
            init_retries: 5,
            init_retry_delay_us: 100_000,
        }
    }
}

/// A bounded (capacity 2), drop-newest-on-overflow command queue.
pub trait CommandQueue {
    /// Enqueue a command without blocking. Returns `false` if the queue was
    /// full and the command was dropped.
    fn send(&self, command: Command) -> bool;

    /// Block for up to `timeout_ms` (or indefinitely, if `None`) for a
    /// command. Returns `None` on timeout.
    fn receive(&self, timeout_ms: Option<u32>) -> Option<Command>;
}

/// A single binary semaphore used both as a mutex around the command-queue
/// round trip and as the completion signal back to a waiting client.
pub trait AccessSemaphore {
    /// Take the semaphore, blocking up to `timeout_ms`. Returns `false` on
    /// timeout.
    fn take(&self, timeout_ms: u32) -> bool;

    /// Release the semaphore.
    fn give(&self);
}

/// Samples the physical card-detect pin.
pub trait CardDetect {
    /// True if a card is currently inserted.
    fn is_present(&self) -> bool;
}

/// Owns the card's power/presence state machine and serializes client
/// access to the one card slot.
pub struct Supervisor<T, P, Q, S, D, F, DELAY>
where
    T: Transport,
    P: PowerControl,
    Q: CommandQueue,
    S: AccessSemaphore,
    D: CardDetect,
    F: Filesystem,
    DELAY: DelayNs,
{
    driver: CardDriver<T>,
    power: RefCell<P>,
    queue: Q,
    semaphore: S,
    detect: D,
    filesystem: F,
    delay: RefCell<DELAY>,
    state: Cell<State>,
    dispatching: Cell<bool>,
    config: SupervisorConfig,
}

impl<T, P, Q, S, D, F, DELAY> Supervisor<T, P, Q, S, D, F, DELAY>
where
    T: Transport,
    P: PowerControl,
    Q: CommandQueue,
    S: AccessSemaphore,
    D: CardDetect,
    F: Filesystem,
    DELAY: DelayNs,
{
    /// Build a supervisor. Mirrors `FS_init`'s behavior of seeding an
    /// initial `IoEvent` if the card is already present at construction, so
    /// a card inserted before power-on is picked up without waiting for a
    /// detect-pin edge.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: T,
        acquire_opts: AcquireOpts,
        power: P,
        queue: Q,
        semaphore: S,
        detect: D,
        filesystem: F,
        delay: DELAY,
        config: SupervisorConfig,
    ) -> Self {
        let present = detect.is_present();
        let sup = Supervisor {
            driver: CardDriver::with_options(transport, acquire_opts),
            power: RefCell::new(power),
            queue,
            semaphore,
            detect,
            filesystem,
            delay: RefCell::new(delay),
            state: Cell::new(State::NotPresent),
            dispatching: Cell::new(false),
            config,
        };
        if present {
            sup.queue.send(Command::IoEvent);
        }
        sup
    }

    /// Current supervisor state.
    pub fn state(&self) -> State {
        self.state.get()
    }

    /// The underlying card driver, for I/O after a successful [`Supervisor::touch`].
    pub fn driver(&self) -> &CardDriver<T> {
        &self.driver
    }

    /// Run one supervisor dispatch cycle (§4.6): receive one command
    /// (blocking, with a finite wait while `Ready`/`Error` and an unbounded
    /// wait otherwise), dispatch it, then signal the access semaphore and
    /// implicitly re-enable the card-detect interrupt (modeled here as a
    /// no-op; a real binding re-enables its own IRQ after this call
    /// returns).
    pub fn run_once(&self) {
        let timeout = match self.state.get() {
            State::Ready | State::Error => Some(self.config.idle_shutoff_ms),
            State::NotPresent | State::LowPower => None,
        };
        let command = self.queue.receive(timeout).unwrap_or(Command::Timeout);

        self.dispatching.set(true);
        match command {
            Command::IoEvent => self.handle_io_event(),
            Command::Access => self.handle_access(),
            Command::GoLowPower | Command::Timeout => self.handle_idle_or_sleep(),
        }
        self.dispatching.set(false);

        self.semaphore.give();
    }

    fn handle_io_event(&self) {
        self.delay.borrow_mut().delay_us(self.config.debounce_us);
        let present = self.detect.is_present();

        if present {
            if self.state.get() == State::NotPresent {
                match self.filesystem.mount() {
                    Ok(()) => {
                        self.state.set(State::LowPower);
                        debug!("card connected, mounted");
                    }
                    Err(_) => warn!("mount failed"),
                }
            }
        } else if self.state.get() != State::NotPresent {
            let _ = self.filesystem.unmount();
            self.state.set(State::NotPresent);
            self.power_down();
            debug!("card disconnected, unmounted");
        }
    }

    fn handle_access(&self) {
        if self.state.get() == State::LowPower {
            self.power_up();
            if self.init_with_retries() {
                self.state.set(State::Ready);
                debug!("card ready");
            } else {
                self.power_down();
                self.state.set(State::Error);
                warn!("sd init failure, locking out until timeout");
            }
        }
    }

    fn handle_idle_or_sleep(&self) {
        match self.state.get() {
            State::Ready => {
                self.power_down();
                self.state.set(State::LowPower);
            }
            State::Error => {
                self.state.set(State::LowPower);
            }
            State::NotPresent | State::LowPower => {}
        }
    }

    fn init_with_retries(&self) -> bool {
        for _ in 0..self.config.init_retries {
            if self.driver.initialize().is_ok() {
                return true;
            }
            self.delay.borrow_mut().delay_us(self.config.init_retry_delay_us);
        }
        false
    }

    fn power_up(&self) {
        let _ = self.power.borrow_mut().power_up();
        self.driver.deinitialize();
    }

    fn power_down(&self) {
        let _ = self.power.borrow_mut().power_down();
        self.driver.deinitialize();
    }

    /// Client entry point (§4.7): ensure the card is powered and
    /// initialized, resetting the idle-shutoff timer.
    ///
    /// Re-entrant calls made from inside a dispatch cycle (e.g. the
    /// filesystem's mount callback touching the driver) return success
    /// immediately rather than deadlocking against the very dispatch that's
    /// calling them.
    pub fn touch(&self) -> bool {
        if self.dispatching.get() {
            return true;
        }

        if self.state.get() == State::Ready {
            self.queue.send(Command::Access);
            return true;
        }

        if !self.semaphore.take(self.config.access_timeout_ms) {
            return false;
        }
        self.queue.send(Command::Access);
        if !self.semaphore.take(self.config.access_timeout_ms) {
            return false;
        }
        self.semaphore.give();

        self.state.get() == State::Ready
    }

    /// [`Supervisor::touch`], as a `Result` for idiomatic call sites.
    pub fn ensure_ready(&self) -> Result<(), Error> {
        if self.touch() {
            Ok(())
        } else {
            Err(Error::Timeout)
        }
    }
}



// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
