//! The `testFS` debug command (§6 CLI surface, §9 design note).
//!
//! The serial/debug console that registers and dispatches commands is an
//! external collaborator (§1 Non-goals); this module implements only the
//! one command it would register. Per the original's observable behavior,
//! the self-test allocates a 512-byte buffer, fills it with a recognizable
//! pattern, drives it out over a raw DMA burst, and logs the result — it
//! never issues an actual write command against the card protocol. Treat it
//! as diagnostic only.

use crate::blockdevice::Block;
use crate::transport::Transport;
use crate::{debug, warn};

/// Name the console should register this command under.
pub const COMMAND_NAME: &str = "testFS";

/// Ceiling, in milliseconds, on the self-test's DMA burst.
const TEST_DMA_CEILING_MS: u32 = 1_000;

/// Run the `testFS` self-test against a raw transport. Returns `0` on
/// success, matching the console convention of "exit code 0 on success".
pub fn run<T: Transport>(transport: &mut T) -> i32 {
    let mut contents = [0u8; Block::LEN];
    for (i, byte) in contents.iter_mut().enumerate() {
        *byte = (i % 256) as u8;
    }

    if transport.select().is_err() {
        warn!("testFS: failed to select card");
        return 1;
    }

    let result = transport.dma_burst(&mut contents, TEST_DMA_CEILING_MS);
    let _ = transport.deselect();

    match result {
        Ok(()) => {
            let block = Block { contents };
            debug!("testFS: DMA burst ok, buffer={:?}", block);
            0
        }
        Err(_) => {
            warn!("testFS: DMA burst failed");
            1
        }
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
