//! Paced, retrying register reads.
//!
//! The controller is slow and shares a half-duplex line, so a read that fails is routine rather
//! than exceptional. Reads here are spaced out, preceded by a throwaway read, and retried with a
//! linearly growing delay before the failure is reported upwards.

use crate::connection::{Bus, Client, ReadError};
use crate::registers::{DecodedValue, Field, RegisterAddress};
use std::time::Duration;
use tracing::{debug, trace};

/// Idle time on the bus before every read. The device answers "busy" when polled faster.
pub const PACING_DELAY: Duration = Duration::from_millis(100);
pub const READ_ATTEMPTS: u32 = 5;
/// The delay after the n-th failed attempt is n times this.
pub const BACKOFF_STEP: Duration = Duration::from_millis(100);

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("read failed at {address} after {attempts} attempts")]
    ReadFailed {
        address: RegisterAddress,
        attempts: u32,
        #[source]
        last: ReadError,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timing {
    pub pacing: Duration,
    pub attempts: u32,
    pub backoff_step: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self { pacing: PACING_DELAY, attempts: READ_ATTEMPTS, backoff_step: BACKOFF_STEP }
    }
}

#[derive(clap::Parser, Clone)]
#[group(id = "reader::Args")]
pub struct Args {
    /// Time to leave the bus idle before each read.
    #[arg(long, default_value = "100ms")]
    pacing: humantime::Duration,

    /// Give up on a register after this many failed reads.
    #[arg(
        long,
        default_value_t = READ_ATTEMPTS,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    read_attempts: u32,

    /// Wait this long after the first failed read, twice as long after the second, and so on.
    #[arg(long, default_value = "100ms")]
    backoff_step: humantime::Duration,
}

impl Args {
    pub fn timing(&self) -> Timing {
        Timing {
            pacing: *self.pacing,
            attempts: self.read_attempts,
            backoff_step: *self.backoff_step,
        }
    }
}

pub struct RetryingReader<B> {
    client: Client<B>,
    timing: Timing,
}

impl<B: Bus> RetryingReader<B> {
    pub fn new(client: Client<B>, timing: Timing) -> Self {
        Self { client, timing }
    }

    pub fn client_mut(&mut self) -> &mut Client<B> {
        &mut self.client
    }

    pub async fn read(&mut self, field: Field) -> Result<DecodedValue, Error> {
        let raw = self.read_raw(field).await?;
        Ok(field.descriptor.decode(raw))
    }

    /// Read the undecoded value of `field`, retrying transient and protocol failures alike.
    pub async fn read_raw(&mut self, field: Field) -> Result<i64, Error> {
        let Field { address, descriptor } = field;
        let (width, signed) = (descriptor.width, descriptor.signed);
        trace!(message = "reading", %address);
        tokio::time::sleep(self.timing.pacing).await;

        // The first request after a pause is unreliable. Its outcome is discarded, even when it
        // succeeds. A busy device gets another pacing interval before the real attempts.
        if let Err(e) = self.client.read_raw(address, width, signed).await {
            debug!(
                message = "priming read failed",
                %address,
                error = (&e as &dyn std::error::Error)
            );
            if matches!(e, ReadError::Busy) {
                tokio::time::sleep(self.timing.pacing).await;
            }
        }

        let attempts = self.timing.attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.client.read_raw(address, width, signed).await {
                Ok(raw) => {
                    trace!(message = "read", %address, raw, attempt);
                    return Ok(raw);
                }
                Err(e) => {
                    debug!(
                        message = "read attempt failed",
                        %address,
                        attempt,
                        transient = e.is_transient(),
                        error = (&e as &dyn std::error::Error)
                    );
                    tokio::time::sleep(self.timing.backoff_step * attempt).await;
                    if attempt >= attempts {
                        return Err(Error::ReadFailed { address, attempts, last: e });
                    }
                }
            }
        }
    }
}
