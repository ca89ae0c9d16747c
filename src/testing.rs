//! In-memory stand-ins for the serial link.

use crate::connection::{Bus, Client, Connect, Error, ReadError};
use crate::registers::RegisterAddress;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Clone, Debug)]
pub(crate) struct Call {
    pub at: Instant,
    pub address: u16,
    pub count: u16,
}

pub(crate) type CallLog = Arc<Mutex<Vec<Call>>>;

/// A device with a fixed register image.
///
/// Registers that were never set read as zero. Reads can be made to fail a number of times in a
/// row, or indefinitely while the shared `broken` flag is raised.
pub(crate) struct ScriptedBus {
    device_id: u8,
    registers: HashMap<u16, u16>,
    fail_next: usize,
    broken: Arc<AtomicBool>,
    log: CallLog,
}

impl ScriptedBus {
    pub fn new(device_id: u8) -> Self {
        Self {
            device_id,
            registers: HashMap::new(),
            fail_next: 0,
            broken: Arc::default(),
            log: Arc::default(),
        }
    }

    pub fn with(mut self, at: RegisterAddress, words: &[u16]) -> Self {
        for (address, word) in (at.linear()..).zip(words) {
            self.registers.insert(address, *word);
        }
        self
    }

    pub fn failing(mut self, count: usize) -> Self {
        self.fail_next = count;
        self
    }

    pub fn broken_by(mut self, flag: Arc<AtomicBool>) -> Self {
        self.broken = flag;
        self
    }

    pub fn logging_to(mut self, log: CallLog) -> Self {
        self.log = log;
        self
    }

    pub fn log(&self) -> CallLog {
        Arc::clone(&self.log)
    }
}

impl Bus for ScriptedBus {
    fn device_id(&self) -> u8 {
        self.device_id
    }

    async fn read_holdings(&mut self, address: u16, count: u16) -> Result<Vec<u16>, ReadError> {
        self.log.lock().unwrap().push(Call { at: Instant::now(), address, count });
        if self.broken.load(Ordering::SeqCst) {
            return Err(ReadError::Busy);
        }
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(ReadError::Timeout(Duration::from_secs(1)));
        }
        Ok((address..address + count)
            .map(|a| self.registers.get(&a).copied().unwrap_or(0))
            .collect())
    }
}

/// Hands out a fresh bus from `make` on every connection attempt, recording when they happened.
pub(crate) struct ScriptedConnector<F> {
    make: F,
    pub connects: Arc<Mutex<Vec<Instant>>>,
}

impl<F: FnMut(usize) -> Option<ScriptedBus>> ScriptedConnector<F> {
    pub fn new(make: F) -> Self {
        Self { make, connects: Arc::default() }
    }
}

impl<F: FnMut(usize) -> Option<ScriptedBus>> Connect for ScriptedConnector<F> {
    type Bus = ScriptedBus;

    async fn connect(&mut self) -> Result<Client<ScriptedBus>, Error> {
        let attempt = {
            let mut connects = self.connects.lock().unwrap();
            connects.push(Instant::now());
            connects.len() - 1
        };
        match (self.make)(attempt) {
            Some(bus) => Ok(Client::new(bus)),
            None => Err(Error::OpenPort(
                tokio_serial::Error::new(tokio_serial::ErrorKind::NoDevice, "no such device"),
                "/dev/null".into(),
            )),
        }
    }
}
