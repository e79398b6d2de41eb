//! Utilities shared by the kernel tests
#![allow(dead_code)]
use std::sync::Mutex;

/// Records events in the order tasks report them. Task code only records
/// events; the test thread checks them after the simulation ends, so a
/// failed check doesn't strand the baton on a panicking task thread.
pub struct Trace {
    events: Mutex<Vec<String>>,
}

impl Trace {
    pub const fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, event: impl Into<String>) {
        let event = event.into();
        log::debug!("trace: {event}");
        self.events.lock().unwrap().push(event);
    }

    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }
}

/// Park the calling task for good.
pub fn park<Traits: pulsar_kernel::KernelTraits>() -> ! {
    loop {
        pulsar_kernel::System::<Traits>::pend().unwrap();
    }
}
