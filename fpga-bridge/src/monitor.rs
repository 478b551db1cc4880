//! Register polling loop.
//!
//! Each iteration drives an LED register with a wrapping 8-bit counter,
//! reads every register of the view once and rewrites a single status line.
//! The loop is bounded by an optional iteration count and a stop flag that
//! is checked before every iteration.

use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use thiserror::Error;

use crate::registers::RegisterView;
use crate::window::{MemDevice, WindowError};

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error(transparent)]
    Register(#[from] WindowError),

    #[error("cannot write status line: {0}")]
    Output(#[from] io::Error),
}

/// Wrapping LED pattern: 1, 2, ..., 0xFF, 0, 1, ...
#[derive(Debug, Clone, Default)]
pub struct LedCounter {
    value: u32,
}

impl LedCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Step the counter and return the new value.
    pub fn advance(&mut self) -> u32 {
        self.value = if self.value == 0xFF { 0 } else { self.value + 1 };
        self.value
    }
}

impl Iterator for LedCounter {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        Some(self.advance())
    }
}

/// Header naming each column, padded to the width of a formatted value.
pub fn header<'a>(names: impl IntoIterator<Item = &'a str>) -> String {
    names
        .into_iter()
        .map(|n| format!("{:<10}", n))
        .collect::<Vec<_>>()
        .join(" | ")
        .trim_end()
        .to_string()
}

/// One table row: `0x%08X` per value, `" | "` separated.
pub fn row(values: impl IntoIterator<Item = u32>) -> String {
    values
        .into_iter()
        .map(|v| format!("0x{:08X}", v))
        .collect::<Vec<_>>()
        .join(" | ")
}

/// Polling policy.
#[derive(Debug, Clone)]
pub struct Monitor {
    pub interval: Duration,
    /// `None` runs until the stop flag is raised.
    pub iterations: Option<u64>,
    pub stop: Arc<AtomicBool>,
}

impl Monitor {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            iterations: None,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn iterations(mut self, count: u64) -> Self {
        self.iterations = Some(count);
        self
    }

    pub fn stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    fn should_stop(&self, done: u64) -> bool {
        self.stop.load(Ordering::Relaxed) || self.iterations.is_some_and(|n| done >= n)
    }

    /// Run the loop over `view`, writing the header and one `\r`-prefixed
    /// status line per iteration to `out`. Returns the number of iterations
    /// completed.
    pub fn run<D, W>(
        &self,
        view: &RegisterView<'_, D>,
        led_register: Option<&str>,
        out: &mut W,
    ) -> Result<u64, MonitorError>
    where
        D: MemDevice,
        W: Write,
    {
        // Resolve before touching hardware so a typo fails fast.
        let led_offset = led_register.map(|name| view.offset(name)).transpose()?;
        let mut leds = LedCounter::new();

        writeln!(out, "{}", header(view.labels()))?;

        let mut done = 0;
        while !self.should_stop(done) {
            if let Some(offset) = led_offset {
                view.window().write(offset, leds.advance())?;
            }

            let values = view.snapshot()?;
            write!(out, "\r{}", row(values.into_iter().map(|(_, v)| v)))?;
            out.flush()?;

            done += 1;
            if !self.interval.is_zero() && !self.should_stop(done) {
                thread::sleep(self.interval);
            }
        }
        writeln!(out)?;

        log::debug!("monitor stopped after {} iterations", done);
        Ok(done)
    }
}
