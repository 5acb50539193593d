//! Console I/O abstraction for CP/M emulator.
//!
//! The `CpmConsole` trait provides character I/O that works identically
//! for both testing (HeadlessConsole) and real terminals.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{CpmError, CpmResult};

/// Console interface for CP/M character I/O.
pub trait CpmConsole: Send {
    /// Write a character to console output.
    fn write(&mut self, ch: u8);

    /// Write to printer (optional, can be no-op).
    fn print(&mut self, _ch: u8) {}

    /// Check if a key is available (non-blocking).
    fn has_key(&self) -> bool;

    /// Get next key from buffer. Returns None if no key available.
    fn get_key(&mut self) -> Option<u8>;

    /// Wait for a key (blocking). Default implementation polls.
    fn wait_for_key(&mut self) -> u8 {
        loop {
            if let Some(key) = self.get_key() {
                return key;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }
}

/// Headless console for testing - captures output, provides queued input.
#[derive(Default)]
pub struct HeadlessConsole {
    output: Vec<u8>,
    input: VecDeque<u8>,
}

impl HeadlessConsole {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with pre-queued input.
    pub fn with_input(input: &[u8]) -> Self {
        Self {
            output: Vec::new(),
            input: input.iter().copied().collect(),
        }
    }

    /// Queue input characters.
    pub fn queue_input(&mut self, input: &[u8]) {
        self.input.extend(input.iter().copied());
    }

    /// Queue a string as input (converts to bytes).
    pub fn queue_string(&mut self, s: &str) {
        self.queue_input(s.as_bytes());
    }

    /// Get all output as bytes.
    pub fn output(&self) -> &[u8] {
        &self.output
    }

    /// Get output as string (lossy UTF-8 conversion).
    pub fn output_string(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }

    /// Clear output buffer.
    pub fn clear_output(&mut self) {
        self.output.clear();
    }
}

impl CpmConsole for HeadlessConsole {
    fn write(&mut self, ch: u8) {
        self.output.push(ch);
    }

    fn has_key(&self) -> bool {
        !self.input.is_empty()
    }

    fn get_key(&mut self) -> Option<u8> {
        self.input.pop_front()
    }

    fn wait_for_key(&mut self) -> u8 {
        // For headless, just return from queue or 0 if empty
        self.input.pop_front().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headless_console_output() {
        let mut console = HeadlessConsole::new();
        console.write(b'H');
        console.write(b'i');
        assert_eq!(console.output_string(), "Hi");
    }

    #[test]
    fn test_headless_console_input() {
        let mut console = HeadlessConsole::with_input(b"ABC");
        assert!(console.has_key());
        assert_eq!(console.get_key(), Some(b'A'));
        assert_eq!(console.get_key(), Some(b'B'));
        assert_eq!(console.get_key(), Some(b'C'));
        assert!(!console.has_key());
        assert_eq!(console.get_key(), None);
    }
}

/// A pattern a [`ScriptedConsole::wait_for`] call waits to see in the
/// printable-output buffer.
pub enum WaitPattern {
    Substring(String),
    Predicate(Box<dyn Fn(&str) -> bool + Send>),
}

impl WaitPattern {
    pub fn substring(s: impl Into<String>) -> Self {
        WaitPattern::Substring(s.into())
    }

    pub fn predicate<F: Fn(&str) -> bool + Send + 'static>(f: F) -> Self {
        WaitPattern::Predicate(Box::new(f))
    }

    fn matches(&self, buffer: &str) -> bool {
        match self {
            WaitPattern::Substring(s) => buffer.contains(s.as_str()),
            WaitPattern::Predicate(f) => f(buffer),
        }
    }
}

#[derive(Default)]
struct ScriptedConsoleInner {
    output: String,
    history: Vec<u8>,
    capture_history: bool,
    input: VecDeque<u8>,
}

/// A console that accumulates a printable-output buffer for expect-style
/// pattern waiting, on top of the baseline [`CpmConsole`] contract.
///
/// Cloning shares the same underlying buffers: a clone handed to a driver
/// thread sees the same output the running emulator produces.
#[derive(Clone)]
pub struct ScriptedConsole {
    inner: Arc<Mutex<ScriptedConsoleInner>>,
    condvar: Arc<Condvar>,
}

impl ScriptedConsole {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ScriptedConsoleInner::default())),
            condvar: Arc::new(Condvar::new()),
        }
    }

    /// Like `new`, but also capture the full byte history (incl. CR/LF),
    /// not just the printable-output buffer.
    pub fn with_history() -> Self {
        let console = Self::new();
        console.inner.lock().unwrap().capture_history = true;
        console
    }

    /// Clear the printable-output buffer. Called between interaction steps.
    pub fn clear_output_buffer(&self) {
        self.inner.lock().unwrap().output.clear();
    }

    pub fn output_buffer(&self) -> String {
        self.inner.lock().unwrap().output.clone()
    }

    pub fn history(&self) -> Vec<u8> {
        self.inner.lock().unwrap().history.clone()
    }

    /// Block until the output buffer matches `pattern`, or `timeout` elapses.
    pub fn wait_for(&self, pattern: &WaitPattern, timeout: Duration) -> CpmResult<()> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock().unwrap();
        loop {
            if pattern.matches(&guard.output) {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(CpmError::Timeout);
            }
            let (next_guard, _) = self.condvar.wait_timeout(guard, deadline - now).unwrap();
            guard = next_guard;
        }
    }

    /// Queue input immediately, with no inter-character delay.
    pub fn queue_input(&self, text: &str) {
        let mut guard = self.inner.lock().unwrap();
        guard.input.extend(text.bytes());
        self.condvar.notify_all();
    }

    /// Queue input characters one at a time with `delay` between each, to
    /// imitate typing. Blocks the calling thread for the typing duration.
    pub fn queue_input_slow(&self, text: &str, delay: Duration) {
        for byte in text.bytes() {
            {
                let mut guard = self.inner.lock().unwrap();
                guard.input.push_back(byte);
                self.condvar.notify_all();
            }
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
        }
    }
}

impl Default for ScriptedConsole {
    fn default() -> Self {
        Self::new()
    }
}

impl CpmConsole for ScriptedConsole {
    fn write(&mut self, ch: u8) {
        let mut guard = self.inner.lock().unwrap();
        if guard.capture_history {
            guard.history.push(ch);
        }
        if (0x20..=0x7E).contains(&ch) {
            guard.output.push(ch as char);
        }
        self.condvar.notify_all();
    }

    fn has_key(&self) -> bool {
        !self.inner.lock().unwrap().input.is_empty()
    }

    fn get_key(&mut self) -> Option<u8> {
        self.inner.lock().unwrap().input.pop_front()
    }

    fn wait_for_key(&mut self) -> u8 {
        let mut guard = self.inner.lock().unwrap();
        loop {
            if let Some(ch) = guard.input.pop_front() {
                return ch;
            }
            guard = self.condvar.wait(guard).unwrap();
        }
    }
}

#[cfg(test)]
mod scripted_tests {
    use super::*;

    #[test]
    fn test_scripted_console_output_filters_non_printable() {
        let mut console = ScriptedConsole::new();
        console.write(b'H');
        console.write(b'i');
        console.write(b'\r');
        console.write(b'\n');
        assert_eq!(console.output_buffer(), "Hi");
    }

    #[test]
    fn test_scripted_console_wait_for_substring() {
        let mut console = ScriptedConsole::new();
        console.write(b'O');
        console.write(b'K');
        console
            .wait_for(&WaitPattern::substring("OK"), Duration::from_millis(50))
            .expect("pattern should already be present");
    }

    #[test]
    fn test_scripted_console_wait_for_times_out() {
        let console = ScriptedConsole::new();
        let result = console.wait_for(&WaitPattern::substring("nope"), Duration::from_millis(20));
        assert!(matches!(result, Err(CpmError::Timeout)));
    }

    #[test]
    fn test_scripted_console_clear_output_buffer() {
        let mut console = ScriptedConsole::new();
        console.write(b'X');
        console.clear_output_buffer();
        assert_eq!(console.output_buffer(), "");
    }

    #[test]
    fn test_scripted_console_queue_input_order() {
        let console = ScriptedConsole::new();
        console.queue_input("AB");
        let mut reader = console.clone();
        assert_eq!(reader.get_key(), Some(b'A'));
        assert_eq!(reader.get_key(), Some(b'B'));
    }
}
