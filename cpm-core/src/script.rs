//! Driving an emulator through a scripted interaction, the way an
//! automated compile-and-run package action works: queue input, wait for
//! expected output, repeat, then let the run finish or time it out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use crate::console::{ScriptedConsole, WaitPattern};
use crate::error::{CpmError, CpmResult};
use crate::CpmExitInfo;

/// Settle time after a `Wait` hits, before the next queued input goes out,
/// so the driven program has a moment to finish printing its prompt.
const STEP_SETTLE_DELAY: Duration = Duration::from_millis(100);

/// One step of a scripted interaction.
pub enum ScriptStep {
    /// Block until the console's output buffer matches `pattern`.
    Wait { pattern: WaitPattern, timeout: Duration },
    /// Queue `text` as input, instantly.
    Send { text: String },
    /// Queue `text` as input, one character every `delay` (imitates typing).
    SendSlow { text: String, delay: Duration },
}

impl ScriptStep {
    pub fn wait_for(pattern: impl Into<String>, timeout: Duration) -> Self {
        ScriptStep::Wait {
            pattern: WaitPattern::substring(pattern),
            timeout,
        }
    }

    pub fn send(text: impl Into<String>) -> Self {
        ScriptStep::Send { text: text.into() }
    }

    pub fn send_slow(text: impl Into<String>, delay: Duration) -> Self {
        ScriptStep::SendSlow {
            text: text.into(),
            delay,
        }
    }

    /// Substitute `{name}` in `Send`/`SendSlow` steps with `name`.
    fn with_name_substituted(self, name: &str) -> Self {
        match self {
            ScriptStep::Send { text } => ScriptStep::Send {
                text: text.replace("{name}", name),
            },
            ScriptStep::SendSlow { text, delay } => ScriptStep::SendSlow {
                text: text.replace("{name}", name),
                delay,
            },
            other => other,
        }
    }
}

/// Drives an emulator run through a sequence of [`ScriptStep`]s against a
/// [`ScriptedConsole`], on a background thread, with an overall timeout.
pub struct ScriptedCompiler;

impl ScriptedCompiler {
    /// Run `steps` (with `{name}` substituted into Send text) against an
    /// emulator built and driven by `run_emulator`, which is handed the
    /// console to attach and a cancellation flag it must check
    /// periodically (e.g. each instruction-dispatch loop iteration).
    ///
    /// `run_emulator` executes on a background thread. If `outer_timeout`
    /// elapses before it finishes, the cancellation flag is set and an
    /// error is returned; the background thread is left to wind down.
    pub fn run<F>(
        steps: Vec<ScriptStep>,
        name: &str,
        outer_timeout: Duration,
        run_emulator: F,
    ) -> CpmResult<CpmExitInfo>
    where
        F: FnOnce(ScriptedConsole, Arc<AtomicBool>) -> CpmResult<CpmExitInfo> + Send + 'static,
    {
        let console = ScriptedConsole::new();
        let cancel = Arc::new(AtomicBool::new(false));

        let (tx, rx) = mpsc::channel();
        let thread_console = console.clone();
        let thread_cancel = cancel.clone();
        std::thread::spawn(move || {
            let result = run_emulator(thread_console, thread_cancel);
            let _ = tx.send(result);
        });

        for step in steps {
            let step = step.with_name_substituted(name);
            match step {
                ScriptStep::Wait { pattern, timeout } => {
                    console.wait_for(&pattern, timeout)?;
                    console.clear_output_buffer();
                    std::thread::sleep(STEP_SETTLE_DELAY);
                }
                ScriptStep::Send { text } => {
                    console.queue_input(&text);
                }
                ScriptStep::SendSlow { text, delay } => {
                    console.queue_input_slow(&text, delay);
                }
            }
        }

        match rx.recv_timeout(outer_timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                cancel.store(true, Ordering::SeqCst);
                Err(CpmError::Timeout)
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(CpmError::Cancelled("emulator thread ended without a result".to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ExitReason;

    #[test]
    fn test_name_substitution() {
        let step = ScriptStep::send("RUN {name}.COM\r").with_name_substituted("HELLO");
        match step {
            ScriptStep::Send { text } => assert_eq!(text, "RUN HELLO.COM\r"),
            _ => panic!("expected Send"),
        }
    }

    #[test]
    fn test_scripted_run_completes() {
        let steps = vec![
            ScriptStep::wait_for("READY", Duration::from_millis(500)),
            ScriptStep::send("GO\r"),
        ];

        let result = ScriptedCompiler::run(steps, "TEST", Duration::from_secs(2), |mut console, _cancel| {
            use crate::console::CpmConsole;
            console.write(b'R');
            console.write(b'E');
            console.write(b'A');
            console.write(b'D');
            console.write(b'Y');
            let _ = console.wait_for_key();
            Ok(CpmExitInfo {
                reason: ExitReason::Halt,
                t_states: 0,
                pc: 0,
            })
        });

        assert!(result.is_ok());
    }

    #[test]
    fn test_scripted_run_times_out_and_cancels() {
        let steps = vec![ScriptStep::wait_for("NEVER", Duration::from_millis(30))];

        let result = ScriptedCompiler::run(steps, "TEST", Duration::from_millis(100), |_console, cancel| {
            while !cancel.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(CpmError::Cancelled("cancelled".to_string()))
        });

        assert!(result.is_err());
    }
}
