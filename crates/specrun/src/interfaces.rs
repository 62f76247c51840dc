//! The plug points the engine consumes: reporting, the progress writer,
//! output interception, interrupts, and parallel coordination. The engine
//! ships no-op implementations for everything and a manual interrupt handler
//! for embedders; real implementations (signal handling, process forking,
//! HTTP coordination) live outside the core.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::ClientError;
use crate::report::{Report, SpecReport, SpecState};

/// Receives suite and spec lifecycle events.
pub trait Reporter {
    fn suite_will_begin(&mut self, _report: &Report) {}
    fn will_run(&mut self, _report: &SpecReport) {}
    fn did_run(&mut self, _report: &SpecReport) {}
    fn suite_did_end(&mut self, _report: &Report) {}
}

#[derive(Debug, Default)]
pub struct NoopReporter;

impl Reporter for NoopReporter {}

/// The progress writer: a byte sink truncated per attempt whose contents are
/// attached to the spec report.
pub trait Writer: Send {
    fn truncate(&mut self);
    fn append(&mut self, bytes: &[u8]);
    fn bytes(&self) -> Vec<u8>;
}

#[derive(Debug, Default)]
pub struct BufferWriter {
    buf: Vec<u8>,
}

impl BufferWriter {
    pub fn new() -> Self {
        BufferWriter::default()
    }
}

impl Writer for BufferWriter {
    fn truncate(&mut self) {
        self.buf.clear();
    }

    fn append(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn bytes(&self) -> Vec<u8> {
        self.buf.clone()
    }
}

/// The writer is shared with user bodies (via `by` and `current_spec_report`),
/// so it travels behind a mutex.
pub type SharedWriter = Arc<Mutex<dyn Writer>>;

pub fn shared_buffer_writer() -> SharedWriter {
    Arc::new(Mutex::new(BufferWriter::new()))
}

/// Captures stdout/stderr around node bodies. The real implementation
/// redirects file descriptors; the core only needs these three calls.
pub trait OutputInterceptor {
    fn start_intercepting_output(&mut self) {}
    fn start_intercepting_output_and_forward_to(&mut self, _client: &dyn Client) {}
    fn stop_intercepting_and_return_output(&mut self) -> String {
        String::new()
    }
}

#[derive(Debug, Default)]
pub struct NoopOutputInterceptor;

impl OutputInterceptor for NoopOutputInterceptor {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterruptCause {
    Signal,
    Timeout,
    AbortByOtherProcess,
}

impl fmt::Display for InterruptCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InterruptCause::Signal => "Interrupted by signal",
            InterruptCause::Timeout => "Interrupted by timeout",
            InterruptCause::AbortByOtherProcess => "Interrupted by another parallel process",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct InterruptStatus {
    pub interrupted: bool,
    pub cause: Option<InterruptCause>,
}

/// Delivers external cancellation. The engine polls `status()` at node
/// boundaries; report nodes install a placeholder message instead of being
/// interrupted.
pub trait InterruptHandler {
    fn status(&self) -> InterruptStatus;
    fn set_interrupt_placeholder_message(&self, message: String);
    fn clear_interrupt_placeholder_message(&self);
    fn interrupt_message_with_stack_traces(&self) -> String;
}

/// Never interrupted. The default for embedders that handle signals themselves.
#[derive(Debug, Default)]
pub struct NoopInterruptHandler;

impl InterruptHandler for NoopInterruptHandler {
    fn status(&self) -> InterruptStatus {
        InterruptStatus {
            interrupted: false,
            cause: None,
        }
    }

    fn set_interrupt_placeholder_message(&self, _message: String) {}

    fn clear_interrupt_placeholder_message(&self) {}

    fn interrupt_message_with_stack_traces(&self) -> String {
        "interrupted".to_string()
    }
}

/// A flag-based handler: call [`ManualInterruptHandler::interrupt`] from any
/// thread (a signal hook, a watchdog) and the engine picks it up at the next
/// node boundary.
#[derive(Debug, Default)]
pub struct ManualInterruptHandler {
    interrupted: AtomicBool,
    cause: Mutex<Option<InterruptCause>>,
    placeholder: Mutex<Option<String>>,
}

impl ManualInterruptHandler {
    pub fn new() -> Self {
        ManualInterruptHandler::default()
    }

    pub fn interrupt(&self, cause: InterruptCause) {
        *self.cause.lock().expect("interrupt cause mutex poisoned") = Some(cause);
        self.interrupted.store(true, Ordering::SeqCst);
    }
}

impl InterruptHandler for ManualInterruptHandler {
    fn status(&self) -> InterruptStatus {
        InterruptStatus {
            interrupted: self.interrupted.load(Ordering::SeqCst),
            cause: *self.cause.lock().expect("interrupt cause mutex poisoned"),
        }
    }

    fn set_interrupt_placeholder_message(&self, message: String) {
        *self
            .placeholder
            .lock()
            .expect("placeholder mutex poisoned") = Some(message);
    }

    fn clear_interrupt_placeholder_message(&self) {
        *self
            .placeholder
            .lock()
            .expect("placeholder mutex poisoned") = None;
    }

    fn interrupt_message_with_stack_traces(&self) -> String {
        if let Some(placeholder) = self
            .placeholder
            .lock()
            .expect("placeholder mutex poisoned")
            .as_ref()
        {
            return placeholder.clone();
        }
        match *self.cause.lock().expect("interrupt cause mutex poisoned") {
            Some(cause) => cause.to_string(),
            None => "interrupted".to_string(),
        }
    }
}

/// The only cross-process communication surface. In parallel mode the engine
/// fetches group indices, posts reports, and synchronizes suite fixtures
/// through this; the wire format is the client's business.
pub trait Client {
    fn fetch_next_counter(&self) -> Result<usize, ClientError>;
    fn post_did_run(&self, report: &SpecReport) -> Result<(), ClientError>;
    fn post_abort(&self) -> Result<(), ClientError>;
    fn post_suite_will_begin(&self, report: &Report) -> Result<(), ClientError>;
    fn post_suite_did_end(&self, report: &Report) -> Result<(), ClientError>;
    fn block_until_nonprimary_procs_have_finished(&self) -> Result<(), ClientError>;
    fn post_synchronized_before_suite_completed(
        &self,
        state: SpecState,
        data: Vec<u8>,
    ) -> Result<(), ClientError>;
    fn block_until_synchronized_before_suite_data(&self)
        -> Result<(SpecState, Vec<u8>), ClientError>;
    fn block_until_aggregated_nonprimary_procs_report(&self) -> Result<Report, ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_writer_truncates_and_accumulates() {
        let mut writer = BufferWriter::new();
        writer.append(b"hello ");
        writer.append(b"world");
        assert_eq!(writer.bytes(), b"hello world");
        writer.truncate();
        assert!(writer.bytes().is_empty());
    }

    #[test]
    fn manual_interrupt_handler_reports_cause() {
        let handler = ManualInterruptHandler::new();
        assert!(!handler.status().interrupted);
        handler.interrupt(InterruptCause::Signal);
        let status = handler.status();
        assert!(status.interrupted);
        assert_eq!(status.cause, Some(InterruptCause::Signal));
    }

    #[test]
    fn placeholder_message_takes_precedence() {
        let handler = ManualInterruptHandler::new();
        handler.interrupt(InterruptCause::Signal);
        handler.set_interrupt_placeholder_message("busy reporting".to_string());
        assert_eq!(handler.interrupt_message_with_stack_traces(), "busy reporting");
        handler.clear_interrupt_placeholder_message();
        assert_eq!(
            handler.interrupt_message_with_stack_traces(),
            "Interrupted by signal"
        );
    }
}
