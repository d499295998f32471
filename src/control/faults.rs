//! Per-node fault injection.
//!
//! The dispatch layer consults a node's [`FaultState`] for every command:
//!
//! ```text
//!   command ──► FailMaker ──(armed)──► forced status response
//!                  │
//!                  ▼
//!             execute ──► response bytes ──► WritePlan
//!                                              ├── Full
//!                                              ├── Hiccup { offset, delay }
//!                                              └── Truncate { limit }
//! ```
//!
//! Changes made through the control channel apply to the next command the
//! node processes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::core::error::{ErrorCode, MockError, MockResult};

/// Forced failure of upcoming commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailMaker {
    pub code: ErrorCode,
    /// Commands left to fail. Negative fails forever.
    pub remaining: i32,
    /// Only fail this opcode when set.
    pub opcode: Option<u8>,
}

impl FailMaker {
    fn applies_to(&self, opcode: u8) -> bool {
        self.opcode.map_or(true, |op| op == opcode)
    }
}

/// How a response batch is written to the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePlan {
    Full,
    /// Write `offset` bytes, stall, then write the rest.
    Hiccup { offset: usize, delay: Duration },
    /// Write at most `limit` bytes and drop the rest.
    Truncate { limit: usize },
}

impl WritePlan {
    /// Split `len` bytes into (first chunk, optional pause, keep remainder).
    pub fn split(&self, len: usize) -> (usize, Option<Duration>, bool) {
        match *self {
            Self::Full => (len, None, false),
            Self::Hiccup { offset, delay } => (offset.min(len), Some(delay), true),
            Self::Truncate { limit } => (limit.min(len), None, false),
        }
    }
}

/// One recorded command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CommandLogEntry {
    pub opcode: u8,
    /// Milliseconds since recording started.
    pub ms: u64,
}

#[derive(Debug)]
struct CommandLog {
    started: Instant,
    entries: Vec<CommandLogEntry>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Hiccup {
    millis: u64,
    offset: usize,
}

/// Fault knobs of one node.
#[derive(Debug, Default)]
pub struct FaultState {
    fail: Mutex<Option<FailMaker>>,
    hiccup: Mutex<Hiccup>,
    truncate: Mutex<usize>,
    cmdlog: Mutex<Option<CommandLog>>,
    cmdlog_enabled: AtomicBool,
}

impl FaultState {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Forced errors
    // ========================================================================

    /// Arm the fail maker. A zero count or a success code disarms it.
    pub fn set_fail(&self, code: ErrorCode, count: i32, opcode: Option<u8>) {
        let mut fail = self.fail.lock();
        if count == 0 || code.is_success() {
            *fail = None;
            tracing::debug!("fail maker disarmed");
        } else {
            *fail = Some(FailMaker {
                code,
                remaining: count,
                opcode,
            });
            tracing::debug!(code = %code, count, ?opcode, "fail maker armed");
        }
    }

    pub fn fail_maker(&self) -> Option<FailMaker> {
        *self.fail.lock()
    }

    /// Status to force for this command, consuming one use of the fail maker.
    pub fn next_failure(&self, opcode: u8) -> Option<ErrorCode> {
        let mut fail = self.fail.lock();
        let maker = fail.as_mut()?;
        if !maker.applies_to(opcode) {
            return None;
        }
        let code = maker.code;
        if maker.remaining > 0 {
            maker.remaining -= 1;
            if maker.remaining == 0 {
                *fail = None;
            }
        }
        Some(code)
    }

    // ========================================================================
    // Write shaping
    // ========================================================================

    pub fn set_hiccup(&self, millis: i64, offset: i64) -> MockResult<()> {
        if millis < 0 || offset < 0 {
            return Err(MockError::control("hiccup values must be non-negative"));
        }
        *self.hiccup.lock() = Hiccup {
            millis: millis as u64,
            offset: offset as usize,
        };
        tracing::debug!(millis, offset, "hiccup configured");
        Ok(())
    }

    pub fn set_truncate(&self, limit: i64) -> MockResult<()> {
        if limit < 0 {
            return Err(MockError::control("truncate limit must be non-negative"));
        }
        *self.truncate.lock() = limit as usize;
        tracing::debug!(limit, "truncate configured");
        Ok(())
    }

    /// Plan for the next write. Truncation wins over a hiccup.
    pub fn write_plan(&self) -> WritePlan {
        let limit = *self.truncate.lock();
        if limit > 0 {
            return WritePlan::Truncate { limit };
        }
        let hiccup = *self.hiccup.lock();
        if hiccup.millis > 0 {
            return WritePlan::Hiccup {
                offset: hiccup.offset,
                delay: Duration::from_millis(hiccup.millis),
            };
        }
        WritePlan::Full
    }

    // ========================================================================
    // Command log
    // ========================================================================

    pub fn start_cmdlog(&self) {
        *self.cmdlog.lock() = Some(CommandLog {
            started: Instant::now(),
            entries: Vec::new(),
        });
        self.cmdlog_enabled.store(true, Ordering::Release);
    }

    pub fn stop_cmdlog(&self) {
        self.cmdlog_enabled.store(false, Ordering::Release);
        *self.cmdlog.lock() = None;
    }

    /// Recorded commands, or `None` when recording is off.
    pub fn cmdlog(&self) -> Option<Vec<CommandLogEntry>> {
        self.cmdlog.lock().as_ref().map(|log| log.entries.clone())
    }

    pub fn record(&self, opcode: u8) {
        if !self.cmdlog_enabled.load(Ordering::Acquire) {
            return;
        }
        if let Some(log) = self.cmdlog.lock().as_mut() {
            let ms = log.started.elapsed().as_millis() as u64;
            log.entries.push(CommandLogEntry { opcode, ms });
        }
    }
}
