//! Lock-free log subsystem.
//!
//! Producers acquire a message slot through a ticket factory sized to
//! the message ring, format their line into the slot, and publish it
//! with a release store of the completion flag. Whoever fails to get a
//! ticket helps out by draining: a CAS elects a single drainer, which
//! consumes completed messages in ticket order, appends them to the log
//! file, and returns the whole run of tickets in one batch.
//!
//! On init the subsystem registers itself as the `grit-lib` facade
//! backend (so `log_*!` macros everywhere route here) and as the fatal
//! flush hook (so a dying process drains before exiting).
//!
//! Line format: `[S.MMMs] <System> <severity> - Thread N: <message>`.

use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use spin::{Mutex, Once};

use std::fs::File;
use std::io::Write as IoWrite;
use std::path::Path;

use grit_lib::log::{Severity, SystemTag};
use grit_mem::arena::Arena;
use grit_platform::thread::self_tid;
use grit_sync::ticket::{TicketFactory, TryTicket};

pub const LOG_MAX_MESSAGES: u32 = 512;
pub const LOG_MAX_MESSAGE_SIZE: usize = 512;

#[repr(C)]
struct LogMessage {
    time_ms: u64,
    tag: u32,
    severity: u32,
    thread_id: u32,
    len: u32,
    buf: [u8; LOG_MAX_MESSAGE_SIZE],
    /// 1 once the message is fully formatted and ready for the drain.
    completed: AtomicU32,
}

struct Log {
    messages: *mut LogMessage,
    tickets: TicketFactory,
    draining: AtomicU32,
    file: Mutex<Option<File>>,
    echo_stdout: bool,
}

// SAFETY: message slots are owned exclusively by one producer between
// ticket acquisition and the completion store, then exclusively by the
// single CAS-elected drainer until the ticket is returned.
unsafe impl Send for Log {}
unsafe impl Sync for Log {}

static LOG: Once<Log> = Once::new();

/// Truncating writer over a message's inline buffer.
struct MessageWriter<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl fmt::Write for MessageWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = self.buf.len() - self.len;
        let take = s.len().min(room);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

fn format_line(
    buf: &mut [u8],
    time_ms: u64,
    tag: SystemTag,
    severity: Severity,
    thread_id: u32,
    args: fmt::Arguments<'_>,
) -> usize {
    let mut writer = MessageWriter { buf, len: 0 };
    let _ = fmt::Write::write_fmt(
        &mut writer,
        format_args!(
            "[{}.{:03}s] {} {} - Thread {}: {}\n",
            time_ms / 1000,
            time_ms % 1000,
            tag.as_str(),
            severity.as_str(),
            thread_id,
            args
        ),
    );
    writer.len
}

/// Initialise the log: message ring on `mem`, optional append target at
/// `filepath`. Registers the facade backend and the fatal flush hook.
/// Subsequent calls are no-ops.
pub fn log_init(mem: &mut Arena, filepath: Option<&Path>) {
    LOG.call_once(|| {
        let messages = mem.push_array::<LogMessage>(LOG_MAX_MESSAGES as u64);
        assert!(!messages.is_null(), "arena cannot hold the log message ring");

        for i in 0..LOG_MAX_MESSAGES {
            unsafe {
                (*messages.add(i as usize))
                    .completed
                    .store(0, Ordering::Relaxed);
            }
        }

        let file = filepath.and_then(|path| match File::create(path) {
            Ok(file) => Some(file),
            Err(err) => {
                eprintln!("failed to create log file {}: {err}", path.display());
                None
            }
        });

        Log {
            messages,
            tickets: TicketFactory::new(LOG_MAX_MESSAGES),
            draining: AtomicU32::new(0),
            file: Mutex::new(file),
            echo_stdout: true,
        }
    });

    grit_lib::log_register_backend(backend);
    grit_lib::register_flush_hook(flush_for_fatal);
}

fn backend(tag: SystemTag, severity: Severity, args: fmt::Arguments<'_>) {
    write_message(tag, severity, args);
}

fn flush_for_fatal() {
    log_shutdown();
}

/// Append one message to the ring, helping the drainer while the ring
/// is full. Messages written after shutdown are dropped.
pub fn write_message(tag: SystemTag, severity: Severity, args: fmt::Arguments<'_>) {
    let Some(log) = LOG.get() else {
        // Not initialised: behave like the facade's early path.
        eprintln!("{} {} - {}", tag.as_str(), severity.as_str(), args);
        return;
    };

    let ticket = loop {
        match log.tickets.try_get() {
            TryTicket::Ticket(ticket) => break ticket,
            TryTicket::Closed => return,
            TryTicket::WouldBlock => try_drain(log),
        }
    };

    let message = unsafe { &mut *log.messages.add((ticket % LOG_MAX_MESSAGES) as usize) };

    message.time_ms = grit_time::time_ms();
    message.tag = tag as u32;
    message.severity = severity as u32;
    message.thread_id = self_tid();
    let time_ms = message.time_ms;
    let thread_id = message.thread_id;
    message.len = format_line(&mut message.buf, time_ms, tag, severity, thread_id, args) as u32;

    if log.echo_stdout {
        let line = &message.buf[..message.len as usize];
        if message.severity >= Severity::Error as u32 {
            let mut stderr = std::io::stderr().lock();
            let _ = stderr.write_all(line);
        } else {
            let mut stdout = std::io::stdout().lock();
            let _ = stdout.write_all(line);
        }
    }

    // Sync point: the message is ready for the drain.
    message.completed.store(1, Ordering::Release);
}

/// Drain completed messages to the file if no other thread already is.
fn try_drain(log: &Log) {
    if log
        .draining
        .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        return;
    }

    let mut count = 0u32;
    // Single drainer: served() synchronises with the previous drain.
    let mut serving = log.tickets.served() % LOG_MAX_MESSAGES;

    let mut file = log.file.lock();
    loop {
        let message = unsafe { &mut *log.messages.add(serving as usize) };
        if message
            .completed
            .compare_exchange(1, 0, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            break;
        }

        // Drain-side sanity on the published record.
        debug_assert!(message.tag <= SystemTag::Utility as u32);

        if message.len > 0 {
            if let Some(file) = file.as_mut() {
                let _ = file.write_all(&message.buf[..message.len as usize]);
            }
        }
        serving = (serving + 1) % LOG_MAX_MESSAGES;
        count += 1;
    }
    drop(file);

    log.tickets.return_tickets(count);
    log.draining.store(0, Ordering::Release);
}

/// Close the factory, drain everything, sync and close the file.
pub fn log_shutdown() {
    let Some(log) = LOG.get() else {
        return;
    };

    write_message(
        SystemTag::System,
        Severity::Note,
        format_args!("Log system initiated shutdown"),
    );

    log.tickets.close();
    while log.tickets.served() != log.tickets.issued() {
        try_drain(log);
    }

    let mut file = log.file.lock();
    if let Some(file) = file.take() {
        let _ = file.sync_all();
    }
}
