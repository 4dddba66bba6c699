//! Monitor (`qRcmd`) diagnostic commands.
//!
//! A name-keyed table of free-text commands tunneled through the protocol's
//! generic command extension. The registry is built once at startup and
//! handed to the dispatcher; handlers produce plain text, and an unknown
//! name produces an "Unknown command" text rather than a protocol error.

use std::fmt::Write;
use std::sync::Arc;

use tracing::info;

use crate::guest::{DebugProcess, ProcessMetadata};

/// Session state visible to monitor handlers.
pub struct MonitorContext {
    pub process: Option<Arc<dyn DebugProcess>>,
    pub metadata: Option<Arc<dyn ProcessMetadata>>,
    pub general_thread: Option<u64>,
}

type Handler = Box<dyn Fn(&MonitorContext) -> String + Send + Sync>;

struct MonitorCommand {
    names: Vec<&'static str>,
    handler: Handler,
}

pub struct MonitorRegistry {
    commands: Vec<MonitorCommand>,
}

impl MonitorRegistry {
    /// The built-in command set: `help`, `get info`, `backtrace`/`bt`,
    /// `registers`/`reg`, `minidump`.
    pub fn with_builtin_commands() -> Self {
        let mut commands = vec![
            MonitorCommand {
                names: vec!["get info"],
                handler: Box::new(|ctx| process_info(ctx)),
            },
            MonitorCommand {
                names: vec!["backtrace", "bt"],
                handler: Box::new(|ctx| stack_trace(ctx)),
            },
            MonitorCommand {
                names: vec!["registers", "reg"],
                handler: Box::new(|ctx| register_dump(ctx)),
            },
            MonitorCommand {
                names: vec!["minidump"],
                handler: Box::new(|ctx| minidump(ctx)),
            },
        ];

        let mut help = String::new();
        for command in &commands {
            for name in &command.names {
                help.push_str(name);
                help.push('\n');
            }
        }
        commands.insert(
            0,
            MonitorCommand {
                names: vec!["help"],
                handler: Box::new(move |_| help.clone()),
            },
        );

        Self { commands }
    }

    /// Runs the named command. Matching is case-insensitive on the trimmed
    /// name; an unknown name yields a generated text, never a failure.
    pub fn dispatch(&self, command: &str, ctx: &MonitorContext) -> String {
        let wanted = command.trim().to_lowercase();

        for entry in &self.commands {
            if entry.names.iter().any(|n| *n == wanted) {
                return (entry.handler)(ctx);
            }
        }

        format!("Unknown command: {}\n", command.trim())
    }
}

fn process_info(ctx: &MonitorContext) -> String {
    let Some(metadata) = ctx.metadata.as_ref() else {
        return "No application process found\n".to_string();
    };

    let layout = metadata.memory_layout();
    let mut out = String::new();
    let _ = writeln!(out, "Program Id:  0x{:016x}", metadata.program_id());
    let _ = writeln!(out, "Application: {}", if metadata.is_application() { 1 } else { 0 });
    out.push_str("Layout:\n");
    let _ = writeln!(out, "  Alias: 0x{:010x} - 0x{:010x}", layout.alias.start, layout.alias.end - 1);
    let _ = writeln!(out, "  Heap:  0x{:010x} - 0x{:010x}", layout.heap.start, layout.heap.end - 1);
    let _ = writeln!(out, "  Aslr:  0x{:010x} - 0x{:010x}", layout.aslr.start, layout.aslr.end - 1);
    let _ = writeln!(out, "  Stack: 0x{:010x} - 0x{:010x}", layout.stack.start, layout.stack.end - 1);
    out.push_str("Modules:\n");
    for module in metadata.loaded_modules() {
        let end = module.base_address + module.size - 1;
        let _ = writeln!(out, "  0x{:010x} - 0x{:010x} {}", module.base_address, end, module.name);
    }

    out
}

fn stack_trace(ctx: &MonitorContext) -> String {
    let Some(thread) = ctx.general_thread else {
        return "No thread selected\n".to_string();
    };
    let Some(metadata) = ctx.metadata.as_ref() else {
        return "No application process found\n".to_string();
    };

    match metadata.guest_stack_trace(thread) {
        Ok(trace) => trace,
        Err(e) => format!("[Error getting stack trace: {e}]\n"),
    }
}

fn register_dump(ctx: &MonitorContext) -> String {
    let Some(thread) = ctx.general_thread else {
        return "No thread selected\n".to_string();
    };
    let Some(metadata) = ctx.metadata.as_ref() else {
        return "No application process found\n".to_string();
    };

    match metadata.register_printout(thread) {
        Ok(dump) => dump,
        Err(e) => format!("[Error getting registers: {e}]\n"),
    }
}

fn minidump(ctx: &MonitorContext) -> String {
    let mut out = String::new();
    out.push_str("=== Begin Minidump ===\n\n");
    out.push_str(&process_info(ctx));

    if let (Some(process), Some(metadata)) = (ctx.process.as_ref(), ctx.metadata.as_ref()) {
        for thread in process.thread_uids() {
            let _ = writeln!(out, "=== Thread {thread} ===");

            // One bad thread must not void the whole report.
            match metadata.guest_stack_trace(thread) {
                Ok(trace) => out.push_str(&trace),
                Err(e) => {
                    let _ = writeln!(out, "[Error getting stack trace: {e}]");
                }
            }
            match metadata.register_printout(thread) {
                Ok(dump) => out.push_str(&dump),
                Err(e) => {
                    let _ = writeln!(out, "[Error getting registers: {e}]");
                }
            }
        }
    }

    out.push_str("=== End Minidump ===\n");
    info!("{out}");
    out
}
