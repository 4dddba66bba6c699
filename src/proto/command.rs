//! The command grammar: packet text in, one closed sum type out.
//!
//! Every packet body parses to a [`GdbCommand`]; the dispatcher matches it
//! exhaustively. Anything the grammar does not recognize lands in
//! [`GdbCommand::Unknown`] (the protocol's empty-reply case), while a
//! recognized verb with unusable arguments lands in [`GdbCommand::Malformed`]
//! (an error reply).

use super::scan::TextScanner;

/// A thread selector as written on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadId {
    /// `-1`: every thread.
    All,
    /// `0`: any thread; resolves to the first live one.
    Any,
    Id(u64),
}

impl ThreadId {
    pub fn parse(text: &str) -> Option<ThreadId> {
        match text {
            "-1" => Some(ThreadId::All),
            "0" => Some(ThreadId::Any),
            _ => u64::from_str_radix(text, 16).ok().map(ThreadId::Id),
        }
    }
}

/// A thread's resolved vCont action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingAction {
    None,
    Continue,
    Step,
    Stop,
}

/// One `;`-separated vCont token: `<verb>[<signal>][:<thread>]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VContRequest {
    pub action: PendingAction,
    pub signal: Option<u8>,
    pub thread: Option<ThreadId>,
}

/// `q` sub-protocol commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    ServerVersion,
    HostInfo,
    ProcessInfo,
    Supported,
    Rcmd { hex: String },
    ThreadInfoFirst,
    ThreadInfoNext,
    ThreadExtraInfo { thread: Option<ThreadId> },
    XferThreads { offset: u64, length: u64 },
    XferFeatures { annex: String, offset: u64, length: u64 },
    Unknown,
}

/// Breakpoint/watchpoint kinds of the `Z`/`z` packets. Only software
/// breakpoints are ever honored; the rest parse and then fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointKind {
    Software,
    Hardware,
    WriteWatchpoint,
    ReadWatchpoint,
    AccessWatchpoint,
}

impl BreakpointKind {
    fn parse(text: &str) -> Option<BreakpointKind> {
        match text {
            "0" => Some(BreakpointKind::Software),
            "1" => Some(BreakpointKind::Hardware),
            "2" => Some(BreakpointKind::WriteWatchpoint),
            "3" => Some(BreakpointKind::ReadWatchpoint),
            "4" => Some(BreakpointKind::AccessWatchpoint),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GdbCommand {
    ExtendedMode,
    InitialContact,
    Continue { new_pc: Option<u64> },
    Detach,
    ReadGeneralRegisters,
    WriteGeneralRegisters { data: String },
    SetThread { op: char, thread: ThreadId },
    Kill,
    ReadMemory { address: u64, length: u64 },
    WriteMemory { address: u64, length: u64, data: String },
    ReadRegister { index: u64 },
    WriteRegister { index: u64, value: String },
    Query(Query),
    Step { new_pc: Option<u64> },
    IsThreadAlive { thread: Option<ThreadId> },
    VContQuery,
    VCont { actions: Vec<VContRequest> },
    MustReplyEmpty,
    InsertBreakpoint { kind: BreakpointKind, address: u64, length: u64 },
    RemoveBreakpoint { kind: BreakpointKind, address: u64, length: u64 },
    Unknown,
    Malformed,
}

pub fn parse_command(text: &str) -> GdbCommand {
    let mut ss = TextScanner::new(text);

    let Some(verb) = ss.read_char() else {
        return GdbCommand::Unknown;
    };

    match verb {
        '!' if ss.is_empty() => GdbCommand::ExtendedMode,
        '?' if ss.is_empty() => GdbCommand::InitialContact,
        'c' => match parse_optional_pc(&mut ss) {
            Some(new_pc) => GdbCommand::Continue { new_pc },
            None => GdbCommand::Malformed,
        },
        'D' if ss.is_empty() => GdbCommand::Detach,
        'g' if ss.is_empty() => GdbCommand::ReadGeneralRegisters,
        'G' => GdbCommand::WriteGeneralRegisters {
            data: ss.read_remaining().to_string(),
        },
        'H' => parse_set_thread(&mut ss),
        'k' => GdbCommand::Kill,
        'm' => {
            let address = ss.read_until_as_hex(',');
            let length = ss.read_remaining_as_hex();
            match (address, length) {
                (Ok(address), Ok(length)) => GdbCommand::ReadMemory { address, length },
                _ => GdbCommand::Malformed,
            }
        }
        'M' => {
            let address = ss.read_until_as_hex(',');
            let length = ss.read_until_as_hex(':');
            match (address, length) {
                (Ok(address), Ok(length)) => GdbCommand::WriteMemory {
                    address,
                    length,
                    data: ss.read_remaining().to_string(),
                },
                _ => GdbCommand::Malformed,
            }
        }
        'p' => match ss.read_remaining_as_hex() {
            Ok(index) => GdbCommand::ReadRegister { index },
            Err(_) => GdbCommand::Malformed,
        },
        'P' => match ss.read_until_as_hex('=') {
            Ok(index) => GdbCommand::WriteRegister {
                index,
                value: ss.read_remaining().to_string(),
            },
            Err(_) => GdbCommand::Malformed,
        },
        'q' => parse_query(&mut ss),
        's' => match parse_optional_pc(&mut ss) {
            Some(new_pc) => GdbCommand::Step { new_pc },
            None => GdbCommand::Malformed,
        },
        'T' => GdbCommand::IsThreadAlive {
            thread: ThreadId::parse(ss.read_remaining()),
        },
        'v' => parse_v_packet(&mut ss),
        'Z' => match parse_breakpoint_args(&mut ss) {
            Some((kind, address, length)) => GdbCommand::InsertBreakpoint { kind, address, length },
            None => GdbCommand::Malformed,
        },
        'z' => match parse_breakpoint_args(&mut ss) {
            Some((kind, address, length)) => GdbCommand::RemoveBreakpoint { kind, address, length },
            None => GdbCommand::Malformed,
        },
        _ => GdbCommand::Unknown,
    }
}

fn parse_optional_pc(ss: &mut TextScanner) -> Option<Option<u64>> {
    if ss.is_empty() {
        Some(None)
    } else {
        ss.read_remaining_as_hex().ok().map(Some)
    }
}

fn parse_set_thread(ss: &mut TextScanner) -> GdbCommand {
    let Some(op) = ss.read_char() else {
        return GdbCommand::Malformed;
    };

    // An absent id picks the first live thread, same as `0`.
    let thread = if ss.is_empty() {
        ThreadId::Any
    } else {
        match ThreadId::parse(ss.read_remaining()) {
            Some(thread) => thread,
            None => return GdbCommand::Malformed,
        }
    };

    GdbCommand::SetThread { op, thread }
}

fn parse_query(ss: &mut TextScanner) -> GdbCommand {
    if ss.consume_remaining("GDBServerVersion") {
        return GdbCommand::Query(Query::ServerVersion);
    }
    if ss.consume_remaining("HostInfo") {
        return GdbCommand::Query(Query::HostInfo);
    }
    if ss.consume_remaining("ProcessInfo") {
        return GdbCommand::Query(Query::ProcessInfo);
    }
    if ss.consume_prefix("Supported:") || ss.consume_remaining("Supported") {
        return GdbCommand::Query(Query::Supported);
    }
    if ss.consume_prefix("Rcmd,") {
        return GdbCommand::Query(Query::Rcmd {
            hex: ss.read_remaining().to_string(),
        });
    }
    if ss.consume_remaining("fThreadInfo") {
        return GdbCommand::Query(Query::ThreadInfoFirst);
    }
    if ss.consume_remaining("sThreadInfo") {
        return GdbCommand::Query(Query::ThreadInfoNext);
    }
    if ss.consume_prefix("ThreadExtraInfo,") {
        return GdbCommand::Query(Query::ThreadExtraInfo {
            thread: ThreadId::parse(ss.read_remaining()),
        });
    }
    if ss.consume_prefix("Xfer:threads:read:") {
        ss.read_until(':');
        let offset = ss.read_until_as_hex(',');
        let length = ss.read_remaining_as_hex();
        return match (offset, length) {
            (Ok(offset), Ok(length)) => GdbCommand::Query(Query::XferThreads { offset, length }),
            _ => GdbCommand::Malformed,
        };
    }
    if ss.consume_prefix("Xfer:features:read:") {
        let annex = ss.read_until(':').to_string();
        let offset = ss.read_until_as_hex(',');
        let length = ss.read_remaining_as_hex();
        return match (offset, length) {
            (Ok(offset), Ok(length)) => {
                GdbCommand::Query(Query::XferFeatures { annex, offset, length })
            }
            _ => GdbCommand::Malformed,
        };
    }

    GdbCommand::Query(Query::Unknown)
}

fn parse_v_packet(ss: &mut TextScanner) -> GdbCommand {
    if ss.consume_prefix("Cont") {
        if ss.consume_remaining("?") {
            return GdbCommand::VContQuery;
        }
        if ss.consume_prefix(";") {
            return match parse_vcont_actions(ss.read_remaining()) {
                Some(actions) => GdbCommand::VCont { actions },
                None => GdbCommand::Malformed,
            };
        }
        return GdbCommand::Unknown;
    }
    if ss.consume_remaining("MustReplyEmpty") {
        return GdbCommand::MustReplyEmpty;
    }
    GdbCommand::Unknown
}

fn parse_vcont_actions(text: &str) -> Option<Vec<VContRequest>> {
    let mut actions = Vec::new();

    for token in text.split(';').filter(|t| !t.is_empty()) {
        let mut ss = TextScanner::new(token);
        let verb = ss.read_char()?;

        let action = match verb {
            'c' | 'C' => PendingAction::Continue,
            's' | 'S' => PendingAction::Step,
            't' => PendingAction::Stop,
            _ => PendingAction::None,
        };

        // Signals are accepted but never delivered.
        let signal = if verb == 'C' || verb == 'S' {
            Some(ss.read_length_as_hex(2).ok()? as u8)
        } else {
            None
        };

        let thread = if ss.consume_prefix(":") {
            Some(ThreadId::parse(ss.read_remaining())?)
        } else if ss.is_empty() {
            None
        } else {
            return None;
        };

        actions.push(VContRequest { action, signal, thread });
    }

    Some(actions)
}

fn parse_breakpoint_args(ss: &mut TextScanner) -> Option<(BreakpointKind, u64, u64)> {
    let kind = BreakpointKind::parse(ss.read_until(','))?;
    let address = ss.read_until_as_hex(',').ok()?;
    let length = ss.read_length_as_hex(1).ok()?;

    // Conditional breakpoint payloads are not supported.
    if !ss.is_empty() {
        return None;
    }
    Some((kind, address, length))
}
