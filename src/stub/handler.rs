//! The command dispatcher.
//!
//! A single-threaded consumer over the message queue: each message is
//! handled to completion before the next is dequeued, which is what makes
//! the shared session state (thread selectors, thread-list cache) safe to
//! keep as plain fields. Errors crossing the loop boundary are logged and
//! the loop keeps running; the affected message simply gets no reply.

use std::fmt::Write as _;
use std::io::Write as _;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use tracing::{debug, error, info, warn};

use crate::arch::{features, registers};
use crate::error::ProtocolError;
use crate::guest::{DebugProcess, DebugTarget, ExecutionContext};
use crate::proto::command::{
    parse_command, BreakpointKind, GdbCommand, PendingAction, Query, ThreadId, VContRequest,
};
use crate::proto::scan::TextScanner;
use crate::proto::wire;
use crate::stub::breakpoints::BreakpointTable;
use crate::stub::message::{Message, ThreadBreak};
use crate::stub::monitor::{MonitorContext, MonitorRegistry};
use crate::stub::server::{ResetEvent, SharedStream};
use crate::stub::vcont;

const SIGINT: u8 = 2;
const SIGTRAP: u8 = 5;

/// Advertised maximum packet size, and the bound on one memory transfer.
pub(crate) const MAX_PACKET_SIZE: usize = 0x10000;

const SERVER_NAME: &str = "gdb-stub-server";

pub(crate) struct MessageHandler {
    target: Arc<dyn DebugTarget>,
    messages: Receiver<Message>,
    stream: SharedStream,
    breakpoints: Arc<Mutex<BreakpointTable>>,
    monitor: MonitorRegistry,
    break_ack: Arc<ResetEvent>,
    current_thread: Option<u64>,
    general_thread: Option<u64>,
    thread_list_xml: String,
}

impl MessageHandler {
    pub(crate) fn new(
        target: Arc<dyn DebugTarget>,
        messages: Receiver<Message>,
        stream: SharedStream,
        breakpoints: Arc<Mutex<BreakpointTable>>,
        monitor: MonitorRegistry,
        break_ack: Arc<ResetEvent>,
    ) -> Self {
        Self {
            target,
            messages,
            stream,
            breakpoints,
            monitor,
            break_ack,
            current_thread: None,
            general_thread: None,
            thread_list_xml: String::new(),
        }
    }

    pub(crate) fn run(mut self) {
        loop {
            let message = match self.messages.recv() {
                Ok(message) => message,
                Err(_) => return,
            };

            if matches!(message, Message::Kill) {
                return;
            }

            if let Err(e) = self.handle(message) {
                error!("error while processing debugger message: {e:#}");
            }
        }
    }

    fn handle(&mut self, message: Message) -> anyhow::Result<()> {
        match message {
            Message::BreakIn => {
                info!("break-in requested");
                self.command_interrupt()
            }
            Message::SendNack => self.write_raw(b"-"),
            Message::Command(cmd) => {
                debug!("received command: {cmd}");
                self.write_raw(b"+")?;
                self.execute(&cmd)
            }
            Message::ThreadBreak(b) => self.thread_break(b),
            Message::Kill => Ok(()),
        }
    }

    fn thread_break(&mut self, b: ThreadBreak) -> anyhow::Result<()> {
        let Some(process) = self.target.debug_process() else {
            self.break_ack.set();
            return Err(anyhow!("thread break without a debuggable process"));
        };

        process.debug_stop();
        let uid = b.context.thread_uid();
        self.general_thread = Some(uid);
        self.current_thread = Some(uid);
        self.break_ack.set();
        self.reply(&stop_reply(SIGTRAP, uid))
    }

    fn execute(&mut self, cmd: &str) -> anyhow::Result<()> {
        match parse_command(cmd) {
            GdbCommand::ExtendedMode => self.reply("OK"),
            GdbCommand::InitialContact => {
                let result = self.do_initial_contact();
                self.respond(result)
            }
            GdbCommand::Continue { new_pc } => self.command_continue(new_pc),
            GdbCommand::Detach => self.command_detach(),
            GdbCommand::ReadGeneralRegisters => {
                let result = self.do_read_all_registers();
                self.respond(result)
            }
            GdbCommand::WriteGeneralRegisters { data } => {
                let result = self.do_write_all_registers(&data);
                self.respond(result)
            }
            GdbCommand::SetThread { op, thread } => {
                let result = self.do_set_thread(op, thread);
                self.respond(result)
            }
            GdbCommand::Kill => {
                info!("kill request received, detaching instead");
                self.reply("")?;
                self.command_detach()
            }
            GdbCommand::ReadMemory { address, length } => {
                let result = self.do_read_memory(address, length);
                self.respond(result)
            }
            GdbCommand::WriteMemory { address, length, data } => {
                let result = self.do_write_memory(address, length, &data);
                self.respond(result)
            }
            GdbCommand::ReadRegister { index } => {
                let result = self.do_read_register(index);
                self.respond(result)
            }
            GdbCommand::WriteRegister { index, value } => {
                let result = self.do_write_register(index, &value);
                self.respond(result)
            }
            GdbCommand::Query(query) => self.execute_query(query),
            GdbCommand::Step { new_pc } => {
                let result = self.do_step(new_pc);
                self.respond(result)
            }
            GdbCommand::IsThreadAlive { thread } => {
                let result = self.do_is_thread_alive(thread);
                self.respond(result)
            }
            GdbCommand::VContQuery => self.reply("vCont;c;C;s;S"),
            GdbCommand::VCont { actions } => self.command_vcont(&actions),
            GdbCommand::MustReplyEmpty => self.reply(""),
            GdbCommand::InsertBreakpoint { kind, address, length } => {
                let result = self.do_insert_breakpoint(kind, address, length);
                self.respond(result)
            }
            GdbCommand::RemoveBreakpoint { kind, address, length } => {
                let result = self.do_remove_breakpoint(kind, address, length);
                self.respond(result)
            }
            GdbCommand::Unknown => {
                info!("unknown command: {cmd}");
                self.reply("")
            }
            GdbCommand::Malformed => {
                warn!("malformed command: {cmd}");
                self.reply("E01")
            }
        }
    }

    fn execute_query(&mut self, query: Query) -> anyhow::Result<()> {
        match query {
            Query::ServerVersion => {
                self.reply(&format!("name:{SERVER_NAME};version:{};", env!("CARGO_PKG_VERSION")))
            }
            Query::HostInfo => {
                let result = self.do_host_info();
                self.respond(result)
            }
            Query::ProcessInfo => {
                let result = self.do_process_info();
                self.respond(result)
            }
            Query::Supported => self.reply(&format!(
                "PacketSize={MAX_PACKET_SIZE:x};qXfer:features:read+;qXfer:threads:read+;vContSupported+"
            )),
            Query::Rcmd { hex } => {
                let result = self.do_rcmd(&hex);
                self.respond(result)
            }
            Query::ThreadInfoFirst => {
                let result = self.do_thread_info_first();
                self.respond(result)
            }
            Query::ThreadInfoNext => self.reply("l"),
            Query::ThreadExtraInfo { thread } => {
                let result = self.do_thread_extra_info(thread);
                self.respond(result)
            }
            Query::XferThreads { offset, length } => {
                let result = self.do_xfer_threads(offset, length);
                self.respond(result)
            }
            Query::XferFeatures { annex, offset, length } => {
                let result = self.do_xfer_features(&annex, offset, length);
                self.respond(result)
            }
            Query::Unknown => self.reply(""),
        }
    }

    // --- reply plumbing ---

    fn write_raw(&self, bytes: &[u8]) -> anyhow::Result<()> {
        let mut guard = self.stream.lock().unwrap();
        let stream = guard.as_mut().ok_or_else(|| anyhow!("no client connection"))?;
        stream.write_all(bytes)?;
        Ok(())
    }

    fn reply(&self, body: &str) -> anyhow::Result<()> {
        debug!("reply: {body}");
        self.write_raw(&wire::frame_reply(body))
    }

    /// Sends the produced body, or the protocol's error reply.
    fn respond(&mut self, result: Result<String, ProtocolError>) -> anyhow::Result<()> {
        match result {
            Ok(body) => self.reply(&body),
            Err(e) => {
                warn!("command failed: {e}");
                self.reply("E01")
            }
        }
    }

    // --- session state helpers ---

    fn process(&self) -> Result<Arc<dyn DebugProcess>, ProtocolError> {
        self.target.debug_process().ok_or(ProtocolError::NoProcess)
    }

    fn first_thread(&self, process: &dyn DebugProcess) -> Result<u64, ProtocolError> {
        process
            .thread_uids()
            .first()
            .copied()
            .ok_or(ProtocolError::NoLiveThreads)
    }

    fn general_context(&self) -> Result<Arc<dyn ExecutionContext>, ProtocolError> {
        let process = self.process()?;
        let uid = self.general_thread.ok_or(ProtocolError::NoThreadSelected)?;
        process.context(uid).ok_or(ProtocolError::ThreadNotFound(uid))
    }

    fn is_process_aarch32(&self) -> Result<bool, ProtocolError> {
        Ok(self.general_context()?.is_aarch32())
    }

    fn monitor_context(&self) -> MonitorContext {
        MonitorContext {
            process: self.target.debug_process(),
            metadata: self.target.process_metadata(),
            general_thread: self.general_thread,
        }
    }

    fn select_thread(&mut self, uid: u64) {
        self.general_thread = Some(uid);
        self.current_thread = Some(uid);
    }

    // --- command execution ---

    fn do_initial_contact(&mut self) -> Result<String, ProtocolError> {
        // Initial contact: stop everything and report the first thread.
        let process = self.process()?;
        process.debug_stop();
        let first = self.first_thread(process.as_ref())?;
        self.select_thread(first);
        Ok(stop_reply(SIGTRAP, first))
    }

    fn command_interrupt(&mut self) -> anyhow::Result<()> {
        let result = self.do_interrupt();
        self.respond(result)
    }

    fn do_interrupt(&mut self) -> Result<String, ProtocolError> {
        let process = self.process()?;
        process.debug_stop();

        let live = process.thread_uids();
        let uid = match self.general_thread {
            Some(uid) if live.contains(&uid) => uid,
            _ => {
                let first = *live.first().ok_or(ProtocolError::NoLiveThreads)?;
                self.select_thread(first);
                first
            }
        };

        Ok(stop_reply(SIGINT, uid))
    }

    fn command_continue(&mut self, new_pc: Option<u64>) -> anyhow::Result<()> {
        match self.do_continue(new_pc) {
            // The stop reply arrives later, as a ThreadBreak.
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("continue failed: {e}");
                self.reply("E01")
            }
        }
    }

    fn do_continue(&mut self, new_pc: Option<u64>) -> Result<(), ProtocolError> {
        let process = self.process()?;

        if let Some(pc) = new_pc {
            let uid = self.current_thread.ok_or(ProtocolError::NoThreadSelected)?;
            let context = process.context(uid).ok_or(ProtocolError::ThreadNotFound(uid))?;
            context.set_pc(pc);
        }

        process.debug_continue();
        Ok(())
    }

    fn command_detach(&mut self) -> anyhow::Result<()> {
        info!("detaching from guest");
        let result = self.do_detach().map(|()| "OK".to_string());
        self.respond(result)
    }

    fn do_detach(&mut self) -> Result<(), ProtocolError> {
        let process = self.process()?;
        self.breakpoints.lock().unwrap().clear_all(process.as_ref());
        process.debug_continue();
        Ok(())
    }

    fn do_read_all_registers(&self) -> Result<String, ProtocolError> {
        let context = self.general_context()?;
        let mut blob = String::new();
        for index in 0..registers::register_count(context.as_ref()) {
            let field = registers::read_register(context.as_ref(), index)
                .ok_or(ProtocolError::UnsupportedRegister(index))?;
            blob.push_str(&field);
        }
        Ok(blob)
    }

    fn do_write_all_registers(&self, data: &str) -> Result<String, ProtocolError> {
        let context = self.general_context()?;
        let mut ss = TextScanner::new(data);
        for index in 0..registers::register_count(context.as_ref()) {
            if !registers::write_register(context.as_ref(), index, &mut ss) {
                return Err(ProtocolError::Malformed);
            }
        }
        if ss.is_empty() {
            Ok("OK".to_string())
        } else {
            Err(ProtocolError::Malformed)
        }
    }

    fn do_set_thread(&mut self, op: char, thread: ThreadId) -> Result<String, ProtocolError> {
        let process = self.process()?;
        let uid = match thread {
            ThreadId::Id(uid) => uid,
            ThreadId::Any | ThreadId::All => self.first_thread(process.as_ref())?,
        };

        if process.context(uid).is_none() {
            return Err(ProtocolError::ThreadNotFound(uid));
        }

        match op {
            'c' => self.current_thread = Some(uid),
            'g' => self.general_thread = Some(uid),
            _ => return Err(ProtocolError::Malformed),
        }
        Ok("OK".to_string())
    }

    fn do_read_memory(&self, address: u64, length: u64) -> Result<String, ProtocolError> {
        let process = self.process()?;
        let length = usize::try_from(length).map_err(|_| ProtocolError::Malformed)?;
        if length > MAX_PACKET_SIZE {
            return Err(ProtocolError::Malformed);
        }

        let mut data = vec![0u8; length];
        process.read_memory(address, &mut data)?;
        Ok(wire::to_hex(&data))
    }

    fn do_write_memory(&self, address: u64, length: u64, data: &str) -> Result<String, ProtocolError> {
        let process = self.process()?;
        let bytes = wire::from_hex(data)?;
        if bytes.len() as u64 != length {
            return Err(ProtocolError::Malformed);
        }

        process.write_memory(address, &bytes)?;
        process.invalidate_cache_region(address, length);
        Ok("OK".to_string())
    }

    fn do_read_register(&self, index: u64) -> Result<String, ProtocolError> {
        let context = self.general_context()?;
        registers::read_register(context.as_ref(), index)
            .ok_or(ProtocolError::UnsupportedRegister(index))
    }

    fn do_write_register(&self, index: u64, value: &str) -> Result<String, ProtocolError> {
        let context = self.general_context()?;
        let mut ss = TextScanner::new(value);

        if !registers::write_register(context.as_ref(), index, &mut ss) {
            return Err(if index >= registers::register_count(context.as_ref()) {
                ProtocolError::UnsupportedRegister(index)
            } else {
                ProtocolError::Malformed
            });
        }
        if !ss.is_empty() {
            return Err(ProtocolError::Malformed);
        }
        Ok("OK".to_string())
    }

    fn do_step(&mut self, new_pc: Option<u64>) -> Result<String, ProtocolError> {
        let process = self.process()?;
        let uid = self.current_thread.ok_or(ProtocolError::NoThreadSelected)?;
        let context = process.context(uid).ok_or(ProtocolError::ThreadNotFound(uid))?;

        if let Some(pc) = new_pc {
            context.set_pc(pc);
        }

        if !process.debug_step(uid) {
            return Err(ProtocolError::StepFailed);
        }

        self.select_thread(uid);
        Ok(stop_reply(SIGTRAP, uid))
    }

    fn do_is_thread_alive(&self, thread: Option<ThreadId>) -> Result<String, ProtocolError> {
        let process = self.process()?;
        let alive = match thread {
            Some(ThreadId::Id(uid)) => process.thread_uids().contains(&uid),
            _ => false,
        };
        Ok(if alive { "OK" } else { "E00" }.to_string())
    }

    fn command_vcont(&mut self, actions: &[VContRequest]) -> anyhow::Result<()> {
        let process = match self.process() {
            Ok(process) => process,
            Err(e) => {
                warn!("vCont failed: {e}");
                return self.reply("E01");
            }
        };

        let live = process.thread_uids();
        let resolved = vcont::resolve(&live, actions);

        // Steps run first; a failure fails the request but every step is
        // still attempted.
        let stepped = resolved.threads_with(PendingAction::Step);
        let mut step_failed = false;
        for &uid in &stepped {
            if !process.debug_step(uid) {
                warn!("vCont step failed on thread {uid:#x}");
                step_failed = true;
            }
        }

        // "vCont;c" resumes the whole process in one call. A mixed request
        // without a wildcard continue resumes exactly the threads asking for
        // it; with a wildcard, stepping already left the rest as the engine
        // wants them.
        if resolved.all_continue() {
            process.debug_continue();
        } else if !resolved.default_continue {
            for uid in resolved.threads_with(PendingAction::Continue) {
                process.debug_continue_thread(uid);
            }
        }

        self.reply(if step_failed { "E01" } else { "OK" })?;

        for uid in stepped {
            self.select_thread(uid);
            self.reply(&stop_reply(SIGTRAP, uid))?;
        }
        Ok(())
    }

    fn do_insert_breakpoint(
        &mut self,
        kind: BreakpointKind,
        address: u64,
        length: u64,
    ) -> Result<String, ProtocolError> {
        if kind != BreakpointKind::Software {
            return Err(ProtocolError::UnsupportedBreakpoint);
        }

        let process = self.process()?;
        if self.breakpoints.lock().unwrap().set(process.as_ref(), address, length) {
            Ok("OK".to_string())
        } else {
            Err(ProtocolError::InvalidMemoryRegion(address))
        }
    }

    fn do_remove_breakpoint(
        &mut self,
        kind: BreakpointKind,
        address: u64,
        length: u64,
    ) -> Result<String, ProtocolError> {
        if kind != BreakpointKind::Software {
            return Err(ProtocolError::UnsupportedBreakpoint);
        }

        let process = self.process()?;
        if self.breakpoints.lock().unwrap().clear(process.as_ref(), address, length) {
            Ok("OK".to_string())
        } else {
            Err(ProtocolError::BreakpointNotSet(address))
        }
    }

    // --- queries ---

    fn do_host_info(&self) -> Result<String, ProtocolError> {
        Ok(if self.is_process_aarch32()? {
            format!(
                "triple:{};endian:little;ptrsize:4;hostname:{};",
                wire::str_to_hex("arm-unknown-linux-gnu"),
                wire::str_to_hex(SERVER_NAME)
            )
        } else {
            format!(
                "triple:{};endian:little;ptrsize:8;hostname:{};",
                wire::str_to_hex("aarch64-unknown-linux-gnu"),
                wire::str_to_hex(SERVER_NAME)
            )
        })
    }

    fn do_process_info(&self) -> Result<String, ProtocolError> {
        Ok(if self.is_process_aarch32()? {
            format!(
                "pid:1;cputype:12;cpusubtype:0;triple:{};ostype:unknown;vendor:none;endian:little;ptrsize:4;",
                wire::str_to_hex("arm-unknown-linux-gnu")
            )
        } else {
            format!(
                "pid:1;cputype:100000c;cpusubtype:0;triple:{};ostype:unknown;vendor:none;endian:little;ptrsize:8;",
                wire::str_to_hex("aarch64-unknown-linux-gnu")
            )
        })
    }

    fn do_rcmd(&self, hex: &str) -> Result<String, ProtocolError> {
        let bytes = wire::from_hex(hex)?;
        let command = String::from_utf8_lossy(&bytes).to_string();
        debug!("received monitor command: {command}");

        let output = self.monitor.dispatch(&command, &self.monitor_context());
        Ok(wire::str_to_hex(&output))
    }

    fn do_thread_info_first(&self) -> Result<String, ProtocolError> {
        let process = self.process()?;
        let ids: Vec<String> = process.thread_uids().iter().map(|uid| format!("{uid:x}")).collect();
        Ok(format!("m{}", ids.join(",")))
    }

    fn do_thread_extra_info(&self, thread: Option<ThreadId>) -> Result<String, ProtocolError> {
        let process = self.process()?;
        let uid = match thread {
            Some(ThreadId::Id(uid)) => uid,
            Some(ThreadId::Any) => self.first_thread(process.as_ref())?,
            _ => return Err(ProtocolError::Malformed),
        };

        if process.context(uid).is_none() {
            return Err(ProtocolError::ThreadNotFound(uid));
        }

        let state = if process.is_thread_paused(uid) { "Paused" } else { "Running" };
        Ok(wire::str_to_hex(state))
    }

    fn do_xfer_threads(&mut self, offset: u64, length: u64) -> Result<String, ProtocolError> {
        // Offset zero starts a fresh read; later chunks page through the
        // snapshot taken then.
        if offset == 0 {
            self.thread_list_xml = self.build_thread_list_xml()?;
        }
        Ok(xfer_chunk(&self.thread_list_xml, offset, length))
    }

    fn do_xfer_features(&self, annex: &str, offset: u64, length: u64) -> Result<String, ProtocolError> {
        let aarch32 = self.is_process_aarch32()?;
        match features::lookup(annex, aarch32) {
            Some(document) => Ok(xfer_chunk(document, offset, length)),
            // Invalid annex.
            None => Ok("E00".to_string()),
        }
    }

    fn build_thread_list_xml(&self) -> Result<String, ProtocolError> {
        let process = self.process()?;

        let mut xml = String::from("<?xml version=\"1.0\"?><threads>\n");
        for uid in process.thread_uids() {
            let name = xml_escape(&process.thread_name(uid).unwrap_or_default());
            let state = if process.is_thread_paused(uid) { "Paused" } else { "Running" };
            let _ = writeln!(xml, "<thread id=\"{uid:x}\" name=\"{name}\">{state}</thread>");
        }
        xml.push_str("</threads>");
        Ok(xml)
    }
}

fn stop_reply(signal: u8, thread_uid: u64) -> String {
    format!("T{signal:02x}thread:{thread_uid:x};")
}

/// One chunk of a paginated transfer: `l` when the read reaches the end of
/// the document, `m` when more remains, content binary-escaped.
fn xfer_chunk(data: &str, offset: u64, length: u64) -> String {
    let bytes = data.as_bytes();
    let offset = offset as usize;
    if offset >= bytes.len() {
        return "l".to_string();
    }

    let end = bytes.len().min(offset + length as usize);
    let marker = if end == bytes.len() { 'l' } else { 'm' };
    let escaped = wire::escape_binary(&bytes[offset..end]);
    format!("{marker}{}", String::from_utf8_lossy(&escaped))
}

fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}
