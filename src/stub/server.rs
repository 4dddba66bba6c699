//! Server lifecycle and session transport.
//!
//! Two owned threads: the transport (accept loop + per-connection packet
//! framing) and the dispatcher ([`super::handler`]). They meet at a
//! single-slot message queue, which is the only synchronization point: the
//! transport cannot parse ahead of the dispatcher, messages stay strictly
//! ordered, and the CPU collaborator's break reports funnel through the same
//! slot from its own threads.

use std::io::{BufReader, Read};
use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::guest::{DebugProcess, DebugTarget, ExecutionContext};
use crate::proto::wire;
use crate::stub::breakpoints::BreakpointTable;
use crate::stub::handler::MessageHandler;
use crate::stub::message::{Message, ThreadBreak};
use crate::stub::monitor::MonitorRegistry;

/// The write half of the active client connection, shared between the
/// transport (connect/disconnect) and the dispatcher (replies).
pub(crate) type SharedStream = Arc<Mutex<Option<TcpStream>>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GdbServerConfig {
    pub bind_address: IpAddr,
    /// Port to listen on; 0 picks an ephemeral port (see
    /// [`GdbServer::local_addr`]).
    pub port: u16,
    /// How many times to poll for a running guest after a client connects.
    pub process_wait_retries: u32,
    pub process_wait_interval_ms: u64,
    /// How long a reporting engine thread is held waiting for the dispatcher
    /// to acknowledge its stop.
    pub break_ack_timeout_ms: u64,
}

impl Default for GdbServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 55555,
            process_wait_retries: 10,
            process_wait_interval_ms: 200,
            break_ack_timeout_ms: 5000,
        }
    }
}

/// Manually reset event used for the break-report hand-off.
pub(crate) struct ResetEvent {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl ResetEvent {
    fn new() -> Self {
        Self { signaled: Mutex::new(false), cond: Condvar::new() }
    }

    pub(crate) fn reset(&self) {
        *self.signaled.lock().unwrap() = false;
    }

    pub(crate) fn set(&self) {
        *self.signaled.lock().unwrap() = true;
        self.cond.notify_all();
    }

    /// True when the event was signaled before the timeout.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.signaled.lock().unwrap();
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |signaled| !*signaled)
            .unwrap();
        *guard
    }
}

pub struct GdbServer {
    target: Arc<dyn DebugTarget>,
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    messages: SyncSender<Message>,
    stream: SharedStream,
    break_ack: Arc<ResetEvent>,
    break_ack_timeout: Duration,
    transport_thread: Option<JoinHandle<()>>,
    handler_thread: Option<JoinHandle<()>>,
}

impl GdbServer {
    /// Binds the listener and spawns the transport and dispatcher threads.
    pub fn start(target: Arc<dyn DebugTarget>, config: GdbServerConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(SocketAddr::new(config.bind_address, config.port))?;
        let local_addr = listener.local_addr()?;
        info!("waiting on {local_addr} for GDB client");

        // Capacity one: the transport blocks until the dispatcher has taken
        // the previous message, and break reports queue behind commands.
        let (messages, inbox) = sync_channel::<Message>(1);
        let stream: SharedStream = Arc::new(Mutex::new(None));
        let breakpoints = Arc::new(Mutex::new(BreakpointTable::new()));
        let break_ack = Arc::new(ResetEvent::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let handler = MessageHandler::new(
            Arc::clone(&target),
            inbox,
            Arc::clone(&stream),
            Arc::clone(&breakpoints),
            MonitorRegistry::with_builtin_commands(),
            Arc::clone(&break_ack),
        );
        let handler_thread = std::thread::Builder::new()
            .name("gdb-stub-handler".to_string())
            .spawn(move || handler.run())?;

        let transport = SessionTransport {
            listener,
            target: Arc::clone(&target),
            messages: messages.clone(),
            stream: Arc::clone(&stream),
            breakpoints,
            shutdown: Arc::clone(&shutdown),
            wait_retries: config.process_wait_retries,
            wait_interval: Duration::from_millis(config.process_wait_interval_ms),
        };
        let transport_thread = std::thread::Builder::new()
            .name("gdb-stub-transport".to_string())
            .spawn(move || transport.run())?;

        Ok(Self {
            target,
            local_addr,
            shutdown,
            messages,
            stream,
            break_ack,
            break_ack_timeout: Duration::from_millis(config.break_ack_timeout_ms),
            transport_thread: Some(transport_thread),
            handler_thread: Some(handler_thread),
        })
    }

    /// The bound address, with the real port when 0 was configured.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Entry point for the emulated CPU when a thread hits a breakpoint.
    ///
    /// Blocks the reporting engine thread (bounded by the configured
    /// timeout) until the dispatcher has observed the stop, so the same
    /// breakpoint cannot re-enter before the debugger was notified.
    pub fn break_handler(&self, context: Arc<dyn ExecutionContext>, address: u64, opcode: u32) {
        if let Some(process) = self.target.debug_process() {
            process.debug_interrupt(context.as_ref());
        }

        self.break_ack.reset();
        let thread_uid = context.thread_uid();
        if self
            .messages
            .send(Message::ThreadBreak(ThreadBreak { context, address, opcode }))
            .is_ok()
        {
            info!("break hit on thread {thread_uid:#x} at pc {address:#x}");
            if !self.break_ack.wait_timeout(self.break_ack_timeout) {
                warn!("debugger did not acknowledge the break in time");
            }
        }
    }

    /// Entry point for the emulated CPU when a requested single-step
    /// completes. The stop reply was already produced by the step command.
    pub fn step_handler(&self, context: Arc<dyn ExecutionContext>) {
        if let Some(process) = self.target.debug_process() {
            process.debug_interrupt(context.as_ref());
        }
    }

    /// Stops both threads and releases the port. Idempotent.
    pub fn shutdown(&mut self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        // A blocking accept only returns once a connection arrives; give it
        // one.
        let wake_addr = if self.local_addr.ip().is_unspecified() {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), self.local_addr.port())
        } else {
            self.local_addr
        };
        let _ = TcpStream::connect_timeout(&wake_addr, Duration::from_millis(250));

        // Unblock a read stuck mid-packet.
        if let Some(stream) = self.stream.lock().unwrap().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }

        let _ = self.messages.send(Message::Kill);

        if let Some(thread) = self.transport_thread.take() {
            let _ = thread.join();
        }
        if let Some(thread) = self.handler_thread.take() {
            let _ = thread.join();
        }
        info!("GDB stub stopped");
    }
}

impl Drop for GdbServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct SessionTransport {
    listener: TcpListener,
    target: Arc<dyn DebugTarget>,
    messages: SyncSender<Message>,
    stream: SharedStream,
    breakpoints: Arc<Mutex<BreakpointTable>>,
    shutdown: Arc<AtomicBool>,
    wait_retries: u32,
    wait_interval: Duration,
}

impl SessionTransport {
    fn run(self) {
        while !self.shutdown.load(Ordering::SeqCst) {
            let (socket, peer) = match self.listener.accept() {
                Ok(pair) => pair,
                Err(e) => {
                    if self.shutdown.load(Ordering::SeqCst) {
                        return;
                    }
                    warn!("accept failed: {e}");
                    continue;
                }
            };
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }

            // The client may connect before the guest is running; give the
            // guest a bounded window to come up.
            let Some(process) = self.wait_for_process() else {
                warn!("guest is not running, dropping GDB client connection");
                continue;
            };

            let _ = socket.set_nodelay(true);
            let write_half = match socket.try_clone() {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("failed to split client socket: {e}");
                    continue;
                }
            };
            *self.stream.lock().unwrap() = Some(write_half);
            info!("GDB client connected from {peer}");

            self.packet_loop(socket);

            info!("GDB client lost connection");
            if let Some(stream) = self.stream.lock().unwrap().take() {
                let _ = stream.shutdown(Shutdown::Both);
            }
            self.breakpoints.lock().unwrap().clear_all(process.as_ref());
        }
    }

    fn wait_for_process(&self) -> Option<Arc<dyn DebugProcess>> {
        let mut retries = self.wait_retries;
        loop {
            if let Some(process) = self.target.debug_process() {
                if !process.thread_uids().is_empty() {
                    return Some(process);
                }
            }
            if retries == 0 || self.shutdown.load(Ordering::SeqCst) {
                return None;
            }
            retries -= 1;
            std::thread::sleep(self.wait_interval);
        }
    }

    /// Consumes bytes until EOF or an I/O fault ends the session.
    fn packet_loop(&self, socket: TcpStream) {
        let mut reader = BufReader::new(socket);
        loop {
            let byte = match read_byte(&mut reader) {
                Ok(Some(byte)) => byte,
                Ok(None) | Err(_) => return,
            };

            match byte {
                // Acknowledgement of our last reply.
                b'+' => continue,
                // There is no retransmission to do; the failed reply is lost.
                b'-' => {
                    info!("NACK received");
                    continue;
                }
                0x03 => {
                    if self.messages.send(Message::BreakIn).is_err() {
                        return;
                    }
                }
                b'$' => {
                    if !self.read_packet(&mut reader) {
                        return;
                    }
                }
                // Stray bytes between packets are ignored.
                _ => {}
            }
        }
    }

    fn read_packet(&self, reader: &mut BufReader<TcpStream>) -> bool {
        let mut body = Vec::new();
        loop {
            match read_byte(reader) {
                Ok(Some(b'#')) => break,
                Ok(Some(byte)) => body.push(byte),
                Ok(None) | Err(_) => return false,
            }
        }

        let mut digits = [0u8; 2];
        for slot in &mut digits {
            match read_byte(reader) {
                Ok(Some(byte)) => *slot = byte,
                Ok(None) | Err(_) => return false,
            }
        }
        let digits = String::from_utf8_lossy(&digits).into_owned();

        let message = if wire::verify_checksum(&body, &digits) {
            Message::Command(String::from_utf8_lossy(&body).into_owned())
        } else {
            warn!("packet checksum mismatch, sending NACK");
            Message::SendNack
        };

        self.messages.send(message).is_ok()
    }
}

fn read_byte(reader: &mut impl Read) -> std::io::Result<Option<u8>> {
    let mut buf = [0u8; 1];
    match reader.read(&mut buf) {
        Ok(0) => Ok(None),
        Ok(_) => Ok(Some(buf[0])),
        Err(e) => Err(e),
    }
}
