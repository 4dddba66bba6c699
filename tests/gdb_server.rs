//! End-to-end protocol scenarios: a real TCP client against a [`GdbServer`]
//! backed by mock guest collaborators.

use std::collections::{HashMap, HashSet};
use std::io::{BufReader, Read, Write};
use std::net::{IpAddr, Ipv4Addr, TcpStream};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gdb_stub_server::guest::{
    DebugProcess, DebugTarget, ExecutionContext, InvalidMemoryRegion, MemoryLayout, MemoryRegion,
    ModuleInfo, ProcessMetadata,
};
use gdb_stub_server::{GdbServer, GdbServerConfig};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_test_writer()
        .try_init();
}

// --- mock guest ---

struct MockContext {
    uid: u64,
    aarch32: bool,
    x: Mutex<[u64; 32]>,
    pc: Mutex<u64>,
    pstate: Mutex<u32>,
    v: Mutex<[u128; 32]>,
    fpsr: Mutex<u32>,
    fpcr: Mutex<u32>,
}

impl MockContext {
    fn new(uid: u64) -> Self {
        Self {
            uid,
            aarch32: false,
            x: Mutex::new([0; 32]),
            pc: Mutex::new(0x8000_0000),
            pstate: Mutex::new(0),
            v: Mutex::new([0; 32]),
            fpsr: Mutex::new(0),
            fpcr: Mutex::new(0),
        }
    }
}

impl ExecutionContext for MockContext {
    fn thread_uid(&self) -> u64 {
        self.uid
    }
    fn is_aarch32(&self) -> bool {
        self.aarch32
    }
    fn x(&self, index: usize) -> u64 {
        self.x.lock().unwrap()[index]
    }
    fn set_x(&self, index: usize, value: u64) {
        self.x.lock().unwrap()[index] = value;
    }
    fn pc(&self) -> u64 {
        *self.pc.lock().unwrap()
    }
    fn set_pc(&self, value: u64) {
        *self.pc.lock().unwrap() = value;
    }
    fn pstate(&self) -> u32 {
        *self.pstate.lock().unwrap()
    }
    fn set_pstate(&self, value: u32) {
        *self.pstate.lock().unwrap() = value;
    }
    fn v(&self, index: usize) -> u128 {
        self.v.lock().unwrap()[index]
    }
    fn set_v(&self, index: usize, value: u128) {
        self.v.lock().unwrap()[index] = value;
    }
    fn fpsr(&self) -> u32 {
        *self.fpsr.lock().unwrap()
    }
    fn set_fpsr(&self, value: u32) {
        *self.fpsr.lock().unwrap() = value;
    }
    fn fpcr(&self) -> u32 {
        *self.fpcr.lock().unwrap()
    }
    fn set_fpcr(&self, value: u32) {
        *self.fpcr.lock().unwrap() = value;
    }
}

struct MockProcess {
    contexts: Vec<Arc<MockContext>>,
    mapped: Range<u64>,
    memory: Mutex<HashMap<u64, u8>>,
    paused: AtomicBool,
    stop_count: AtomicUsize,
    continue_all_count: AtomicUsize,
    continued_threads: Mutex<Vec<u64>>,
    stepped_threads: Mutex<Vec<u64>>,
    failing_steps: Mutex<HashSet<u64>>,
    armed_breakpoints: Mutex<HashSet<u64>>,
    invalidated_regions: Mutex<Vec<(u64, u64)>>,
}

impl MockProcess {
    fn new(thread_uids: &[u64]) -> Self {
        Self {
            contexts: thread_uids.iter().map(|uid| Arc::new(MockContext::new(*uid))).collect(),
            mapped: 0x1000..0x20000,
            memory: Mutex::new(HashMap::new()),
            paused: AtomicBool::new(false),
            stop_count: AtomicUsize::new(0),
            continue_all_count: AtomicUsize::new(0),
            continued_threads: Mutex::new(Vec::new()),
            stepped_threads: Mutex::new(Vec::new()),
            failing_steps: Mutex::new(HashSet::new()),
            armed_breakpoints: Mutex::new(HashSet::new()),
            invalidated_regions: Mutex::new(Vec::new()),
        }
    }

    fn check_mapped(&self, address: u64, length: u64) -> Result<(), InvalidMemoryRegion> {
        if self.mapped.contains(&address) && self.mapped.contains(&(address + length - 1)) {
            Ok(())
        } else {
            Err(InvalidMemoryRegion { address })
        }
    }
}

impl DebugProcess for MockProcess {
    fn debug_stop(&self) {
        self.stop_count.fetch_add(1, Ordering::SeqCst);
        self.paused.store(true, Ordering::SeqCst);
    }
    fn debug_continue(&self) {
        self.continue_all_count.fetch_add(1, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);
    }
    fn debug_continue_thread(&self, thread_uid: u64) {
        self.continued_threads.lock().unwrap().push(thread_uid);
    }
    fn debug_step(&self, thread_uid: u64) -> bool {
        self.stepped_threads.lock().unwrap().push(thread_uid);
        !self.failing_steps.lock().unwrap().contains(&thread_uid)
    }
    fn debug_interrupt(&self, _context: &dyn ExecutionContext) {
        self.paused.store(true, Ordering::SeqCst);
    }
    fn thread_uids(&self) -> Vec<u64> {
        self.contexts.iter().map(|c| c.uid).collect()
    }
    fn context(&self, thread_uid: u64) -> Option<Arc<dyn ExecutionContext>> {
        self.contexts
            .iter()
            .find(|c| c.uid == thread_uid)
            .map(|c| Arc::clone(c) as Arc<dyn ExecutionContext>)
    }
    fn thread_name(&self, thread_uid: u64) -> Option<String> {
        Some(format!("WorkerThread{thread_uid}"))
    }
    fn is_thread_paused(&self, _thread_uid: u64) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
    fn read_memory(&self, address: u64, buffer: &mut [u8]) -> Result<(), InvalidMemoryRegion> {
        self.check_mapped(address, buffer.len() as u64)?;
        let memory = self.memory.lock().unwrap();
        for (i, slot) in buffer.iter_mut().enumerate() {
            *slot = memory.get(&(address + i as u64)).copied().unwrap_or(0);
        }
        Ok(())
    }
    fn write_memory(&self, address: u64, data: &[u8]) -> Result<(), InvalidMemoryRegion> {
        self.check_mapped(address, data.len() as u64)?;
        let mut memory = self.memory.lock().unwrap();
        for (i, byte) in data.iter().enumerate() {
            memory.insert(address + i as u64, *byte);
        }
        Ok(())
    }
    fn invalidate_cache_region(&self, address: u64, size: u64) {
        self.invalidated_regions.lock().unwrap().push((address, size));
    }
    fn install_breakpoint(&self, address: u64, length: u64) -> Result<(), InvalidMemoryRegion> {
        self.check_mapped(address, length)?;
        self.armed_breakpoints.lock().unwrap().insert(address);
        Ok(())
    }
    fn remove_breakpoint(&self, address: u64, _length: u64) -> Result<(), InvalidMemoryRegion> {
        self.armed_breakpoints.lock().unwrap().remove(&address);
        Ok(())
    }
}

struct MockMetadata;

impl ProcessMetadata for MockMetadata {
    fn program_id(&self) -> u64 {
        0x0100_abcd_0000_0000
    }
    fn is_application(&self) -> bool {
        true
    }
    fn memory_layout(&self) -> MemoryLayout {
        let region = |start, end| MemoryRegion { start, end };
        MemoryLayout {
            alias: region(0x10_0000_0000, 0x18_0000_0000),
            heap: region(0x18_0000_0000, 0x20_0000_0000),
            aslr: region(0x08_0000_0000, 0x10_0000_0000),
            stack: region(0x20_0000_0000, 0x21_0000_0000),
        }
    }
    fn loaded_modules(&self) -> Vec<ModuleInfo> {
        vec![ModuleInfo { base_address: 0x0800_0000, size: 0x4_0000, name: "main".to_string() }]
    }
    fn guest_stack_trace(&self, thread_uid: u64) -> anyhow::Result<String> {
        Ok(format!("0x08000040 entry (thread {thread_uid})\n"))
    }
    fn register_printout(&self, thread_uid: u64) -> anyhow::Result<String> {
        Ok(format!("pc: 0x80000000 (thread {thread_uid})\n"))
    }
}

struct MockTarget {
    process: Arc<MockProcess>,
    started: AtomicBool,
}

impl DebugTarget for MockTarget {
    fn debug_process(&self) -> Option<Arc<dyn DebugProcess>> {
        if self.started.load(Ordering::SeqCst) {
            Some(Arc::clone(&self.process) as Arc<dyn DebugProcess>)
        } else {
            None
        }
    }
    fn process_metadata(&self) -> Option<Arc<dyn ProcessMetadata>> {
        Some(Arc::new(MockMetadata))
    }
}

// --- client plumbing ---

struct Client {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl Client {
    fn connect(server: &GdbServer) -> Self {
        let stream = TcpStream::connect(server.local_addr()).expect("connect to stub");
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .expect("set read timeout");
        let reader = BufReader::new(stream.try_clone().expect("clone client socket"));
        Self { stream, reader }
    }

    fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).expect("send");
    }

    fn send_packet(&mut self, body: &str) {
        let checksum = body.bytes().fold(0u8, |acc, b| acc.wrapping_add(b));
        self.send_raw(format!("${body}#{checksum:02x}").as_bytes());
    }

    fn read_byte(&mut self) -> u8 {
        let mut buf = [0u8; 1];
        self.reader.read_exact(&mut buf).expect("read byte");
        buf[0]
    }

    fn expect_ack(&mut self) {
        assert_eq!(self.read_byte(), b'+', "expected command acknowledgement");
    }

    /// Reads one framed reply, skipping interleaved acks.
    fn read_packet(&mut self) -> String {
        loop {
            match self.read_byte() {
                b'$' => break,
                b'+' => continue,
                other => panic!("unexpected byte {other:#x} while waiting for a packet"),
            }
        }

        let mut body = Vec::new();
        loop {
            match self.read_byte() {
                b'#' => break,
                byte => body.push(byte),
            }
        }
        let _checksum = [self.read_byte(), self.read_byte()];
        self.send_raw(b"+");

        String::from_utf8(body).expect("reply is ASCII")
    }

    fn request(&mut self, body: &str) -> String {
        self.send_packet(body);
        self.expect_ack();
        self.read_packet()
    }
}

fn hex_of(text: &str) -> String {
    text.bytes().map(|b| format!("{b:02x}")).collect()
}

fn start_stub(thread_uids: &[u64]) -> (GdbServer, Arc<MockProcess>) {
    init_tracing();

    let process = Arc::new(MockProcess::new(thread_uids));
    let target = Arc::new(MockTarget {
        process: Arc::clone(&process),
        started: AtomicBool::new(true),
    });

    let config = GdbServerConfig {
        bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        process_wait_retries: 5,
        process_wait_interval_ms: 10,
        break_ack_timeout_ms: 2000,
    };
    let server = GdbServer::start(target, config).expect("start stub");
    (server, process)
}

// --- scenarios ---

#[test]
fn initial_contact_stops_guest_and_names_first_thread() {
    let (server, process) = start_stub(&[1, 2]);
    let mut client = Client::connect(&server);

    assert_eq!(client.request("?"), "T05thread:1;");
    assert!(process.stop_count.load(Ordering::SeqCst) >= 1);
    assert!(process.paused.load(Ordering::SeqCst));
}

#[test]
fn malformed_checksum_is_nacked_without_state_change() {
    let (server, process) = start_stub(&[1]);
    let mut client = Client::connect(&server);

    client.send_raw(b"$?#00");
    assert_eq!(client.read_byte(), b'-');
    assert_eq!(process.stop_count.load(Ordering::SeqCst), 0);

    // The session survives and a well-formed retry works.
    assert_eq!(client.request("?"), "T05thread:1;");
}

#[test]
fn breakpoint_set_clear_and_double_clear() {
    let (server, process) = start_stub(&[1]);
    let mut client = Client::connect(&server);

    assert_eq!(client.request("Z0,1000,4"), "OK");
    assert!(process.armed_breakpoints.lock().unwrap().contains(&0x1000));

    assert_eq!(client.request("z0,1000,4"), "OK");
    assert!(process.armed_breakpoints.lock().unwrap().is_empty());

    assert_eq!(client.request("z0,1000,4"), "E01");
}

#[test]
fn hardware_breakpoints_and_watchpoints_are_rejected() {
    let (server, _process) = start_stub(&[1]);
    let mut client = Client::connect(&server);

    for kind in ["1", "2", "3", "4"] {
        assert_eq!(client.request(&format!("Z{kind},1000,4")), "E01");
        assert_eq!(client.request(&format!("z{kind},1000,4")), "E01");
    }
}

#[test]
fn rcmd_help_lists_monitor_commands() {
    let (server, _process) = start_stub(&[1]);
    let mut client = Client::connect(&server);

    let reply = client.request(&format!("qRcmd,{}", hex_of("help")));
    assert_eq!(reply, hex_of("get info\nbacktrace\nbt\nregisters\nreg\nminidump\n"));
}

#[test]
fn rcmd_get_info_renders_process_summary() {
    let (server, _process) = start_stub(&[1]);
    let mut client = Client::connect(&server);

    let reply = client.request(&format!("qRcmd,{}", hex_of("get info")));
    let text = String::from_utf8(
        (0..reply.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&reply[i..i + 2], 16).unwrap())
            .collect(),
    )
    .unwrap();
    assert!(text.contains("Program Id:  0x0100abcd00000000"));
    assert!(text.contains("Modules:"));
}

#[test]
fn rcmd_unknown_command_returns_text() {
    let (server, _process) = start_stub(&[1]);
    let mut client = Client::connect(&server);

    let reply = client.request(&format!("qRcmd,{}", hex_of("selftest")));
    assert_eq!(reply, hex_of("Unknown command: selftest\n"));
}

#[test]
fn memory_write_then_read_round_trips() {
    let (server, process) = start_stub(&[1]);
    let mut client = Client::connect(&server);

    assert_eq!(client.request("M4000,4:deadbeef"), "OK");
    assert_eq!(client.request("m4000,4"), "deadbeef");
    assert_eq!(
        process.invalidated_regions.lock().unwrap().as_slice(),
        &[(0x4000, 4)]
    );
}

#[test]
fn unmapped_memory_access_is_an_error() {
    let (server, _process) = start_stub(&[1]);
    let mut client = Client::connect(&server);

    assert_eq!(client.request("m40,4"), "E01");
    assert_eq!(client.request("M40,2:abcd"), "E01");
}

#[test]
fn register_access_through_the_general_thread() {
    let (server, process) = start_stub(&[1]);
    let mut client = Client::connect(&server);

    // No thread selected yet.
    assert_eq!(client.request("p0"), "E01");

    client.request("?");
    assert_eq!(client.request("P0=efcdab8967452301"), "OK");
    assert_eq!(process.contexts[0].x(0), 0x0123_4567_89ab_cdef);
    assert_eq!(client.request("p0"), "efcdab8967452301");

    // pc is register 32 on AArch64.
    assert_eq!(client.request("p20"), "0000008000000000");

    // 33 general/pc registers, pstate, 32 vectors, fpsr, fpcr.
    let blob = client.request("g");
    assert_eq!(blob.len(), 33 * 16 + 8 + 32 * 32 + 2 * 8);
    assert!(blob.starts_with("efcdab8967452301"));
}

#[test]
fn out_of_range_register_is_an_error() {
    let (server, _process) = start_stub(&[1]);
    let mut client = Client::connect(&server);

    client.request("?");
    assert_eq!(client.request("p44"), "E01");
}

#[test]
fn thread_queries_and_selection() {
    let (server, _process) = start_stub(&[1, 2]);
    let mut client = Client::connect(&server);

    assert_eq!(client.request("qfThreadInfo"), "m1,2");
    assert_eq!(client.request("qsThreadInfo"), "l");

    assert_eq!(client.request("T2"), "OK");
    assert_eq!(client.request("T7"), "E00");

    assert_eq!(client.request("Hg2"), "OK");
    assert_eq!(client.request("Hc1"), "OK");
    assert_eq!(client.request("Hg7"), "E01");

    // Before anything stopped the guest, threads report as running.
    assert_eq!(client.request("qThreadExtraInfo,2"), hex_of("Running"));
    client.request("?");
    assert_eq!(client.request("qThreadExtraInfo,2"), hex_of("Paused"));
}

#[test]
fn thread_list_xml_is_paginated_and_cached() {
    let (server, _process) = start_stub(&[1, 2]);
    let mut client = Client::connect(&server);

    let full = client.request("qXfer:threads:read::0,10000");
    assert!(full.starts_with('l'));
    assert!(full.contains("<threads>"));
    assert!(full.contains("WorkerThread1"));
    assert!(full.contains("WorkerThread2"));

    // Chunked read: 0x10 bytes from offset 0, remainder from the cache.
    let first = client.request("qXfer:threads:read::0,10");
    assert!(first.starts_with('m'));
    let rest = client.request("qXfer:threads:read::10,10000");
    assert!(rest.starts_with('l'));
    let stitched = format!("{}{}", &first[1..], &rest[1..]);
    assert_eq!(stitched, full[1..]);
}

#[test]
fn target_description_matches_guest_width() {
    let (server, _process) = start_stub(&[1]);
    let mut client = Client::connect(&server);

    client.request("?");
    let xml = client.request("qXfer:features:read:target.xml:0,10000");
    assert!(xml.starts_with('l'));
    assert!(xml.contains("<architecture>aarch64</architecture>"));

    assert_eq!(client.request("qXfer:features:read:nonsense.xml:0,100"), "E00");
}

#[test]
fn supported_features_are_advertised() {
    let (server, _process) = start_stub(&[1]);
    let mut client = Client::connect(&server);

    let reply = client.request("qSupported:multiprocess+;xmlRegisters=i386");
    assert!(reply.contains("PacketSize=10000"));
    assert!(reply.contains("qXfer:threads:read+"));
    assert!(reply.contains("vContSupported+"));

    assert_eq!(client.request("vCont?"), "vCont;c;C;s;S");
    assert_eq!(client.request("vMustReplyEmpty"), "");
    assert_eq!(client.request("qGLUnsupportedThing"), "");
}

#[test]
fn vcont_steps_one_thread_and_continues_the_rest() {
    let (server, process) = start_stub(&[1, 2, 3]);
    let mut client = Client::connect(&server);
    client.request("?");

    client.send_packet("vCont;s:2;c");
    client.expect_ack();
    assert_eq!(client.read_packet(), "OK");
    assert_eq!(client.read_packet(), "T05thread:2;");

    assert_eq!(process.stepped_threads.lock().unwrap().as_slice(), &[2]);
    // The wildcard continue is the default action, so no per-thread
    // continue calls are made for the others.
    assert!(process.continued_threads.lock().unwrap().is_empty());
}

#[test]
fn vcont_continue_all_collapses_to_one_call() {
    let (server, process) = start_stub(&[1, 2]);
    let mut client = Client::connect(&server);
    client.request("?");

    let before = process.continue_all_count.load(Ordering::SeqCst);
    assert_eq!(client.request("vCont;c"), "OK");
    assert_eq!(process.continue_all_count.load(Ordering::SeqCst), before + 1);
}

#[test]
fn vcont_without_wildcard_continues_threads_individually() {
    let (server, process) = start_stub(&[1, 2, 3]);
    let mut client = Client::connect(&server);
    client.request("?");

    let before = process.continue_all_count.load(Ordering::SeqCst);
    assert_eq!(client.request("vCont;c:1;c:2"), "OK");
    assert_eq!(process.continue_all_count.load(Ordering::SeqCst), before);
    let mut continued = process.continued_threads.lock().unwrap().clone();
    continued.sort_unstable();
    assert_eq!(continued, vec![1, 2]);
}

#[test]
fn vcont_step_failure_reports_error_but_still_stops() {
    let (server, process) = start_stub(&[1, 2]);
    process.failing_steps.lock().unwrap().insert(2);
    let mut client = Client::connect(&server);
    client.request("?");

    client.send_packet("vCont;s:2;c");
    client.expect_ack();
    assert_eq!(client.read_packet(), "E01");
    assert_eq!(client.read_packet(), "T05thread:2;");
}

#[test]
fn single_step_selects_and_reports_the_thread() {
    let (server, process) = start_stub(&[1, 2]);
    let mut client = Client::connect(&server);

    // `s` needs a current thread.
    assert_eq!(client.request("s"), "E01");

    client.request("?");
    client.request("Hc2");
    assert_eq!(client.request("s"), "T05thread:2;");
    assert_eq!(process.stepped_threads.lock().unwrap().as_slice(), &[2]);
}

#[test]
fn detach_clears_breakpoints_and_resumes() {
    let (server, process) = start_stub(&[1]);
    let mut client = Client::connect(&server);

    client.request("Z0,1000,4");
    client.request("Z0,2000,4");
    assert_eq!(process.armed_breakpoints.lock().unwrap().len(), 2);

    let before = process.continue_all_count.load(Ordering::SeqCst);
    assert_eq!(client.request("D"), "OK");
    assert!(process.armed_breakpoints.lock().unwrap().is_empty());
    assert_eq!(process.continue_all_count.load(Ordering::SeqCst), before + 1);
}

#[test]
fn kill_is_treated_as_detach() {
    let (server, process) = start_stub(&[1]);
    let mut client = Client::connect(&server);

    client.request("Z0,1000,4");
    client.send_packet("k");
    client.expect_ack();
    assert_eq!(client.read_packet(), "");
    assert_eq!(client.read_packet(), "OK");
    assert!(process.armed_breakpoints.lock().unwrap().is_empty());
}

#[test]
fn break_in_byte_interrupts_the_guest() {
    let (server, process) = start_stub(&[1, 2]);
    let mut client = Client::connect(&server);
    client.request("?");
    client.request("vCont;c");

    client.send_raw(&[0x03]);
    assert_eq!(client.read_packet(), "T02thread:1;");
    assert!(process.paused.load(Ordering::SeqCst));
}

#[test]
fn asynchronous_breakpoint_hit_produces_a_stop_reply() {
    let (server, process) = start_stub(&[1, 2]);
    let mut client = Client::connect(&server);
    client.request("?");
    client.request("vCont;c");

    // The engine reports thread 2 hitting a breakpoint from its own thread;
    // the call returns once the dispatcher acknowledged the stop.
    let context = process.context(2).unwrap();
    server.break_handler(context, 0x8000_0040, 0xd436_0000);

    assert_eq!(client.read_packet(), "T05thread:2;");
    assert!(process.paused.load(Ordering::SeqCst));

    // The reporting thread became current: `s` steps it.
    assert_eq!(client.request("s"), "T05thread:2;");
}

#[test]
fn unknown_commands_get_an_empty_reply() {
    let (server, _process) = start_stub(&[1]);
    let mut client = Client::connect(&server);

    assert_eq!(client.request("X1000,4:"), "");
    assert_eq!(client.request("Qxyz"), "");
    assert_eq!(client.request("!"), "OK");
}

#[test]
fn shutdown_joins_cleanly_with_an_open_session() {
    let (mut server, _process) = start_stub(&[1]);
    let mut client = Client::connect(&server);
    client.request("?");

    server.shutdown();
}
