use crate::library::{
    engine::{Completion, Engine, Failed, Received},
    error::EngineError,
    network::socket_helpers::{bind_udp, prepare_receive_socket},
    request::ReceiveRequest,
    uring::{RingConfig, waker::Waker},
};
use core_affinity::CoreId;
use nano_clock::timestamp;
use std::{
    io,
    net::{SocketAddr, UdpSocket},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use thread_priority::{ThreadBuilderExt, ThreadPriority};
use tracing::{error, info, trace, warn};

const DEFAULT_QUEUE_DEPTH: u32 = 64;
const DEFAULT_BUFFER_SIZE: usize = 2048;
const DEFAULT_RCVBUF: i32 = 4 * 1024 * 1024;
const HEARTBEAT: Duration = Duration::from_secs(1);

/// Per-worker counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    pub datagrams: u64,
    pub bytes: u64,
    pub truncated: u64,
    pub failures: u64,
    pub wakes: u64,
}

/// Multi-worker UDP receiver: one socket, one ring and one thread per worker,
/// all bound to the same address through `SO_REUSEPORT`.
#[derive(Debug, Clone)]
pub struct Receiver {
    addr: SocketAddr,
    workers: u8,
    queue_depth: u32,
    cq_depth: Option<u32>,
    buffer_size: usize,
    rcvbuf: i32,
    sqpoll_enabled: bool,
    sqpoll_idle: u32,
    realtime: bool,
    heartbeat: Duration,
}

impl Receiver {
    pub fn new(addr: SocketAddr) -> Receiver {
        Receiver {
            addr,
            workers: num_cpus::get().clamp(1, u8::MAX as usize) as u8,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            cq_depth: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            rcvbuf: DEFAULT_RCVBUF,
            sqpoll_enabled: false,
            sqpoll_idle: 0,
            realtime: false,
            heartbeat: HEARTBEAT,
        }
    }
    #[inline(always)]
    pub fn get_addr(&self) -> SocketAddr {
        self.addr
    }
    #[inline(always)]
    pub fn get_workers(&self) -> u8 {
        self.workers
    }
    #[inline(always)]
    pub fn set_workers(&mut self, workers: u8) -> &mut Self {
        self.workers = workers.max(1);
        self
    }
    #[inline(always)]
    pub fn get_queue_depth(&self) -> u32 {
        self.queue_depth
    }
    #[inline(always)]
    pub fn set_queue_depth(&mut self, queue_depth: u32) -> &mut Self {
        self.queue_depth = queue_depth;
        self
    }
    /// Completion queue size per ring; unset means twice the queue depth.
    #[inline(always)]
    pub fn set_cq_depth(&mut self, cq_depth: u32) -> &mut Self {
        self.cq_depth = Some(cq_depth);
        self
    }
    #[inline(always)]
    pub fn get_buffer_size(&self) -> usize {
        self.buffer_size
    }
    #[inline(always)]
    pub fn set_buffer_size(&mut self, buffer_size: usize) -> &mut Self {
        self.buffer_size = buffer_size;
        self
    }
    #[inline(always)]
    pub fn set_rcvbuf(&mut self, rcvbuf: i32) -> &mut Self {
        self.rcvbuf = rcvbuf;
        self
    }
    #[inline(always)]
    pub fn set_sqpoll_enabled(&mut self, enabled: bool) -> &mut Self {
        self.sqpoll_enabled = enabled;
        self
    }
    #[inline(always)]
    pub fn set_sqpoll_idle(&mut self, sqpoll_idle: u32) -> &mut Self {
        self.sqpoll_idle = sqpoll_idle;
        self
    }
    #[inline(always)]
    pub fn get_realtime(&self) -> bool {
        self.realtime
    }
    #[inline(always)]
    pub fn set_realtime(&mut self, enabled: bool) -> &mut Self {
        self.realtime = enabled;
        self
    }
    #[inline(always)]
    pub fn set_heartbeat(&mut self, heartbeat: Duration) -> &mut Self {
        self.heartbeat = heartbeat;
        self
    }
    #[inline(always)]
    pub fn build(&mut self) -> Self {
        self.clone()
    }

    pub fn ring_config(&self, worker: u32) -> RingConfig {
        let mut config = RingConfig::new(self.queue_depth);
        config
            .set_sqpoll_enabled(self.sqpoll_enabled)
            .set_sqpoll_idle(self.sqpoll_idle);
        if let Some(cq_depth) = self.cq_depth {
            config.set_cq_depth(cq_depth);
        }
        if self.sqpoll_enabled {
            config.set_sqpoll_cpu(Some(worker));
        }
        config
    }

    /// Keep `queue_depth` receives armed on `socket` and reap until `stop` is
    /// set. A heartbeat thread wakes the engine every period, so `stop` is
    /// noticed at the latest one period after it is set.
    pub fn serve(
        &self,
        engine: &mut Engine,
        socket: &UdpSocket,
        stop: &AtomicBool,
        on_datagram: impl FnMut(&Received),
    ) -> Result<WorkerStats, EngineError> {
        let waker: Waker = engine.waker();
        let done = AtomicBool::new(false);
        thread::scope(|scope| {
            thread::Builder::new()
                .name("tachyon-heartbeat".into())
                .spawn_scoped(scope, || {
                    while !done.load(Ordering::Acquire) && !stop.load(Ordering::Acquire) {
                        thread::sleep(self.heartbeat);
                        if let Err(e) = waker.wake() {
                            warn!("Heartbeat wake failed: {e}");
                        }
                    }
                })
                .map_err(|source| EngineError::Spawn {
                    name: "heartbeat",
                    source,
                })?;
            let result = self.pump(engine, socket, stop, on_datagram);
            done.store(true, Ordering::Release);
            result
        })
    }

    fn pump(
        &self,
        engine: &mut Engine,
        socket: &UdpSocket,
        stop: &AtomicBool,
        mut on_datagram: impl FnMut(&Received),
    ) -> Result<WorkerStats, EngineError> {
        let mut stats = WorkerStats::default();
        let mut spare: Vec<Box<ReceiveRequest>> = Vec::new();
        for _ in 0..self.queue_depth {
            let request = ReceiveRequest::new(self.buffer_size);
            if let Err(rejected) = engine.submit_receive(socket, request) {
                trace!("Initial arm stopped early: {}", rejected.error);
                spare.push(rejected.into_request());
                break;
            }
        }
        info!("Worker armed {} receives", engine.in_flight());

        let mut synced: i64 = unsafe { timestamp() };
        let mut last = WorkerStats::default();

        while !stop.load(Ordering::Acquire) {
            let request: Box<ReceiveRequest> = match engine.wait_completion()? {
                Completion::Received(received) => {
                    stats.datagrams += 1;
                    stats.bytes += received.len() as u64;
                    if received.request.is_truncated() {
                        stats.truncated += 1;
                    }
                    trace!(
                        "Datagram {} bytes from {}",
                        received.len(),
                        received.request.sender().socket_addr()
                    );
                    on_datagram(&received);
                    received.request
                }
                Completion::Failed(Failed { error, request, .. }) => {
                    stats.failures += 1;
                    warn!("Receive failed: {}", error.as_io_error());
                    if error.code == libc::EBADF || error.code == libc::ENOTSOCK {
                        error!("Socket is gone, stopping worker");
                        break;
                    }
                    request
                }
                Completion::Wake => {
                    stats.wakes += 1;
                    let clock: i64 = unsafe { timestamp() };
                    if clock != synced {
                        info!(
                            "Receiver: DPS: {} BYTES: {} FAILED: {} IN-FLIGHT: {}",
                            stats.datagrams - last.datagrams,
                            stats.bytes - last.bytes,
                            stats.failures - last.failures,
                            engine.in_flight()
                        );
                        last = stats;
                        synced = clock;
                    }
                    continue;
                }
            };
            let mut request = request;
            request.reset();
            spare.push(request);
            // Re-arm everything we hold; whatever the ring refuses waits for the next reap.
            while let Some(request) = spare.pop() {
                if let Err(rejected) = engine.submit_receive(socket, request) {
                    spare.push(rejected.into_request());
                    break;
                }
            }
        }
        Ok(stats)
    }
}

fn worker_main(receiver: Receiver, worker: u8, core: Option<CoreId>, stop: Arc<AtomicBool>) {
    if let Some(core) = core {
        if core_affinity::set_for_current(core) {
            info!("Core {} set affinity to {:?}", worker, core);
        } else {
            error!("Failed to set core affinity");
        }
    }
    info!("Creating receiver socket on {}", receiver.addr);
    let socket: UdpSocket = match bind_udp(receiver.addr, true) {
        Ok(socket) => socket,
        Err(e) => {
            error!("worker {worker} bind error: {e}");
            return;
        }
    };
    if let Err(e) = prepare_receive_socket(&socket, receiver.rcvbuf) {
        warn!("worker {worker} rcvbuf: {e}");
    }
    let mut engine: Engine = match Engine::new(&receiver.ring_config(worker as u32)) {
        Ok(engine) => engine,
        Err(e) => {
            error!("worker {worker} error: {e}");
            return;
        }
    };
    match receiver.serve(&mut engine, &socket, &stop, |_| {}) {
        Ok(stats) => info!("Worker {worker} done: {:?}", stats),
        Err(e) => error!("worker {worker} error: {e}"),
    }
    engine.teardown();
}

/// Spawn every worker and block until they all exit.
pub fn run(receiver: Receiver, stop: Arc<AtomicBool>) -> io::Result<()> {
    let core_ids: Vec<CoreId> = core_affinity::get_core_ids().unwrap_or_default();
    let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(receiver.workers as usize);
    for worker in 0..receiver.get_workers() {
        info!("Thread {} starting", worker);
        let core: Option<CoreId> = core_ids.get(worker as usize).copied();
        let receiver = receiver.clone();
        let stop = Arc::clone(&stop);
        let builder = thread::Builder::new().name(format!("Tachyon-{}", worker));
        let handle = if receiver.realtime {
            builder.spawn_with_priority(ThreadPriority::Max, move |res| {
                if let Err(e) = res {
                    warn!("Failed to raise thread priority: {e:?}");
                }
                worker_main(receiver, worker, core, stop)
            })?
        } else {
            builder.spawn(move || worker_main(receiver, worker, core, stop))?
        };
        handles.push(handle);
    }
    for handle in handles {
        if handle.join().is_err() {
            error!("Worker panicked");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_clamps_workers() {
        let receiver = Receiver::new("127.0.0.1:0".parse().unwrap())
            .set_workers(0)
            .set_queue_depth(8)
            .set_buffer_size(512)
            .build();
        assert_eq!(receiver.get_workers(), 1);
        assert_eq!(receiver.get_queue_depth(), 8);
        assert_eq!(receiver.get_buffer_size(), 512);
    }

    #[test]
    fn ring_config_follows_receiver() {
        let receiver = Receiver::new("127.0.0.1:0".parse().unwrap())
            .set_queue_depth(32)
            .set_sqpoll_enabled(true)
            .set_sqpoll_idle(7)
            .build();
        let config = receiver.ring_config(1);
        assert_eq!(config.get_queue_depth(), 32);
        assert!(config.get_sqpoll_enabled());
        assert_eq!(config.get_sqpoll_idle(), 7);
        assert_eq!(config.get_cq_depth(), 64);
    }

    #[test]
    fn cq_depth_reaches_ring_config() {
        let receiver = Receiver::new("127.0.0.1:0".parse().unwrap())
            .set_queue_depth(16)
            .set_cq_depth(128)
            .build();
        assert_eq!(receiver.ring_config(0).get_cq_depth(), 128);
    }
}
