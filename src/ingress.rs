//! Socket ingress: a priority-boosted UDP receive worker that filters
//! datagrams by RTP payload type and pushes them into the streaming source.
//!
//! The worker never blocks on downstream: when the `appsrc` pending-byte
//! level rises past a watermark the datagram is dropped, and a push that the
//! source rejects is logged and forgotten.

use crate::error::{Error, Result};
use gstreamer::prelude::*;
use gstreamer_app::AppSrc;
use socket2::{Domain, Protocol, Socket, Type};
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Largest datagram the receiver accepts.
pub const UDP_MAX_PACKET: usize = 4 * 1024;
/// Kernel receive buffer requested on the socket.
pub const UDP_RCVBUF_BYTES: usize = 8 * 1024 * 1024;
/// Pending-byte watermark above which incoming datagrams are dropped.
pub const APPSRC_LEVEL_MAX: u64 = 8 * 1024 * 1024;

const POOL_MIN_BUFFERS: u32 = 8;
const POOL_MAX_BUFFERS: u32 = 32;

/// Datagram counters kept by the receive worker.
#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    dropped: AtomicU64,
}

/// Snapshot of the receive worker's datagram counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IngressStats {
    /// Datagrams read off the socket, including ones later dropped.
    pub received: u64,
    /// Datagrams dropped by the filter, the level gate or allocation
    /// failures.
    pub dropped: u64,
}

/// UDP receive worker feeding the streaming source.
#[derive(Debug)]
pub struct UdpReceiver {
    udp_port: u16,
    vid_pt: i32,
    appsrc: AppSrc,
    stop: Arc<AtomicBool>,
    counters: Arc<Counters>,
    socket: Option<Socket>,
    worker: Option<thread::JoinHandle<()>>,
}

impl UdpReceiver {
    /// Creates a receiver for `udp_port` that forwards datagrams matching
    /// `vid_pt` into `appsrc`. A negative `vid_pt` accepts every payload
    /// type.
    #[must_use]
    pub fn new(udp_port: u16, vid_pt: i32, appsrc: AppSrc) -> Self {
        Self {
            udp_port,
            vid_pt,
            appsrc,
            stop: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Counters::default()),
            socket: None,
            worker: None,
        }
    }

    /// Binds the socket and spawns the receive worker. Calling this on a
    /// running receiver is a no-op.
    pub fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        self.stop.store(false, Ordering::Release);

        let socket = bind_socket(self.udp_port)?;
        let worker_socket: UdpSocket = socket
            .try_clone()
            .map_err(Error::SocketSetup)?
            .into();

        let vid_pt = self.vid_pt;
        let appsrc = self.appsrc.clone();
        let stop = Arc::clone(&self.stop);
        let counters = Arc::clone(&self.counters);
        let worker = thread::Builder::new()
            .name("udp-receiver".into())
            .spawn(move || receive_loop(&worker_socket, vid_pt, &appsrc, &stop, &counters))
            .map_err(Error::ThreadSpawn)?;

        self.socket = Some(socket);
        self.worker = Some(worker);
        Ok(())
    }

    /// Signals the worker, kicks the socket to unblock it and joins.
    /// Idempotent.
    pub fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.stop.store(true, Ordering::Release);
            if let Some(socket) = &self.socket {
                let _ = socket.shutdown(std::net::Shutdown::Both);
            }
            let _ = worker.join();
        }
        self.socket = None;
    }

    /// Port the socket is actually bound to, once started. Differs from the
    /// configured port when that was 0.
    #[must_use]
    pub fn local_port(&self) -> Option<u16> {
        let addr = self.socket.as_ref()?.local_addr().ok()?;
        Some(addr.as_socket()?.port())
    }

    /// Snapshot of the datagram counters.
    #[must_use]
    pub fn stats(&self) -> IngressStats {
        IngressStats {
            received: self.counters.received.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Drop for UdpReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bind_socket(udp_port: u16) -> Result<Socket> {
    let socket =
        Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(Error::SocketSetup)?;
    if let Err(err) = socket.set_reuse_address(true) {
        tracing::warn!("UDP receiver: SO_REUSEADDR failed: {err}");
    }
    if let Err(err) = socket.set_recv_buffer_size(UDP_RCVBUF_BYTES) {
        tracing::warn!("UDP receiver: SO_RCVBUF failed: {err}");
    }
    socket.set_nonblocking(true).map_err(Error::SocketSetup)?;
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, udp_port);
    socket.bind(&addr.into()).map_err(Error::SocketSetup)?;
    Ok(socket)
}

fn receive_loop(
    socket: &UdpSocket,
    vid_pt: i32,
    appsrc: &AppSrc,
    stop: &AtomicBool,
    counters: &Counters,
) {
    boost_receive_priority();

    let pool = match build_buffer_pool() {
        Ok(pool) => Some(pool),
        Err(err) => {
            tracing::warn!("UDP receiver: buffer pool unavailable: {err}");
            None
        }
    };

    let mut scratch = [0u8; UDP_MAX_PACKET];
    loop {
        if stop.load(Ordering::Acquire) {
            break;
        }

        let len = match socket.recv(&mut scratch) {
            Ok(len) => len,
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                thread::sleep(Duration::from_millis(1));
                continue;
            }
            Err(err) => {
                tracing::warn!("UDP receiver: recv failed: {err}");
                continue;
            }
        };
        // The stop kick shuts the socket down to unblock recv; those
        // wakeups are not datagrams.
        if stop.load(Ordering::Acquire) {
            break;
        }
        counters.received.fetch_add(1, Ordering::Relaxed);
        if len == 0 {
            counters.dropped.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        if !payload_type_matches(&scratch[..len], vid_pt) {
            counters.dropped.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        // Manual leak: if the appsrc is backed up, drop this datagram so the
        // producer never waits.
        if appsrc.current_level_bytes() > APPSRC_LEVEL_MAX {
            counters.dropped.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        let Some(mut buffer) = acquire_buffer(pool.as_ref(), len) else {
            counters.dropped.fetch_add(1, Ordering::Relaxed);
            continue;
        };
        {
            let buffer = buffer.get_mut().unwrap();
            match buffer.map_writable() {
                Ok(mut map) => {
                    if map.len() < len {
                        tracing::warn!(
                            capacity = map.len(),
                            needed = len,
                            "UDP receiver: dropping packet (buffer too small)"
                        );
                        counters.dropped.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    map.as_mut_slice()[..len].copy_from_slice(&scratch[..len]);
                }
                Err(err) => {
                    tracing::warn!("UDP receiver: failed to map buffer: {err}");
                    counters.dropped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            }
            buffer.set_size(len);
        }

        // Ownership transfers on push even when the source rejects it.
        if let Err(flow) = appsrc.push_buffer(buffer) {
            tracing::debug!("UDP receiver: appsrc push returned {flow:?}");
        }
    }

    if let Some(pool) = pool {
        let _ = pool.set_active(false);
    }
}

fn acquire_buffer(pool: Option<&gstreamer::BufferPool>, len: usize) -> Option<gstreamer::Buffer> {
    if let Some(pool) = pool {
        match pool.acquire_buffer(None) {
            Ok(buffer) => return Some(buffer),
            Err(flow) => {
                tracing::warn!("UDP receiver: buffer pool acquisition failed: {flow:?}");
            }
        }
    }
    match gstreamer::Buffer::with_size(len) {
        Ok(buffer) => Some(buffer),
        Err(err) => {
            tracing::warn!("UDP receiver: dropping packet (allocation failed: {err})");
            None
        }
    }
}

fn build_buffer_pool() -> Result<gstreamer::BufferPool> {
    let pool = gstreamer::BufferPool::new();
    let mut config = pool.config();
    config.set_params(
        None,
        u32::try_from(UDP_MAX_PACKET).unwrap(),
        POOL_MIN_BUFFERS,
        POOL_MAX_BUFFERS,
    );
    pool.set_config(config)
        .map_err(|err| Error::Transient(format!("buffer pool config rejected: {err}")))?;
    pool.set_active(true)
        .map_err(|err| Error::Transient(format!("buffer pool activation failed: {err}")))?;
    Ok(pool)
}

/// The first two bytes carry the RTP header; bits 0..6 of byte 1 hold the
/// payload type.
fn payload_type_matches(data: &[u8], expected_pt: i32) -> bool {
    if expected_pt < 0 {
        return true;
    }
    if data.len() < 2 {
        return false;
    }
    i32::from(data[1] & 0x7f) == expected_pt
}

fn boost_receive_priority() {
    // Slightly higher than the AU consumer so ingest survives load spikes.
    let param = libc::sched_param { sched_priority: 12 };
    let rc = unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_RR, &param) };
    if rc != 0 {
        tracing::debug!("UDP receiver: SCHED_RR unavailable, falling back to nice(-12)");
        unsafe {
            libc::nice(-12);
        }
    }
}
