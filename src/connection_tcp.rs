// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! TCP transport for BGP connections. Handles the socket options the session
//! engine asks for (TCP MD5 signatures, TTL, TOS Internetwork Control,
//! receive/transmit buffer sizes) and runs the reader thread that feeds
//! messages into a peer's event channel. Byte framing is delegated to the
//! wire codec carried in the connection context.

use crate::codec::{WireCodec, WireError};
use crate::connection::{BgpConnection, BgpListener, ConnDirection, SockOpts};
use crate::error::Error;
use crate::lock;
use crate::messages::Message;
use crate::session::FsmEvent;
use crate::canonical_peer_addr;
use libc::{c_int, c_void, sockaddr_storage, IPPROTO_IP, IPPROTO_TCP};
use slog::{error, info, trace, warn, Logger};
use std::io::Write;
use std::net::{IpAddr, Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::{sleep, spawn};
use std::time::{Duration, Instant};

#[cfg(target_os = "linux")]
use libc::TCP_MD5SIG;

pub const MAX_MD5SIG_KEYLEN: usize = 80;

const ACCEPT_POLL: Duration = Duration::from_millis(10);

#[derive(Clone)]
pub struct BgpConnectionTcp {
    peer: SocketAddr,
    opts: SockOpts,
    wire: Arc<dyn WireCodec>,
    conn: Arc<Mutex<Option<TcpStream>>>,
    rx_attached: Arc<AtomicBool>,
    log: Logger,
}

impl BgpConnection for BgpConnectionTcp {
    type Ctx = Arc<dyn WireCodec>;

    fn new_outgoing(peer: SocketAddr, opts: SockOpts, ctx: Self::Ctx, log: Logger) -> Self {
        Self {
            peer,
            opts,
            wire: ctx,
            conn: Arc::new(Mutex::new(None)),
            rx_attached: Arc::new(AtomicBool::new(false)),
            log,
        }
    }

    fn connect(&self, event_tx: Sender<FsmEvent<Self>>, timeout: Duration) {
        let this = self.clone();
        spawn(move || {
            if let Err(e) = this.connect_blocking(timeout) {
                error!(this.log, "connect to {} failed: {e}", this.peer);
                let errno = match e {
                    Error::Io(ref io) => io.raw_os_error().unwrap_or(0),
                    _ => 0,
                };
                let _ = event_tx.send(FsmEvent::SocketError {
                    dir: ConnDirection::Outgoing,
                    errno,
                });
                return;
            }
            let _ = event_tx.send(FsmEvent::ConnectionConfirmed);
        });
    }

    fn send(&self, msg: Message) -> Result<(), Error> {
        let guard = lock!(self.conn);
        match guard.as_ref() {
            Some(stream) => {
                let mut w = stream;
                self.wire.write_message(&mut w as &mut dyn Write, &msg)
            }
            None => Err(Error::NotConnected),
        }
    }

    fn set_rx_hook(&self, dir: ConnDirection, event_tx: Sender<FsmEvent<Self>>) {
        let stream = match lock!(self.conn).as_ref().map(|s| s.try_clone()) {
            Some(Ok(s)) => s,
            Some(Err(e)) => {
                warn!(self.log, "rx hook: clone stream: {e}");
                return;
            }
            None => return,
        };
        self.rx_attached.store(true, Ordering::Release);
        let attached = self.rx_attached.clone();
        let wire = self.wire.clone();
        let peer = self.peer;
        let log = self.log.clone();
        spawn(move || {
            let mut stream = stream;
            loop {
                if !attached.load(Ordering::Acquire) {
                    break;
                }
                match wire.read_message(&mut stream) {
                    Ok(msg) => {
                        trace!(log, "[{peer}] recv: {}", msg.title());
                        if event_tx.send(FsmEvent::Message { dir, msg }).is_err() {
                            break;
                        }
                    }
                    Err(WireError::Protocol(e)) => {
                        let _ = event_tx.send(FsmEvent::ProtocolError { dir, error: e });
                        break;
                    }
                    Err(WireError::Io(e)) => {
                        if attached.load(Ordering::Acquire) {
                            let _ = event_tx.send(FsmEvent::SocketError {
                                dir,
                                errno: e.raw_os_error().unwrap_or(0),
                            });
                        }
                        break;
                    }
                }
            }
        });
    }

    fn clear_rx_hook(&self) {
        self.rx_attached.store(false, Ordering::Release);
        // Unblock a reader parked in read(); transmit stays usable so a
        // queued Notification can still go out.
        if let Some(stream) = lock!(self.conn).as_ref() {
            let _ = stream.shutdown(Shutdown::Read);
        }
    }

    fn rx_pending(&self) -> bool {
        let guard = lock!(self.conn);
        let Some(stream) = guard.as_ref() else {
            return false;
        };
        let mut pending: c_int = 0;
        let rv = unsafe { libc::ioctl(stream.as_raw_fd(), libc::FIONREAD as _, &mut pending) };
        rv == 0 && pending > 0
    }

    fn set_ttl(&self, ttl: u8) -> Result<(), Error> {
        let guard = lock!(self.conn);
        match guard.as_ref() {
            Some(stream) => {
                stream.set_ttl(u32::from(ttl))?;
                Ok(())
            }
            None => Err(Error::NotConnected),
        }
    }

    fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn local(&self) -> Option<SocketAddr> {
        lock!(self.conn).as_ref().and_then(|s| s.local_addr().ok())
    }
}

impl BgpConnectionTcp {
    fn with_conn(
        peer: SocketAddr,
        conn: TcpStream,
        wire: Arc<dyn WireCodec>,
        log: Logger,
    ) -> Self {
        Self {
            peer,
            opts: SockOpts::default(),
            wire,
            conn: Arc::new(Mutex::new(Some(conn))),
            rx_attached: Arc::new(AtomicBool::new(false)),
            log,
        }
    }

    fn connect_blocking(&self, timeout: Duration) -> Result<(), Error> {
        let domain = match self.peer {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        };
        let s = socket2::Socket::new(domain, socket2::Type::STREAM, None)?;

        if let Some(source) = self.opts.source {
            s.bind(&source.into())?;
        }
        s.set_recv_buffer_size(self.opts.rx_buffer)?;
        s.set_send_buffer_size(self.opts.tx_buffer)?;
        s.set_ttl(u32::from(self.opts.ttl))?;
        set_tos_fd(s.as_raw_fd(), self.peer, self.opts.tos)?;

        #[cfg(target_os = "linux")]
        if let Some(ref key) = self.opts.md5_key {
            let mut keyval = [0u8; MAX_MD5SIG_KEYLEN];
            let len = key.len().min(MAX_MD5SIG_KEYLEN);
            keyval[..len].copy_from_slice(&key.as_bytes()[..len]);
            set_md5_sig_fd(s.as_raw_fd(), len as u16, keyval, self.peer)?;
        }

        let sa: socket2::SockAddr = self.peer.into();
        s.connect_timeout(&sa, timeout)?;
        let stream: TcpStream = s.into();
        info!(self.log, "connected to {}", self.peer);
        lock!(self.conn).replace(stream);
        Ok(())
    }
}

pub struct BgpListenerTcp {
    addr: SocketAddr,
    listener: TcpListener,
    wire: Arc<dyn WireCodec>,
    log: Logger,
}

impl BgpListener<BgpConnectionTcp> for BgpListenerTcp {
    fn bind(addr: &str, ctx: Arc<dyn WireCodec>, log: Logger) -> Result<Self, Error> {
        let addr = addr
            .to_socket_addrs()
            .map_err(|e| Error::InvalidAddress(e.to_string()))?
            .next()
            .ok_or(Error::InvalidAddress("at least one address required".into()))?;
        let domain = match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        };
        let s = socket2::Socket::new(domain, socket2::Type::STREAM, None)?;
        s.set_reuse_address(true)?;
        set_tos_fd(s.as_raw_fd(), addr, crate::connection::TOS_INTERNET_CONTROL)?;
        s.bind(&addr.into())?;
        s.listen(128)?;
        let listener: TcpListener = s.into();
        listener.set_nonblocking(true)?;
        Ok(Self {
            addr,
            listener,
            wire: ctx,
            log,
        })
    }

    fn accept(&self, timeout: Duration) -> Result<BgpConnectionTcp, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.listener.accept() {
                Ok((stream, mut peer)) => {
                    stream.set_nonblocking(false)?;
                    let ip = canonical_peer_addr(peer.ip());
                    peer.set_ip(ip);
                    trace!(self.log, "accepted connection from {peer} on {}", self.addr);
                    return Ok(BgpConnectionTcp::with_conn(
                        peer,
                        stream,
                        self.wire.clone(),
                        self.log.clone(),
                    ));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(Error::Timeout);
                    }
                    sleep(ACCEPT_POLL);
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    #[cfg(target_os = "linux")]
    fn set_md5_key(&self, peer: IpAddr, key: Option<&str>) -> Result<(), Error> {
        let mut keyval = [0u8; MAX_MD5SIG_KEYLEN];
        let len = match key {
            Some(k) => {
                let len = k.len().min(MAX_MD5SIG_KEYLEN);
                keyval[..len].copy_from_slice(&k.as_bytes()[..len]);
                len
            }
            // Zero length removes the key.
            None => 0,
        };
        let peer_sa = SocketAddr::new(peer, 0);
        set_md5_sig_fd(self.listener.as_raw_fd(), len as u16, keyval, peer_sa)
    }

    #[cfg(not(target_os = "linux"))]
    fn set_md5_key(&self, _peer: IpAddr, _key: Option<&str>) -> Result<(), Error> {
        warn!(
            self.log,
            "tcp md5 signatures are not supported on this platform"
        );
        Err(Error::Md5Auth("unsupported platform".into()))
    }
}

fn set_tos_fd(fd: i32, addr: SocketAddr, tos: u32) -> Result<(), Error> {
    let (level, option) = match addr {
        SocketAddr::V4(_) => (IPPROTO_IP, libc::IP_TOS),
        SocketAddr::V6(_) => (libc::IPPROTO_IPV6, libc::IPV6_TCLASS),
    };
    unsafe {
        if libc::setsockopt(
            fd,
            level,
            option,
            &tos as *const u32 as *const c_void,
            std::mem::size_of::<u32>() as u32,
        ) != 0
        {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn set_md5_sig_fd(
    fd: i32,
    keylen: u16,
    key: [u8; MAX_MD5SIG_KEYLEN],
    peer: SocketAddr,
) -> Result<(), Error> {
    let mut sig = TcpMd5Sig {
        tcpm_keylen: keylen,
        tcpm_key: key,
        ..Default::default()
    };
    let sa = socket2::SockAddr::from(peer);
    unsafe {
        std::ptr::copy_nonoverlapping(
            sa.as_ptr() as *const u8,
            &mut sig.tcpm_addr as *mut sockaddr_storage as *mut u8,
            sa.len() as usize,
        );
    }
    unsafe {
        if libc::setsockopt(
            fd,
            IPPROTO_TCP,
            TCP_MD5SIG,
            &sig as *const TcpMd5Sig as *const c_void,
            std::mem::size_of::<TcpMd5Sig>() as u32,
        ) != 0
        {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}

#[cfg(target_os = "linux")]
#[repr(C)]
struct TcpMd5Sig {
    tcpm_addr: sockaddr_storage,
    tcpm_flags: u8,
    tcpm_prefixlen: u8,
    tcpm_keylen: u16,
    tcpm_ifindex: c_int,
    tcpm_key: [u8; MAX_MD5SIG_KEYLEN],
}

#[cfg(target_os = "linux")]
impl Default for TcpMd5Sig {
    fn default() -> Self {
        unsafe { std::mem::zeroed() }
    }
}
