use std::io;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use zgate::inproc::{self, InprocSocket};
use zgate::prelude::*;
use zgate::{MonitorEvent, SocketType};

/// Inproc socket whose readiness query can be made to fail.
struct Flaky {
    inner: InprocSocket,
    broken: Arc<AtomicBool>,
}

impl RawSocket for Flaky {
    fn send(&mut self, frame: Bytes, flags: i32) -> io::Result<()> {
        self.inner.send(frame, flags)
    }

    fn recv(&mut self, flags: i32) -> io::Result<Bytes> {
        self.inner.recv(flags)
    }

    fn has_more(&mut self) -> io::Result<bool> {
        self.inner.has_more()
    }

    fn events(&mut self) -> io::Result<Events> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "readiness query failed"));
        }
        self.inner.events()
    }

    fn readiness_fd(&self) -> io::Result<OwnedFd> {
        self.inner.readiness_fd()
    }

    fn socket_type(&self) -> SocketType {
        self.inner.socket_type()
    }
}

fn monitor() -> Monitor {
    Monitor::spawn(MonitorConfig::new().with_thread_name("zgate-shared")).unwrap()
}

#[compio::test]
async fn test_sockets_share_one_monitor() {
    let monitor = monitor();
    let (a, b) = inproc::pair(8).unwrap();
    let a = AsyncSocket::with_monitor(a, monitor.clone(), SocketOptions::default());
    let b = AsyncSocket::with_monitor(b, monitor.clone(), SocketOptions::default());

    let guard_a = a.enter().unwrap();
    let _b = b.enter().unwrap();
    assert_eq!(monitor.len(), 2);
    assert!(monitor.is_registered(a.id()));

    a.asend(Bytes::from_static(b"shared"), 0).await.unwrap();
    assert_eq!(b.arecv(0).await.unwrap(), Bytes::from_static(b"shared"));

    guard_a.exit().unwrap();
    assert_eq!(monitor.len(), 1);
    assert!(monitor.is_running());

    // The remaining socket keeps being served.
    let late = compio::time::timeout(Duration::from_millis(30), b.arecv(0)).await;
    assert!(late.is_err());
    assert!(b.apoll(Events::WRITABLE, None).await.unwrap().is_writable());
}

#[compio::test]
async fn test_source_fault_is_isolated() {
    let monitor = monitor();
    let events = monitor.events();
    let broken = Arc::new(AtomicBool::new(false));

    let (x, _y) = inproc::pair(8).unwrap();
    let flaky = AsyncSocket::with_monitor(
        Flaky {
            inner: x,
            broken: Arc::clone(&broken),
        },
        monitor.clone(),
        SocketOptions::default(),
    );
    let (p, q) = inproc::pair(8).unwrap();
    let p = AsyncSocket::with_monitor(p, monitor.clone(), SocketOptions::default());
    let q = AsyncSocket::with_monitor(q, monitor.clone(), SocketOptions::default());
    let _flaky = flaky.enter().unwrap();
    let _p = p.enter().unwrap();
    let _q = q.enter().unwrap();

    broken.store(true, Ordering::SeqCst);
    let healthy_recv = q.arecv(0);
    let faulted_recv = flaky.arecv(0);
    let healthy_send = async {
        compio::time::sleep(Duration::from_millis(20)).await;
        p.asend(Bytes::from_static(b"unaffected"), 0).await.unwrap();
    };

    let (healthy, faulted, ()) = futures::join!(healthy_recv, faulted_recv, healthy_send);
    assert_eq!(healthy.unwrap(), Bytes::from_static(b"unaffected"));
    let err = faulted.unwrap_err();
    assert!(matches!(err, ZgateError::SourceFault(_)));
    assert!(err.is_connection_error());

    assert!(!monitor.is_registered(flaky.id()));
    assert!(monitor.is_running());
    let fault = events
        .drain()
        .find_map(|event| match event {
            MonitorEvent::SourceFault { id, .. } => Some(id),
            _ => None,
        });
    assert_eq!(fault, Some(flaky.id()));

    // Later waits on the faulted socket fail fast instead of hanging.
    assert!(matches!(flaky.arecv(0).await, Err(ZgateError::SourceFault(_))));
    assert_eq!(flaky.state(), SocketState::Faulted);
    assert!(p.fault().is_none());
}

#[compio::test]
async fn test_poll_fault_faults_every_socket() {
    let monitor = monitor();
    let (a, b) = inproc::pair(8).unwrap();
    let a = AsyncSocket::with_monitor(a, monitor.clone(), SocketOptions::default());
    let b = AsyncSocket::with_monitor(b, monitor.clone(), SocketOptions::default());
    let guard_a = a.enter().unwrap();
    let _b = b.enter().unwrap();

    let recv = b.arecv(0);
    let fail = async {
        compio::time::sleep(Duration::from_millis(20)).await;
        monitor.abort("EINVAL");
    };
    let (suspended, ()) = futures::join!(recv, fail);
    assert!(matches!(suspended, Err(ZgateError::PollFault(_))));
    assert!(!monitor.is_running());

    // A send that would not need to wait is refused too.
    let err = a.asend(Bytes::from_static(b"after-fault"), 0).await.unwrap_err();
    assert!(matches!(err, ZgateError::PollFault(ref reason) if reason == "EINVAL"));
    assert_eq!(a.state(), SocketState::Faulted);
    assert!(matches!(a.fault(), Some(ZgateError::PollFault(_))));
    assert!(matches!(
        a.asend(Bytes::from_static(b"again"), DONTWAIT).await,
        Err(ZgateError::PollFault(_))
    ));
    assert!(matches!(
        a.apoll(Events::WRITABLE, Some(Duration::ZERO)).await,
        Err(ZgateError::PollFault(_))
    ));

    // Nothing reached the peer.
    assert!(b.recv(DONTWAIT).unwrap_err().is_would_block());

    guard_a.exit().unwrap();
    assert_eq!(a.state(), SocketState::Closed);
}

#[compio::test]
async fn test_dedicated_monitor_fault_is_reported() {
    let (a, _b) = inproc::pair(8).unwrap();
    let a = AsyncSocket::new(a);
    let _a = a.enter().unwrap();

    a.monitor().unwrap().abort("EBADF");
    assert!(matches!(a.arecv(0).await, Err(ZgateError::PollFault(_))));
    assert_eq!(a.state(), SocketState::Faulted);
    assert!(a.monitor().is_none());
    assert!(matches!(a.start(), Err(ZgateError::AlreadyStarted)));
}

#[compio::test]
async fn test_monitor_shutdown_releases_sockets() {
    let monitor = monitor();
    let (a, _b) = inproc::pair(8).unwrap();
    let a = AsyncSocket::with_monitor(a, monitor.clone(), SocketOptions::default());
    let _a = a.enter().unwrap();

    let recv = a.arecv(0);
    let stop = async {
        compio::time::sleep(Duration::from_millis(20)).await;
        monitor.shutdown();
    };
    let (result, ()) = futures::join!(recv, stop);
    assert!(matches!(result, Err(ZgateError::SocketClosed)));

    // A stopped monitor refuses new sockets.
    let (c, _d) = inproc::pair(8).unwrap();
    let c = AsyncSocket::with_monitor(c, monitor.clone(), SocketOptions::default());
    assert!(matches!(c.start(), Err(ZgateError::MonitorStopped)));
    assert_eq!(c.state(), SocketState::Unstarted);
}
