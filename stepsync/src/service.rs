//! Reference service: the replying side of the handshake.
//!
//! The service answers `"start"` with `"started"` and then simulates a task
//! by sleeping for the configured duration, during which it does not read
//! requests. `"notify_completion"` is answered with `"completed"` and
//! anything else with `"error"`. Pairing of the two requests is not checked.
//!
//! The simulated work sleeps in short slices so that a stop request is
//! honoured within one slice.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use minstant::Instant;
use thiserror::Error;

use crate::config::SERVICE_POLL_INTERVAL;
use crate::net::{AddressError, Incoming, RepSocket, ServiceAddress, SocketError};
use crate::protocol::{Reply, Request};
use crate::trace::{debug, error, info, warn};

/// Simulated task length when none is given.
pub const DEFAULT_SERVICE_TIME: Duration = Duration::from_secs(1);

/// Longest uninterrupted sleep while simulating work.
const WORK_SLICE: Duration = Duration::from_millis(10);

/// Reference service failure.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid bind address: {0}")]
    Address(#[from] AddressError),
    #[error("service transport failed: {0}")]
    Socket(#[from] SocketError),
    #[error("service time must be a finite, non-negative number of seconds (got {0})")]
    InvalidServiceTime(f64),
    #[error("failed to spawn service thread: {0}")]
    Spawn(io::Error),
    #[error("service thread panicked")]
    Panicked,
}

/// A bound reference service.
pub struct ReferenceService {
    socket: RepSocket,
    work: Duration,
    handled: u64,
}

impl ReferenceService {
    /// Binds the service. Port 0 picks an ephemeral port.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Socket`] if the address cannot be bound.
    pub fn bind(addr: ServiceAddress, work: Duration) -> Result<Self, ServiceError> {
        let socket = RepSocket::bind(addr).inspect_err(|_e| {
            error!(address = %addr, error = %_e, "failed to bind reference service");
        })?;
        info!(address = %socket.local_address(), work = ?work, "reference service bound");
        Ok(Self {
            socket,
            work,
            handled: 0,
        })
    }

    /// The bound address, with the ephemeral port resolved.
    #[must_use]
    pub const fn local_address(&self) -> ServiceAddress {
        self.socket.local_address()
    }

    /// Number of requests answered so far.
    #[must_use]
    pub const fn handled(&self) -> u64 {
        self.handled
    }

    /// Serves requests until `stop` is set.
    ///
    /// # Errors
    ///
    /// Returns an error only if the listener itself fails; per-peer failures
    /// are logged and the peer is dropped.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<(), ServiceError> {
        while !stop.load(Ordering::Relaxed) {
            self.serve_once(stop)?;
        }
        info!(handled = self.handled, "reference service stopped");
        Ok(())
    }

    /// Waits up to [`SERVICE_POLL_INTERVAL`] for one request and answers it.
    ///
    /// Returns whether a request was handled.
    ///
    /// # Errors
    ///
    /// Same as [`run`](Self::run).
    pub fn serve_once(&mut self, stop: &AtomicBool) -> Result<bool, ServiceError> {
        let Some(Incoming { peer, payload }) = self.socket.recv_timeout(SERVICE_POLL_INTERVAL)?
        else {
            return Ok(false);
        };
        let request = Request::parse(&payload);
        let reply = match request {
            Request::Start => Reply::Started,
            Request::NotifyCompletion => Reply::Completed,
            Request::Other(_) => Reply::Error,
        };
        debug!(peer = ?peer, request = %request, reply = %reply, "request received");

        if let Err(_e) = self.socket.reply(peer, reply.as_str().as_bytes()) {
            warn!(peer = ?peer, error = %_e, "reply failed, peer dropped");
        }
        self.handled += 1;

        if request == Request::Start {
            info!(work = ?self.work, "task started");
            simulate_work(self.work, stop);
            info!("task finished");
        }
        Ok(true)
    }

    /// Runs the service on a background thread.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails or the thread cannot be spawned.
    pub fn spawn(addr: ServiceAddress, work: Duration) -> Result<ServiceHandle, ServiceError> {
        let mut service = Self::bind(addr, work)?;
        let address = service.local_address();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name("stepsync-service".into())
            .spawn(move || service.run(&thread_stop))
            .map_err(ServiceError::Spawn)?;

        Ok(ServiceHandle {
            address,
            stop,
            handle: Some(handle),
        })
    }
}

/// Handle to a service running on a background thread.
///
/// Dropping the handle signals the service to stop but does not wait for it.
/// Use [`ServiceHandle::shutdown`] to stop and join.
pub struct ServiceHandle {
    address: ServiceAddress,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<Result<(), ServiceError>>>,
}

impl ServiceHandle {
    /// Address clients should connect to.
    ///
    /// A wildcard bind is reported as the loopback address on the same port.
    #[must_use]
    pub fn address(&self) -> ServiceAddress {
        if self.address.as_socket_addr().ip().is_unspecified() {
            ServiceAddress::localhost(self.address.port())
        } else {
            self.address
        }
    }

    /// Stops the service and waits for its thread.
    ///
    /// # Errors
    ///
    /// Returns the error the service loop ended with, or
    /// [`ServiceError::Panicked`].
    pub fn shutdown(mut self) -> Result<(), ServiceError> {
        debug!(address = %self.address, "reference service shutdown requested");
        self.stop.store(true, Ordering::Relaxed);
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| ServiceError::Panicked)?,
            None => Ok(()),
        }
    }
}

impl Drop for ServiceHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

/// Binds to `address` and serves forever with a task length of `seconds`.
///
/// # Errors
///
/// Returns an error if the arguments are invalid, binding fails, or the
/// listener fails while serving.
pub fn service_main(address: &str, seconds: f64) -> Result<(), ServiceError> {
    let work =
        Duration::try_from_secs_f64(seconds).map_err(|_| ServiceError::InvalidServiceTime(seconds))?;
    let addr = ServiceAddress::parse(address)?;
    let never = AtomicBool::new(false);
    ReferenceService::bind(addr, work)?.run(&never)
}

fn simulate_work(work: Duration, stop: &AtomicBool) {
    let deadline = Instant::now() + work;
    loop {
        if stop.load(Ordering::Relaxed) {
            debug!("task interrupted by shutdown");
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep(deadline.saturating_duration_since(now).min(WORK_SLICE));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::ReqSocket;

    fn roundtrip(client: &mut ReqSocket, request: &str) -> String {
        client.send(request.as_bytes()).unwrap();
        let payload = client
            .try_recv(Duration::from_secs(5))
            .unwrap()
            .expect("reply within 5s");
        String::from_utf8(payload).unwrap()
    }

    #[test]
    fn answers_protocol_requests() {
        let service =
            ReferenceService::spawn(ServiceAddress::localhost(0), Duration::from_millis(50)).unwrap();
        let mut client = ReqSocket::connect(service.address()).unwrap();

        let started = Instant::now();
        assert_eq!(roundtrip(&mut client, "start"), "started");
        assert_eq!(roundtrip(&mut client, "notify_completion"), "completed");
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(roundtrip(&mut client, "bogus"), "error");

        service.shutdown().unwrap();
    }

    #[test]
    fn serve_once_counts_answered_requests() {
        let stop = AtomicBool::new(false);
        let mut service =
            ReferenceService::bind(ServiceAddress::localhost(0), Duration::ZERO).unwrap();
        let mut client = ReqSocket::connect(service.local_address()).unwrap();
        assert!(!service.serve_once(&stop).unwrap(), "nothing sent yet");
        assert_eq!(service.handled(), 0);

        client.send(b"start").unwrap();
        let mut answered = false;
        for _ in 0..50 {
            assert_eq!(client.try_recv(Duration::ZERO).unwrap(), None);
            if service.serve_once(&stop).unwrap() {
                answered = true;
                break;
            }
        }
        assert!(answered);
        assert_eq!(service.handled(), 1);
        assert_eq!(
            client.try_recv(Duration::from_secs(1)).unwrap().as_deref(),
            Some(&b"started"[..])
        );
    }

    #[test]
    fn shutdown_interrupts_simulated_work() {
        let service =
            ReferenceService::spawn(ServiceAddress::localhost(0), Duration::from_secs(30)).unwrap();
        let mut client = ReqSocket::connect(service.address()).unwrap();
        assert_eq!(roundtrip(&mut client, "start"), "started");

        let begun = Instant::now();
        service.shutdown().unwrap();
        assert!(begun.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn wildcard_bind_reports_loopback() {
        let service = ReferenceService::spawn(ServiceAddress::any(0), Duration::ZERO).unwrap();
        let address = service.address();
        assert!(address.as_socket_addr().ip().is_loopback());
        assert_ne!(address.port(), 0);
        service.shutdown().unwrap();
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(matches!(
            service_main("tcp://127.0.0.1:0", -1.0),
            Err(ServiceError::InvalidServiceTime(_))
        ));
        assert!(matches!(
            service_main("127.0.0.1:0", 1.0),
            Err(ServiceError::Address(_))
        ));
    }

    #[test]
    fn bind_conflict_is_an_error() {
        let first = ReferenceService::bind(ServiceAddress::localhost(0), Duration::ZERO).unwrap();
        let taken = first.local_address();
        assert!(matches!(
            ReferenceService::bind(taken, Duration::ZERO),
            Err(ServiceError::Socket(_))
        ));
    }
}
