//! Inbound Connection Listener
//!
//! Accepts peer connections and runs one decode loop per connection. The
//! first frame must arrive within the initial read deadline; after each
//! decoded frame the deadline resets to the idle deadline. Heartbeat
//! requests are echoed straight back; every other frame goes through the
//! shared [`MessageRouter`]. Each dispatched request is answered on the same
//! connection: code 0 with the request payload echoed on success, or
//! [`CODE_DISPATCH_FAILED`] with the error text.

use crate::cluster::StopSignal;
use crate::routing::MessageRouter;
use crate::transports::tcp;
use crate::{ClusterError, Result};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use trellis_codec::{Frame, ResponseFrame, CODE_DISPATCH_FAILED, CODE_OK};
use trellis_config::ClusterSettings;

/// Deadlines and limits applied to each inbound connection
#[derive(Debug, Clone, Copy)]
struct ConnectionLimits {
    initial_timeout: Duration,
    idle_timeout: Duration,
    max_frame_size: usize,
}

/// TCP listener serving peer connections
pub struct Listener {
    local_addr: SocketAddr,
    router: Arc<MessageRouter>,
    stop: StopSignal,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    connections: Arc<Mutex<Vec<JoinHandle<()>>>>,
    live: Arc<AtomicUsize>,
}

/// Decrements the live-connection count when a connection task ends
struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Listener {
    /// Bind `addr` (use port 0 for an ephemeral port) and start accepting
    pub async fn bind(
        addr: &str,
        router: Arc<MessageRouter>,
        settings: &ClusterSettings,
    ) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ClusterError::connection_with_source("Failed to bind listener", addr, e))?;
        let local_addr = listener.local_addr()?;

        let limits = ConnectionLimits {
            initial_timeout: settings.listener_initial_timeout(),
            idle_timeout: settings.listener_idle_timeout(),
            max_frame_size: settings.max_frame_size,
        };

        let this = Arc::new(Self {
            local_addr,
            router,
            stop: StopSignal::new(),
            accept_task: Mutex::new(None),
            connections: Arc::new(Mutex::new(Vec::new())),
            live: Arc::new(AtomicUsize::new(0)),
        });

        let task = tokio::spawn(Self::accept_loop(this.clone(), listener, limits));
        *this.accept_task.lock() = Some(task);

        info!(addr = %local_addr, "Cluster listener started");
        Ok(this)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    /// Number of inbound connections currently being served
    pub fn connection_count(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Stop accepting, close every live connection and wait for their tasks
    ///
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        if !self.stop.stop() {
            return;
        }

        let accept = self.accept_task.lock().take();
        if let Some(task) = accept {
            let _ = task.await;
        }

        let handles: Vec<_> = std::mem::take(&mut *self.connections.lock());
        futures::future::join_all(handles).await;

        info!(addr = %self.local_addr, "Cluster listener stopped");
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, limits: ConnectionLimits) {
        loop {
            let accepted = tokio::select! {
                _ = self.stop.wait() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }
                    debug!(peer = %peer, "Accepted peer connection");

                    self.live.fetch_add(1, Ordering::AcqRel);
                    let guard = LiveGuard(self.live.clone());
                    let task = tokio::spawn(serve_connection(
                        stream,
                        peer,
                        self.router.clone(),
                        self.stop.clone(),
                        limits,
                        guard,
                    ));

                    let mut connections = self.connections.lock();
                    connections.retain(|handle| !handle.is_finished());
                    connections.push(task);
                }
                Err(e) => {
                    warn!(addr = %self.local_addr, error = %e, "Accept failed");
                    // Pause before the next accept after an error
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
        debug!(addr = %self.local_addr, "Accept loop exited");
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    router: Arc<MessageRouter>,
    stop: StopSignal,
    limits: ConnectionLimits,
    _live: LiveGuard,
) {
    let (mut reader, mut writer) = stream.split();
    let mut deadline = limits.initial_timeout;

    loop {
        let frame = tokio::select! {
            _ = stop.wait() => break,
            frame = tcp::recv_frame(&mut reader, limits.max_frame_size, Some(deadline)) => frame,
        };

        let frame = match frame {
            Ok(frame) => frame,
            Err(ClusterError::Protocol(e)) if e.is_eof() => {
                debug!(peer = %peer, "Peer closed connection");
                break;
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "Closing connection after read failure");
                break;
            }
        };
        deadline = limits.idle_timeout;

        let reply = match frame {
            Frame::Request(request) if request.is_heartbeat() => {
                Some(ResponseFrame::heartbeat_reply(&request))
            }
            Frame::Request(request) => Some(match router.dispatch_request(&request) {
                Ok(()) => ResponseFrame::reply_to(&request, CODE_OK, request.payload.clone()),
                Err(e) => {
                    warn!(
                        peer = %peer,
                        module = request.module,
                        cmd = request.cmd,
                        error = %e,
                        "Request dispatch failed"
                    );
                    ResponseFrame::reply_to(&request, CODE_DISPATCH_FAILED, e.to_string())
                }
            }),
            Frame::Response(response) if response.is_heartbeat() => None,
            Frame::Response(response) => {
                if let Err(e) = router.dispatch_response(&response) {
                    warn!(
                        peer = %peer,
                        module = response.module,
                        cmd = response.cmd,
                        error = %e,
                        "Response dispatch failed"
                    );
                }
                None
            }
        };

        let Some(reply) = reply else {
            continue;
        };
        let frame = Frame::Response(reply);
        let sent = tokio::select! {
            _ = stop.wait() => break,
            sent = tcp::send_frame(&mut writer, &frame) => sent,
        };
        if let Err(e) = sent {
            warn!(peer = %peer, error = %e, "Failed to write reply");
            break;
        }
    }
}
