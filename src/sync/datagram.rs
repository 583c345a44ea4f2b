//! UDP transport for OSC packets.
//!
//! One socket is bound to an ephemeral local port. Outbound messages go out
//! of it, and a [`DatagramReceiver`] thread reads from a clone of it so that
//! remotes replying to the sender's address are heard.

use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};

use crate::constants;
use crate::osc::OscMessage;

/// Bound UDP socket used for OSC traffic.
#[derive(Debug)]
pub struct OscSocket {
    socket: UdpSocket,
}

impl OscSocket {
    /// Bind to `0.0.0.0` on an ephemeral port.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound.
    pub fn bind() -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").context("Failed to bind OSC socket")?;
        Ok(Self { socket })
    }

    /// Local address of the socket.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    /// Encode `message` and send it to `host:port`.
    ///
    /// # Errors
    ///
    /// Returns an error if the host cannot be resolved or the send fails.
    pub fn send(&self, message: &OscMessage, host: &str, port: u16) -> Result<()> {
        let target = (host, port)
            .to_socket_addrs()
            .with_context(|| format!("Cannot resolve {host}:{port}"))?
            .find(SocketAddr::is_ipv4)
            .with_context(|| format!("No IPv4 address for {host}:{port}"))?;
        self.socket
            .send_to(&message.encode(), target)
            .with_context(|| format!("Failed to send {} to {target}", message.address))?;
        Ok(())
    }

    /// Start a receiver thread on a clone of this socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be cloned or configured.
    pub fn spawn_receiver<F>(&self, on_datagram: F) -> Result<DatagramReceiver>
    where
        F: Fn(&[u8], SocketAddr) + Send + 'static,
    {
        let socket = self.socket.try_clone().context("Failed to clone OSC socket")?;
        socket
            .set_read_timeout(Some(constants::WORKER_POLL_INTERVAL))
            .context("Failed to set OSC socket timeout")?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = Arc::clone(&shutdown);
        let handle = thread::Builder::new()
            .name("osc-receiver".to_string())
            .spawn(move || receive_loop(&socket, &shutdown_clone, &on_datagram))
            .context("Failed to spawn OSC receiver thread")?;

        Ok(DatagramReceiver {
            shutdown,
            thread_handle: Some(handle),
        })
    }
}

fn receive_loop(socket: &UdpSocket, shutdown: &AtomicBool, on_datagram: &dyn Fn(&[u8], SocketAddr)) {
    let mut buf = vec![0u8; constants::MAX_DATAGRAM_SIZE];
    log::debug!("OSC receiver started");

    while !shutdown.load(Ordering::SeqCst) {
        match socket.recv_from(&mut buf) {
            Ok((len, from)) => on_datagram(&buf[..len], from),
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) => {}
            Err(e) => {
                // ICMP port-unreachable from earlier sends surfaces here on some platforms
                log::debug!("OSC receive error: {e}");
            }
        }
    }

    log::debug!("OSC receiver shutting down");
}

/// Handle to the receiver thread. Stops and joins on drop.
#[derive(Debug)]
pub struct DatagramReceiver {
    shutdown: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl DatagramReceiver {
    /// Request shutdown; the thread exits within one poll interval.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

impl Drop for DatagramReceiver {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::osc::{decode_packet, OscArg, OscPacket};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_send_reaches_peer() {
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let port = peer.local_addr().unwrap().port();

        let socket = OscSocket::bind().unwrap();
        let message = OscMessage::with_args("/a/b", vec![OscArg::Int(3)]);
        socket.send(&message, "127.0.0.1", port).unwrap();

        let mut buf = [0u8; 256];
        let (len, _) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(decode_packet(&buf[..len]).unwrap(), OscPacket::Message(message));
    }

    #[test]
    fn test_receiver_hears_replies_to_sender_port() {
        let socket = OscSocket::bind().unwrap();
        let (tx, rx) = mpsc::channel();
        let receiver = socket
            .spawn_receiver(move |bytes, _| {
                let _ = tx.send(bytes.to_vec());
            })
            .unwrap();

        let port = socket.local_addr().unwrap().port();
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        let reply = OscMessage::new("/ping").encode();
        peer.send_to(&reply, ("127.0.0.1", port)).unwrap();

        let got = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(got, reply);
        drop(receiver);
    }

    #[test]
    fn test_unresolvable_host_is_error() {
        let socket = OscSocket::bind().unwrap();
        assert!(socket.send(&OscMessage::new("/x"), "no such host.invalid", 9000).is_err());
    }
}
