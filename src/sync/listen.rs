//! Push channel: the OSCQuery websocket used for LISTEN/IGNORE.
//!
//! The channel runs on its own OS thread with a current-thread tokio
//! runtime. It connects to the remote, reconnects with exponential backoff
//! when the connection drops, and reports to a [`PushHandler`]:
//!
//! - on every (re)connect, so subscriptions can be replayed;
//! - for every binary frame (an OSC packet pushed by the remote);
//! - on disconnect.
//!
//! Outgoing control frames are queued through an unbounded channel and
//! written by the connection loop. Frames queued while disconnected are
//! discarded; the connect callback replays the subscriptions that matter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::constants;
use crate::ws::{self, WsFrame, WsReader, WsWriter};

/// Subscription command sent on the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ListenCommand {
    /// Start pushing updates for a path.
    Listen,
    /// Stop pushing updates for a path.
    Ignore,
}

#[derive(Serialize)]
struct ControlFrame<'a> {
    #[serde(rename = "COMMAND")]
    command: ListenCommand,
    #[serde(rename = "DATA")]
    data: &'a str,
}

/// Build the JSON text frame for `command` on the OSC address `address`.
pub fn control_frame(command: ListenCommand, address: &str) -> String {
    serde_json::to_string(&ControlFrame {
        command,
        data: address,
    })
    .unwrap_or_default()
}

/// Callbacks from the push channel thread.
pub trait PushHandler: Send + Sync {
    /// The connection is open; replay subscriptions now.
    fn on_push_connected(&self);
    /// A binary frame arrived.
    fn on_push_packet(&self, bytes: &[u8]);
    /// A text frame arrived.
    fn on_push_text(&self, text: &str);
    /// The connection closed or failed.
    fn on_push_disconnected(&self);
}

/// Messages from the owner to the connection loop.
#[derive(Debug)]
pub(crate) enum PushOutgoing {
    Text(String),
    Close,
}

/// Handle to a running push channel.
#[derive(Debug)]
pub struct PushChannel {
    url: String,
    send_tx: mpsc::UnboundedSender<PushOutgoing>,
    connected: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl PushChannel {
    /// Spawn the channel thread for `url`.
    ///
    /// The handler is held weakly: once its owner is gone the thread exits.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn start(url: String, handler: Weak<dyn PushHandler>) -> Result<Self> {
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread_url = url.clone();
        let thread_connected = Arc::clone(&connected);
        let thread_shutdown = Arc::clone(&shutdown);
        let handle = thread::Builder::new()
            .name("push-channel".to_string())
            .spawn(move || {
                run_push_thread(&thread_url, &handler, send_rx, &thread_connected, &thread_shutdown);
            })
            .context("Failed to spawn push channel thread")?;

        Ok(Self {
            url,
            send_tx,
            connected,
            shutdown,
            thread_handle: Some(handle),
        })
    }

    /// URL the channel connects to.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether the websocket is currently open.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Queue a LISTEN or IGNORE frame. Returns `false` when not connected.
    pub fn send_command(&self, command: ListenCommand, address: &str) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.send_tx
            .send(PushOutgoing::Text(control_frame(command, address)))
            .is_ok()
    }

    /// Close the connection and join the thread.
    ///
    /// No handler callbacks run after this returns.
    pub fn close(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.send_tx.send(PushOutgoing::Close);
        if let Some(handle) = self.thread_handle.take() {
            crate::engine::join_with_timeout(handle, "push channel");
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    /// A connected channel with no thread; frames land in the returned receiver.
    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<PushOutgoing>) {
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let channel = Self {
            url: String::new(),
            send_tx,
            connected: Arc::new(AtomicBool::new(true)),
            shutdown: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
        };
        (channel, send_rx)
    }
}

impl Drop for PushChannel {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Why a connected session ended.
enum SessionExit {
    Closed,
    Disconnected,
}

fn run_push_thread(
    url: &str,
    handler: &Weak<dyn PushHandler>,
    mut send_rx: mpsc::UnboundedReceiver<PushOutgoing>,
    connected: &AtomicBool,
    shutdown: &AtomicBool,
) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("Push channel: failed to create tokio runtime: {e}");
            return;
        }
    };

    rt.block_on(async {
        let mut backoff = constants::PUSH_RECONNECT_INITIAL;

        loop {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }

            match ws::connect(url).await {
                Ok((mut writer, mut reader)) => {
                    log::info!("Push channel connected to {url}");
                    backoff = constants::PUSH_RECONNECT_INITIAL;

                    // Anything queued while down refers to the previous connection
                    while let Ok(stale) = send_rx.try_recv() {
                        if matches!(stale, PushOutgoing::Close) {
                            let _ = writer.close().await;
                            return;
                        }
                    }

                    connected.store(true, Ordering::SeqCst);
                    let Some(h) = handler.upgrade() else {
                        let _ = writer.close().await;
                        break;
                    };
                    h.on_push_connected();
                    drop(h);

                    let exit = run_session(&mut writer, &mut reader, &mut send_rx, handler).await;
                    connected.store(false, Ordering::SeqCst);
                    if let Some(h) = handler.upgrade() {
                        h.on_push_disconnected();
                    }
                    if let SessionExit::Closed = exit {
                        break;
                    }
                    log::info!("Push channel disconnected, reconnecting in {backoff:?}");
                }
                Err(e) => {
                    log::warn!("Push channel: {e:#} (retry in {backoff:?})");
                }
            }

            if !wait_backoff(backoff, &mut send_rx, shutdown).await {
                break;
            }
            backoff = (backoff * 2).min(constants::PUSH_RECONNECT_MAX);
        }
    });

    log::debug!("Push channel thread exiting");
}

async fn run_session(
    writer: &mut WsWriter,
    reader: &mut WsReader,
    send_rx: &mut mpsc::UnboundedReceiver<PushOutgoing>,
    handler: &Weak<dyn PushHandler>,
) -> SessionExit {
    loop {
        tokio::select! {
            frame = reader.recv() => {
                let Some(h) = handler.upgrade() else {
                    let _ = writer.close().await;
                    return SessionExit::Closed;
                };
                match frame {
                    Some(Ok(WsFrame::Binary(data))) => h.on_push_packet(&data),
                    Some(Ok(WsFrame::Text(text))) => h.on_push_text(&text),
                    Some(Ok(WsFrame::Close { code, reason })) => {
                        log::info!("Push channel closed by remote ({code}): {reason}");
                        return SessionExit::Disconnected;
                    }
                    Some(Err(e)) => {
                        log::warn!("Push channel: {e:#}");
                        return SessionExit::Disconnected;
                    }
                    None => return SessionExit::Disconnected,
                }
            }
            outgoing = send_rx.recv() => {
                match outgoing {
                    Some(PushOutgoing::Text(text)) => {
                        log::debug!("Push channel -> {text}");
                        if let Err(e) = writer.send_text(&text).await {
                            log::warn!("Push channel: {e:#}");
                            return SessionExit::Disconnected;
                        }
                    }
                    Some(PushOutgoing::Close) | None => {
                        let _ = writer.close().await;
                        return SessionExit::Closed;
                    }
                }
            }
        }
    }
}

/// Sleep for `delay` while honoring close requests.
///
/// Returns `false` when the channel should stop instead of reconnecting.
async fn wait_backoff(
    delay: Duration,
    send_rx: &mut mpsc::UnboundedReceiver<PushOutgoing>,
    shutdown: &AtomicBool,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            () = &mut sleep => return !shutdown.load(Ordering::SeqCst),
            outgoing = send_rx.recv() => match outgoing {
                Some(PushOutgoing::Text(text)) => {
                    log::debug!("Push channel not connected, dropping {text}");
                }
                Some(PushOutgoing::Close) | None => return false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_control_frame_format() {
        assert_eq!(
            control_frame(ListenCommand::Listen, "/synth/freq"),
            r#"{"COMMAND":"LISTEN","DATA":"/synth/freq"}"#
        );
        assert_eq!(
            control_frame(ListenCommand::Ignore, "/a"),
            r#"{"COMMAND":"IGNORE","DATA":"/a"}"#
        );
    }

    #[test]
    fn test_detached_channel_queues_frames() {
        let (channel, mut rx) = PushChannel::detached();
        assert!(channel.send_command(ListenCommand::Listen, "/x"));
        match rx.try_recv().unwrap() {
            PushOutgoing::Text(text) => assert_eq!(text, r#"{"COMMAND":"LISTEN","DATA":"/x"}"#),
            PushOutgoing::Close => panic!("unexpected close"),
        }
    }

    #[test]
    fn test_disconnected_channel_refuses_frames() {
        let (channel, mut rx) = PushChannel::detached();
        channel.connected.store(false, Ordering::SeqCst);
        assert!(!channel.send_command(ListenCommand::Listen, "/x"));
        assert!(rx.try_recv().is_err());
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl PushHandler for Recorder {
        fn on_push_connected(&self) {
            self.events.lock().unwrap().push("connected".to_string());
        }
        fn on_push_packet(&self, _bytes: &[u8]) {}
        fn on_push_text(&self, _text: &str) {}
        fn on_push_disconnected(&self) {}
    }

    #[test]
    fn test_unreachable_channel_closes_promptly() {
        let recorder = Arc::new(Recorder::default());
        let handler: Arc<dyn PushHandler> = recorder.clone();
        let channel = PushChannel::start("ws://127.0.0.1:1/".to_string(), Arc::downgrade(&handler)).unwrap();
        assert_eq!(channel.url(), "ws://127.0.0.1:1/");
        std::thread::sleep(Duration::from_millis(50));
        assert!(!channel.is_connected());

        let started = std::time::Instant::now();
        channel.close();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(recorder.events.lock().unwrap().is_empty());
    }
}
