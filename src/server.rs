//! `ServerContext`: the accept loop and client registry (spec §9).
//!
//! The teacher has no such type: its example code opens one
//! `TcpListener` and hand-spawns a task per `VncClient::new` with no
//! shared registry at all, sending per-client events out over an
//! `mpsc::UnboundedSender<ClientEvent>` the application has to match on
//! by `client_id: usize`. Spec §9 explicitly calls this out for
//! generalization: client state belongs in a
//! `slotmap::SlotMap<ClientId, ClientHandle>` owned by one context, and
//! the ad hoc event enum becomes the [`crate::extensions::Handler`]
//! trait object, constructed fresh per connection by a factory closure.
//! The accept loop itself follows `oxidecomputer-rfb`'s `VncServer::start`:
//! bind, then `loop { accept; tokio::spawn(...) }`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use slotmap::{new_key_type, SlotMap};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};

use crate::error::Result;
use crate::extensions::{ExtensionRegistry, Handler, ProtocolExtension};
use crate::region::Rect;
use crate::session::server::{AccessLevel, ServerConfig, ServerSession};
use crate::transport;

new_key_type! {
    /// Opaque handle to one connected client, stable for the lifetime
    /// of the connection (spec §9 `ClientId`).
    pub struct ClientId;
}

/// A framebuffer change pushed by the application to every connected
/// client's [`ServerSession`] via its update pipeline.
#[derive(Debug, Clone)]
enum FbChange {
    Modified(Rect),
    Copy { rect: Rect, dx: i32, dy: i32 },
}

/// Registry bookkeeping for one connected client; owned by
/// [`ServerContext`], not by the client's own task.
pub struct ClientHandle {
    /// Peer address, or a transport-specific label (e.g. `"unix"`).
    pub remote: String,
    /// Full or view-only, as negotiated during the handshake.
    pub access: AccessLevel,
    close: mpsc::Sender<()>,
}

/// Owns the shared framebuffer, the client registry, and the
/// configuration every accepted connection starts its handshake with.
pub struct ServerContext {
    config: ServerConfig,
    framebuffer: RwLock<Vec<u8>>,
    clients: RwLock<SlotMap<ClientId, ClientHandle>>,
    changes: broadcast::Sender<FbChange>,
    extensions: Mutex<ExtensionRegistry>,
}

/// Factory invoked once per accepted connection to build that
/// connection's capability set; boxed so it can be shared across the
/// accept loop's spawned tasks.
pub type HandlerFactory = dyn Fn() -> Box<dyn Handler> + Send + Sync;

/// Interval used to re-check flow control and pending updates when no
/// explicit deferral or framebuffer change is pending.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(16);

impl ServerContext {
    /// Builds a context with an all-zero framebuffer sized from
    /// `config`.
    #[must_use]
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let size = usize::from(config.width) * usize::from(config.height) * config.server_format.bytes_per_pixel();
        let (changes, _rx) = broadcast::channel(1024);
        Arc::new(Self {
            framebuffer: RwLock::new(vec![0u8; size]),
            clients: RwLock::new(SlotMap::with_key()),
            changes,
            extensions: Mutex::new(ExtensionRegistry::new()),
            config,
        })
    }

    /// Registers a protocol extension every future client session will
    /// consult (spec §4.D).
    pub async fn register_extension(&self, extension: Box<dyn ProtocolExtension>) {
        self.extensions.lock().await.register(extension);
    }

    /// Writes `pixels` (packed in `self.config.server_format`) into the
    /// shared framebuffer at `rect` and notifies every connected client
    /// that the region changed.
    pub async fn update_framebuffer(&self, rect: Rect, pixels: &[u8]) {
        {
            let bpp = self.config.server_format.bytes_per_pixel();
            let stride = usize::from(self.config.width) * bpp;
            let mut fb = self.framebuffer.write().await;
            let row_bytes = rect.width() as usize * bpp;
            for (row, y) in (rect.y1..rect.y2).enumerate() {
                let row_start = y as usize * stride + rect.x1 as usize * bpp;
                let src = &pixels[row * row_bytes..(row + 1) * row_bytes];
                fb[row_start..row_start + row_bytes].copy_from_slice(src);
            }
        }
        let _ = self.changes.send(FbChange::Modified(rect));
    }

    /// Notifies clients that `rect` (the destination) now holds a copy
    /// of the framebuffer region at `rect` translated by `(-dx, -dy)`
    /// (GLOSSARY: "dest = source + translation"); the caller must
    /// already have performed the equivalent move on the data
    /// [`Self::update_framebuffer`] maintains.
    pub fn notify_copy(&self, rect: Rect, dx: i32, dy: i32) {
        let _ = self.changes.send(FbChange::Copy { rect, dx, dy });
    }

    /// Snapshot of the client registry (spec §9 slotmap-backed state).
    pub async fn clients(&self) -> Vec<(ClientId, String, AccessLevel)> {
        self.clients
            .read()
            .await
            .iter()
            .map(|(id, handle)| (id, handle.remote.clone(), handle.access))
            .collect()
    }

    /// Forcibly closes a client's connection.
    pub async fn disconnect(&self, id: ClientId) {
        if let Some(handle) = self.clients.read().await.get(id) {
            let _ = handle.close.try_send(());
        }
    }

    /// Accepts TCP connections on `addr` until an I/O error occurs.
    pub async fn serve_tcp(self: &Arc<Self>, addr: SocketAddr, handler_factory: Arc<HandlerFactory>) -> Result<()> {
        let listener = transport::tcp::listen(addr).await?;
        loop {
            let (stream, peer) = transport::tcp::accept(&listener).await?;
            self.spawn_client(transport::boxed(stream), peer.to_string(), handler_factory.clone());
        }
    }

    /// Accepts UNIX-domain connections at `path` until an I/O error
    /// occurs.
    pub async fn serve_unix(
        self: &Arc<Self>,
        path: impl AsRef<std::path::Path>,
        handler_factory: Arc<HandlerFactory>,
    ) -> Result<()> {
        let listener = transport::unix::listen(path)?;
        loop {
            let stream = transport::unix::accept(&listener).await?;
            self.spawn_client(transport::boxed(stream), "unix".to_string(), handler_factory.clone());
        }
    }

    fn spawn_client(self: &Arc<Self>, stream: transport::BoxedStream, remote: String, handler_factory: Arc<HandlerFactory>) {
        let ctx = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = ctx.run_client(stream, remote.clone(), handler_factory).await {
                log::warn!("client {remote} closed: {e}");
            }
        });
    }

    async fn run_client(
        self: Arc<Self>,
        stream: transport::BoxedStream,
        remote: String,
        handler_factory: Arc<HandlerFactory>,
    ) -> Result<()> {
        let mut handler = handler_factory();
        let mut session = {
            let mut ext = self.extensions.lock().await;
            ServerSession::handshake(stream, self.config.clone(), handler.as_mut(), &mut ext).await?
        };

        let (close_tx, mut close_rx) = mpsc::channel::<()>(1);
        let id = self.clients.write().await.insert(ClientHandle {
            remote,
            access: session.access_level(),
            close: close_tx,
        });

        let mut changes = self.changes.subscribe();
        let result = self.client_loop(&mut session, handler.as_mut(), &mut changes, &mut close_rx).await;

        self.clients.write().await.remove(id);
        self.extensions.lock().await.notify_close();
        result
    }

    async fn client_step(&self, session: &mut ServerSession, handler: &mut dyn Handler) -> Result<()> {
        let mut ext = self.extensions.lock().await;
        session.step(handler, &mut ext).await
    }

    async fn client_loop(
        &self,
        session: &mut ServerSession,
        handler: &mut dyn Handler,
        changes: &mut broadcast::Receiver<FbChange>,
        close_rx: &mut mpsc::Receiver<()>,
    ) -> Result<()> {
        loop {
            let deferral = {
                let fb = self.framebuffer.read().await;
                session.flush_update(&fb).await?
            };
            let idle_wait = deferral.unwrap_or(IDLE_POLL_INTERVAL);

            tokio::select! {
                biased;
                _ = close_rx.recv() => return Ok(()),
                change = changes.recv() => {
                    match change {
                        Ok(FbChange::Modified(rect)) => session.mark_modified(rect),
                        Ok(FbChange::Copy { rect, dx, dy }) => session.schedule_copy(rect, dx, dy),
                        Err(broadcast::error::RecvError::Lagged(_)) => {
                            let whole = Rect::new(0, 0, i32::from(self.config.width), i32::from(self.config.height));
                            session.mark_modified(whole);
                        }
                        Err(broadcast::error::RecvError::Closed) => return Ok(()),
                    }
                }
                step = self.client_step(session, handler) => {
                    step?;
                }
                () = tokio::time::sleep(idle_wait) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixel::PixelFormat;

    fn test_config() -> ServerConfig {
        ServerConfig {
            width: 4,
            height: 4,
            server_format: PixelFormat::rgba32(),
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn update_framebuffer_writes_into_the_shared_buffer() {
        let ctx = ServerContext::new(test_config());
        let pixels = vec![0xABu8; 2 * 2 * 4];
        ctx.update_framebuffer(Rect::new(1, 1, 2, 2), &pixels).await;
        let fb = ctx.framebuffer.read().await;
        let stride = 4 * 4;
        assert_eq!(&fb[stride + 4..stride + 8], &[0xAB, 0xAB, 0xAB, 0xAB]);
    }

    #[tokio::test]
    async fn new_registry_starts_with_no_clients() {
        let ctx = ServerContext::new(test_config());
        assert!(ctx.clients().await.is_empty());
    }
}
