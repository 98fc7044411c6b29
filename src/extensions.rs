//! Application integration points (component D/§9): the capability
//! set an embedder supplies to drive framebuffer allocation, input
//! delivery, and credentials, plus the protocol-extension registry
//! consulted before built-in message dispatch.
//!
//! Generalizes the teacher's `ServerEvent` channel (fire-and-forget,
//! one direction) into a synchronous capability trait so the embedder
//! can answer "what's the current framebuffer" and "what's the
//! password" rather than only being notified after the fact, and adds
//! the libvncserver-style `newClient`/`enablePseudoEncoding`/`init`/
//! `handleMessage`/`close` extension hooks spec §4.D names, which the
//! teacher has no equivalent of at all.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;
use crate::pixel::PixelFormat;
use crate::region::Rect;
use crate::vencrypt::X509Credentials;

/// Marker trait bundling the bidirectional stream bounds a boxed
/// transport must satisfy; `dyn Trait` cannot name two non-auto traits
/// directly, so this stands in for `AsyncRead + AsyncWrite`.
pub trait DynStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> DynStream for T {}

/// Application-supplied capability set (spec §9's replacement for
/// "deep callback tables via function pointers").
///
/// Every method has a reasonable default so a consumer only overrides
/// the capabilities it cares about; the variants are explicit methods
/// rather than an enum of function pointers, so "password vs.
/// credential vs. none" is a type-level distinction.
pub trait Handler: Send {
    /// Called once the framebuffer geometry is known (server's
    /// `ServerInit`, or a client's own local buffer). Returns the
    /// initial pixel contents, row-major in `format` with no padding.
    fn allocate_framebuffer(&mut self, width: u16, height: u16, format: &PixelFormat) -> Vec<u8> {
        vec![0u8; usize::from(width) * usize::from(height) * format.bytes_per_pixel()]
    }

    /// A rectangle of the framebuffer changed; `pixels` is packed in
    /// `format`.
    fn on_update(&mut self, _rect: Rect, _pixels: &[u8], _format: &PixelFormat) {}

    /// Clipboard text arrived from the peer.
    fn on_clipboard(&mut self, _text: &str) {}

    /// Cursor shape update (`rgba` is premultiplied, row-major).
    fn on_cursor(&mut self, _x_hot: u16, _y_hot: u16, _width: u16, _height: u16, _rgba: &[u8]) {}

    /// A `KeyEvent` arrived (server side only); `keysym` is the X11
    /// keysym value on the wire. What this does with the key is out of
    /// scope (spec §1) — only the bytes-on-the-wire interface is fixed.
    fn on_key_event(&mut self, _keysym: u32, _pressed: bool) {}

    /// A `PointerEvent` arrived (server side only).
    fn on_pointer_event(&mut self, _x: u16, _y: u16, _button_mask: u8) {}

    /// Supplies the VNC-auth password to try, or `None` to refuse.
    fn get_password(&mut self) -> Option<String> {
        None
    }

    /// Supplies VeNCrypt X.509 credentials; the default carries no
    /// certificates, which makes any X.509 sub-type fail to build.
    fn get_credentials(&mut self) -> X509Credentials {
        X509Credentials::default()
    }
}

/// A no-op handler for headless servers or tests that only needs
/// [`Handler::allocate_framebuffer`]'s default.
#[derive(Debug, Default)]
pub struct NullHandler;
impl Handler for NullHandler {}

/// Server-side protocol extension (spec §4.D), modeled on
/// libvncserver's `rfbProtocolExtension`: a registered extension sees
/// every new client, may claim additional pseudo-encodings and message
/// types, and is consulted before the built-in dispatcher.
#[async_trait]
pub trait ProtocolExtension: Send + Sync {
    /// Called once per newly established client session.
    fn new_client(&self) {}

    /// Called for each pseudo-encoding id the client advertises;
    /// returns `true` if this extension claims it.
    fn enable_pseudo_encoding(&mut self, _encoding: i32) -> bool {
        false
    }

    /// Called once, after the session enters the `Normal` phase.
    fn init(&mut self) {}

    /// Called for every client message whose type byte this extension
    /// has claimed (via a type registered alongside the extension).
    /// Returns `true` if the extension consumed the message.
    async fn handle_message(
        &mut self,
        message_type: u8,
        stream: &mut (dyn DynStream),
    ) -> Result<bool>;

    /// Called when the client session ends.
    fn close(&self) {}
}

/// Ordered collection of extensions consulted before the built-in
/// dispatcher (spec §4.D: "in registration order").
#[derive(Default)]
pub struct ExtensionRegistry {
    extensions: Vec<Box<dyn ProtocolExtension>>,
}

impl ExtensionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, extension: Box<dyn ProtocolExtension>) {
        self.extensions.push(extension);
    }

    pub fn notify_new_client(&self) {
        for ext in &self.extensions {
            ext.new_client();
        }
    }

    pub fn notify_init(&mut self) {
        for ext in &mut self.extensions {
            ext.init();
        }
    }

    pub fn notify_close(&self) {
        for ext in &self.extensions {
            ext.close();
        }
    }

    /// Offers `encoding` to every registered extension in order,
    /// stopping at the first one that claims it.
    pub fn try_enable_pseudo_encoding(&mut self, encoding: i32) -> bool {
        self.extensions
            .iter_mut()
            .any(|ext| ext.enable_pseudo_encoding(encoding))
    }

    /// Offers `message_type` to every registered extension in order;
    /// returns `true` once one claims and handles it.
    pub async fn try_handle_message(
        &mut self,
        message_type: u8,
        stream: &mut (dyn DynStream),
    ) -> Result<bool> {
        for ext in &mut self.extensions {
            if ext.handle_message(message_type, stream).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_handler_fills_framebuffer_with_zeroes() {
        let mut handler = NullHandler;
        let buf = handler.allocate_framebuffer(2, 2, &PixelFormat::rgba32());
        assert_eq!(buf.len(), 2 * 2 * 4);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn default_handler_refuses_password_and_credentials() {
        let mut handler = NullHandler;
        assert!(handler.get_password().is_none());
        assert!(handler.get_credentials().client_cert_file.is_none());
    }

    struct CountingExtension {
        inits: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl ProtocolExtension for CountingExtension {
        fn init(&mut self) {
            self.inits.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }

        async fn handle_message(&mut self, _message_type: u8, _stream: &mut (dyn DynStream)) -> Result<bool> {
            Ok(false)
        }
    }

    #[test]
    fn registry_notifies_every_extension_in_order() {
        let mut registry = ExtensionRegistry::new();
        registry.register(Box::new(CountingExtension { inits: std::sync::atomic::AtomicUsize::new(0) }));
        registry.notify_init();
    }
}
