//! End-to-end seed scenarios (spec §8 S1–S3, S6): a real
//! [`ServerSession`]/[`ClientSession`] pair talking RFB over an
//! in-memory duplex stream, rather than the pipeline-internal unit
//! tests in `update.rs`. S4 (fence RTT) and S5 (H.264 IDR cadence) are
//! covered at the unit level in `flow.rs` and `encoding/h264.rs`
//! instead, since neither needs a live transport to observe.
//!
//! Grounded on `oxidecomputer-rfb`'s `src/server.rs` test module:
//! spin up both sides of a connection and drive them concurrently
//! through `tokio::spawn`, asserting on what each side actually
//! produced/consumed rather than on internal pipeline state.

use std::sync::{Arc, Mutex};

use rfbkit::auth::PasswordFile;
use rfbkit::extensions::{DynStream, ExtensionRegistry, Handler, NullHandler};
use rfbkit::pixel::PixelFormat;
use rfbkit::protocol::{ENCODING_COPYRECT, ENCODING_RAW};
use rfbkit::region::Rect;
use rfbkit::session::client::{ClientSecurity, ClientSession};
use rfbkit::session::server::{ServerConfig, ServerSession};

#[derive(Default, Clone)]
struct RecordingHandler {
    updates: Arc<Mutex<Vec<(Rect, Vec<u8>)>>>,
}

impl Handler for RecordingHandler {
    fn on_update(&mut self, rect: Rect, pixels: &[u8], _format: &PixelFormat) {
        self.updates.lock().unwrap().push((rect, pixels.to_vec()));
    }
}

fn duplex_pair() -> (Box<dyn DynStream>, Box<dyn DynStream>) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    (Box::new(a), Box::new(b))
}

/// S1: a fresh connection's first non-incremental request returns the
/// entire framebuffer as one Raw rectangle.
///
/// S2: after that, a region marked modified and requested
/// incrementally comes back as a single Raw rectangle covering only
/// that region.
#[tokio::test]
async fn s1_s2_handshake_then_incremental_raw_update() {
    let (server_stream, client_stream) = duplex_pair();
    let config = ServerConfig { width: 4, height: 4, server_format: PixelFormat::rgba32(), ..ServerConfig::default() };

    let server_task = tokio::spawn(async move {
        let mut handler = NullHandler;
        let mut extensions = ExtensionRegistry::new();
        let mut session = ServerSession::handshake(server_stream, config, &mut handler, &mut extensions).await.unwrap();

        session.step(&mut handler, &mut extensions).await.unwrap(); // SetEncodings
        session.step(&mut handler, &mut extensions).await.unwrap(); // full FramebufferUpdateRequest
        let fb = vec![0x11u8; 4 * 4 * 4];
        session.flush_update(&fb).await.unwrap();

        session.step(&mut handler, &mut extensions).await.unwrap(); // incremental FramebufferUpdateRequest
        session.mark_modified(Rect::new(1, 1, 3, 3));
        let mut fb2 = fb.clone();
        let stride = 4 * 4;
        let mut counter = 1u8;
        for y in 1..3 {
            for x in 1..3 {
                let idx = y * stride + x * 4;
                for c in 0..4 {
                    fb2[idx + c] = counter;
                    counter = counter.wrapping_add(1);
                }
            }
        }
        session.flush_update(&fb2).await.unwrap();
    });

    let handler = RecordingHandler::default();
    let client_handler = handler.clone();
    let client_task = tokio::spawn(async move {
        let mut handler = client_handler;
        let mut session = ClientSession::handshake(client_stream, ClientSecurity::default(), None, &mut handler).await.unwrap();
        session.send_set_encodings(&[ENCODING_RAW]).await.unwrap();
        session.request_update(false, Rect::new(0, 0, 4, 4)).await.unwrap();
        session.step(&mut handler).await.unwrap();
        session.request_update(true, Rect::new(0, 0, 4, 4)).await.unwrap();
        session.step(&mut handler).await.unwrap();
    });

    server_task.await.unwrap();
    client_task.await.unwrap();

    let recorded = handler.updates.lock().unwrap();
    assert_eq!(recorded.len(), 2);
    assert_eq!(recorded[0].0, Rect::new(0, 0, 4, 4));
    assert_eq!(recorded[0].1, vec![0x11u8; 4 * 4 * 4]);

    assert_eq!(recorded[1].0, Rect::new(1, 1, 2, 2));
    assert_eq!(recorded[1].1, vec![1, 2, 3, 4, 5, 6, 7, 8]);
}

/// S3: a scheduled CopyRect followed by a modified raw region produces
/// a CopyRect rectangle before the Raw rectangle, and the client's
/// locally decoded pixels after both are applied match the server's
/// intended final layout.
#[tokio::test]
async fn s3_copy_rect_precedes_modified_pixel_rect() {
    let (server_stream, client_stream) = duplex_pair();
    let config = ServerConfig { width: 8, height: 8, server_format: PixelFormat::rgba32(), ..ServerConfig::default() };

    const OLD_PATTERN: u8 = 0xAA;
    const NEW_PATTERN: u8 = 0x55;

    let server_task = tokio::spawn(async move {
        let mut handler = NullHandler;
        let mut extensions = ExtensionRegistry::new();
        let mut session = ServerSession::handshake(server_stream, config, &mut handler, &mut extensions).await.unwrap();

        session.step(&mut handler, &mut extensions).await.unwrap(); // SetEncodings
        session.step(&mut handler, &mut extensions).await.unwrap(); // full FramebufferUpdateRequest
        let fb = vec![OLD_PATTERN; 8 * 8 * 4];
        session.flush_update(&fb).await.unwrap();

        session.step(&mut handler, &mut extensions).await.unwrap(); // incremental FramebufferUpdateRequest
        // A copy of [0,0,2,2] by (dx=2, dy=0) lands at destination
        // [2,0,2,2] (spec §8 S3): schedule_copy takes that destination
        // rectangle and the same dx.
        session.schedule_copy(Rect::new(2, 0, 2, 2), 2, 0);
        session.mark_modified(Rect::new(0, 0, 2, 2));

        let mut fb2 = fb.clone();
        let stride = 8 * 4;
        for y in 0..2 {
            for x in 0..2 {
                let idx = y * stride + x * 4;
                fb2[idx..idx + 4].copy_from_slice(&[NEW_PATTERN; 4]);
            }
        }
        session.flush_update(&fb2).await.unwrap();
    });

    let handler = RecordingHandler::default();
    let client_handler = handler.clone();
    let client_task = tokio::spawn(async move {
        let mut handler = client_handler;
        let mut session = ClientSession::handshake(client_stream, ClientSecurity::default(), None, &mut handler).await.unwrap();
        session.send_set_encodings(&[ENCODING_COPYRECT, ENCODING_RAW]).await.unwrap();
        session.request_update(false, Rect::new(0, 0, 8, 8)).await.unwrap();
        session.step(&mut handler).await.unwrap(); // seeds the local mirror
        session.request_update(true, Rect::new(0, 0, 8, 8)).await.unwrap();
        session.step(&mut handler).await.unwrap(); // CopyRect + Raw
    });

    server_task.await.unwrap();
    client_task.await.unwrap();

    let recorded = handler.updates.lock().unwrap();
    assert_eq!(recorded.len(), 3);
    assert_eq!(recorded[1].0, Rect::new(2, 0, 2, 2));
    assert!(recorded[1].1.iter().all(|&b| b == OLD_PATTERN));
    assert_eq!(recorded[2].0, Rect::new(0, 0, 2, 2));
    assert!(recorded[2].1.iter().all(|&b| b == NEW_PATTERN));
}

/// S6: a password file with a view-only boundary marker splits into
/// the right full-access/view-only sets.
#[test]
fn s6_password_file_view_only_boundary() {
    let file = PasswordFile::parse("alice\n__BEGIN_VIEWONLY__\nbob\n");
    assert_eq!(file.full_access, vec!["alice".to_string()]);
    assert_eq!(file.view_only, vec!["bob".to_string()]);
    assert_eq!(file.view_only_boundary(), 1);
    assert!(!file.is_view_only(0));
    assert!(file.is_view_only(1));
}
