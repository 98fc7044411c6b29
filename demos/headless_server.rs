//! Headless VNC server example with animated content.
//!
//! Continuously updates the framebuffer with an animated gradient,
//! demonstrating the server in a headless environment without screen
//! capture.
//!
//! Usage:
//!   cargo run --example headless_server

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use rfbkit::extensions::NullHandler;
use rfbkit::pixel::PixelFormat;
use rfbkit::region::Rect;
use rfbkit::server::ServerContext;
use rfbkit::session::server::ServerConfig;
use tokio::time;

const WIDTH: u16 = 640;
const HEIGHT: u16 = 480;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    println!("Starting headless VNC server on port {}...", rfbkit::DEFAULT_PORT);
    println!("Connect with: vncviewer localhost:{}", rfbkit::DEFAULT_PORT);

    let config = ServerConfig {
        name: "rfbkit headless_server".into(),
        width: WIDTH,
        height: HEIGHT,
        server_format: PixelFormat::rgba32(),
        ..ServerConfig::default()
    };
    let ctx = ServerContext::new(config);

    let listener_ctx = ctx.clone();
    tokio::spawn(async move {
        let addr = format!("0.0.0.0:{}", rfbkit::DEFAULT_PORT).parse().unwrap();
        if let Err(e) = listener_ctx.serve_tcp(addr, Arc::new(|| Box::new(NullHandler))).await {
            eprintln!("server error: {e}");
        }
    });

    println!("Server started, generating animated content...");
    println!("Press Ctrl+C to stop");

    let mut frame = 0u32;
    let mut pixels = vec![0u8; usize::from(WIDTH) * usize::from(HEIGHT) * 4];

    loop {
        for y in 0..usize::from(HEIGHT) {
            for x in 0..usize::from(WIDTH) {
                let offset = (y * usize::from(WIDTH) + x) * 4;
                pixels[offset] = ((x as u32 + frame) % 256) as u8;
                pixels[offset + 1] = ((y as u32 + frame) % 256) as u8;
                pixels[offset + 2] = ((frame / 2) % 256) as u8;
                pixels[offset + 3] = 255;
            }
        }

        ctx.update_framebuffer(Rect::new(0, 0, i32::from(WIDTH), i32::from(HEIGHT)), &pixels).await;

        frame = frame.wrapping_add(1);
        time::sleep(Duration::from_millis(33)).await;

        if frame % 300 == 0 {
            println!("Frame: {frame}");
        }
    }
}
