//! Simple VNC server example.
//!
//! Creates a server with a static gradient test pattern.
//!
//! Usage:
//!   cargo run --example simple_server
//!
//! Then connect with a VNC viewer to localhost:5900, password "test123".

use std::error::Error;
use std::sync::Arc;

use rfbkit::auth::PasswordFile;
use rfbkit::extensions::NullHandler;
use rfbkit::pixel::PixelFormat;
use rfbkit::region::Rect;
use rfbkit::server::ServerContext;
use rfbkit::session::server::{SecurityConfig, ServerConfig};

const WIDTH: u16 = 800;
const HEIGHT: u16 = 600;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    println!("Starting VNC server on port {}...", rfbkit::DEFAULT_PORT);
    println!("Connect with: vncviewer localhost:{}", rfbkit::DEFAULT_PORT);
    println!("Password: test123");

    let config = ServerConfig {
        name: "rfbkit simple_server".into(),
        width: WIDTH,
        height: HEIGHT,
        server_format: PixelFormat::rgba32(),
        security: SecurityConfig {
            allow_none: false,
            vnc_auth: Some(PasswordFile { full_access: vec!["test123".into()], view_only: Vec::new() }),
            vencrypt_subtypes: Vec::new(),
        },
        ..ServerConfig::default()
    };
    let ctx = ServerContext::new(config);

    let mut pixels = vec![0u8; usize::from(WIDTH) * usize::from(HEIGHT) * 4];
    for y in 0..usize::from(HEIGHT) {
        for x in 0..usize::from(WIDTH) {
            let offset = (y * usize::from(WIDTH) + x) * 4;
            pixels[offset] = (x * 255 / usize::from(WIDTH)) as u8;
            pixels[offset + 1] = (y * 255 / usize::from(HEIGHT)) as u8;
            pixels[offset + 2] = 128;
            pixels[offset + 3] = 255;
        }
    }
    ctx.update_framebuffer(Rect::new(0, 0, i32::from(WIDTH), i32::from(HEIGHT)), &pixels).await;
    println!("Framebuffer updated with test pattern, ready for connections");

    let addr = format!("0.0.0.0:{}", rfbkit::DEFAULT_PORT).parse()?;
    ctx.serve_tcp(addr, Arc::new(|| Box::new(NullHandler))).await?;
    Ok(())
}
