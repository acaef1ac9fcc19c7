use std::env;

use anyhow::Context;
use pixel_bridge::{
    model::{inbound::InboundMessage, payload::StampedFrame},
    subsystem::Subsystem,
    util::init_log,
    BridgeConfig, RtcSession, SessionBridge,
};
use tracing::info;

/// Logs stream progress and every unsolicited data message.
#[derive(Default)]
struct StreamLog {
    frames: u64,
}

impl Subsystem for StreamLog {
    fn on_video(&mut self, frame: &StampedFrame) {
        self.frames += 1;
        if self.frames % 300 == 1 {
            info!(
                "Video frame #{} on stream {} ({} bytes, latency {})",
                self.frames,
                frame.frame.stream_id,
                frame.frame.data.len(),
                frame.latency()
            );
        }
    }

    fn on_data(&mut self, message: &InboundMessage) {
        info!("Data message: {:?}", message);
    }

    fn deinitialize(&mut self) {
        info!("Received {} video frames", self.frames);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        print_usage();
        return Ok(());
    }

    let config = match BridgeConfig::from_args(&args) {
        Ok(config) => config,
        Err(e) => {
            print_usage();
            return Err(e);
        }
    };

    init_log();

    let session = RtcSession::bind()
        .await
        .context("failed to start media engine")?;
    info!("Media engine listening on {}", session.local_addr());

    let mut bridge = SessionBridge::new(config, session);
    bridge.add_subsystem(Box::new(StreamLog::default()));

    let handle = bridge.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.stop();
        }
    });

    bridge.run().await?;
    Ok(())
}

fn print_usage() {
    println!("Pixel Bridge");
    println!("Usage:");
    println!("  pixel-bridge [ADDRESS] [--video|--no-video] [--audio]");
    println!("               [--resolution WxH] [--timeout SECS]");
    println!();
    println!("  ADDRESS defaults to 127.0.0.1:80, --timeout 0 waits forever");
}
