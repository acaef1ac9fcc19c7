//! Bridge configuration and its command line surface.

use std::time::Duration;

use anyhow::{anyhow, bail, Context};

use crate::model::tracks::MediaKind;

pub const DEFAULT_ADDRESS: &str = "127.0.0.1:80";
pub const DEFAULT_CHANNEL_LABEL: &str = "cirrus";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    /// Signaling endpoint, `host:port` or a full `ws://` / `wss://` URL
    pub address: String,
    pub enable_video: bool,
    pub enable_audio: bool,
    /// Requested stream resolution, sent once the data channel opens
    pub resolution: (u32, u32),
    /// Deadline for the data channel to open. `None` waits forever.
    pub connect_timeout: Option<Duration>,
    /// How often [`wait_connected`](crate::bridge::BridgeHandle::wait_connected) checks the flag
    pub connect_poll_interval: Duration,
    pub channel_label: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            address: DEFAULT_ADDRESS.to_string(),
            enable_video: true,
            enable_audio: false,
            resolution: (1280, 720),
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            connect_poll_interval: CONNECT_POLL_INTERVAL,
            channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
        }
    }
}

impl BridgeConfig {
    pub fn new(address: impl Into<String>) -> Self {
        BridgeConfig {
            address: address.into(),
            ..Default::default()
        }
    }

    /// Media kinds to request receive-only transceivers for.
    pub fn media_kinds(&self) -> Vec<MediaKind> {
        let mut kinds = vec![];
        if self.enable_audio {
            kinds.push(MediaKind::Audio);
        }
        if self.enable_video {
            kinds.push(MediaKind::Video);
        }
        kinds
    }

    /// Parses `[ADDRESS] [--video|--no-video] [--audio] [--resolution WxH]
    /// [--timeout SECS]`. The first element of `args` is the program name.
    pub fn from_args(args: &[String]) -> anyhow::Result<Self> {
        let mut config = BridgeConfig::default();
        let mut iter = args.iter().skip(1);

        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--video" => config.enable_video = true,
                "--no-video" => config.enable_video = false,
                "--audio" => config.enable_audio = true,
                "--resolution" => {
                    let value = iter.next().ok_or_else(|| anyhow!("--resolution needs WxH"))?;
                    config.resolution = parse_resolution(value)?;
                }
                "--timeout" => {
                    let value = iter.next().ok_or_else(|| anyhow!("--timeout needs seconds"))?;
                    let secs: u64 = value
                        .parse()
                        .with_context(|| format!("invalid timeout '{}'", value))?;
                    config.connect_timeout = (secs > 0).then(|| Duration::from_secs(secs));
                }
                flag if flag.starts_with("--") => bail!("unknown option '{}'", flag),
                address => config.address = address.to_string(),
            }
        }

        Ok(config)
    }
}

fn parse_resolution(value: &str) -> anyhow::Result<(u32, u32)> {
    let (w, h) = value
        .split_once(['x', 'X'])
        .ok_or_else(|| anyhow!("resolution '{}' is not WxH", value))?;
    let w = w.parse().with_context(|| format!("invalid width '{}'", w))?;
    let h = h.parse().with_context(|| format!("invalid height '{}'", h))?;
    Ok((w, h))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("pixel-bridge")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn defaults() {
        let config = BridgeConfig::from_args(&args(&[])).unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.media_kinds(), vec![MediaKind::Video]);
    }

    #[test]
    fn parses_flags() {
        let config = BridgeConfig::from_args(&args(&[
            "10.0.0.5:8080",
            "--audio",
            "--no-video",
            "--resolution",
            "1920x1080",
            "--timeout",
            "0",
        ]))
        .unwrap();

        assert_eq!(config.address, "10.0.0.5:8080");
        assert!(config.enable_audio);
        assert!(!config.enable_video);
        assert_eq!(config.resolution, (1920, 1080));
        assert_eq!(config.connect_timeout, None);
        assert_eq!(config.media_kinds(), vec![MediaKind::Audio]);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(BridgeConfig::from_args(&args(&["--resolution", "wide"])).is_err());
        assert!(BridgeConfig::from_args(&args(&["--timeout"])).is_err());
        assert!(BridgeConfig::from_args(&args(&["--turbo"])).is_err());
    }
}
