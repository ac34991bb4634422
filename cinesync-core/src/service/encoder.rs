//! Transcoding seam
//!
//! The catalog only needs one promise from an encoder: when `encode`
//! resolves Ok, `<output_dir>/master.m3u8` exists and references playable
//! renditions. The shipped implementation shells out to ffmpeg once per
//! rung of a fixed ladder and writes the master playlist itself.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::VideoConfig;
use crate::{Error, Result};

#[async_trait]
pub trait Encoder: Send + Sync {
    /// Produce an HLS rendition tree plus `master.m3u8` under `output_dir`.
    async fn encode(&self, source: &Path, output_dir: &Path) -> Result<()>;
}

/// One rung of the rendition ladder.
struct Rendition {
    name: &'static str,
    height: u32,
    width: u32,
    video_bitrate: &'static str,
    /// Peak bits per second advertised in the master playlist.
    bandwidth: u32,
}

const LADDER: &[Rendition] = &[
    Rendition {
        name: "1080p",
        height: 1080,
        width: 1920,
        video_bitrate: "4500k",
        bandwidth: 4_628_000,
    },
    Rendition {
        name: "720p",
        height: 720,
        width: 1280,
        video_bitrate: "2500k",
        bandwidth: 2_628_000,
    },
    Rendition {
        name: "480p",
        height: 480,
        width: 854,
        video_bitrate: "1000k",
        bandwidth: 1_128_000,
    },
];

const AUDIO_BITRATE: &str = "128k";

pub struct FfmpegEncoder {
    ffmpeg_path: PathBuf,
    segment_secs: u32,
}

impl FfmpegEncoder {
    #[must_use]
    pub fn new(config: &VideoConfig) -> Self {
        Self {
            ffmpeg_path: PathBuf::from(&config.ffmpeg_path),
            segment_secs: config.segment_secs,
        }
    }

    /// Build the argument list for one rendition.
    fn rendition_args(&self, source: &Path, rendition_dir: &Path, r: &Rendition) -> Vec<String> {
        let playlist = rendition_dir.join("index.m3u8");
        let segments = rendition_dir.join("seg_%05d.ts");
        vec![
            "-hide_banner".into(),
            "-y".into(),
            "-i".into(),
            source.to_string_lossy().into_owned(),
            "-vf".into(),
            format!("scale=-2:{}", r.height),
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            "veryfast".into(),
            "-b:v".into(),
            r.video_bitrate.into(),
            "-maxrate".into(),
            r.video_bitrate.into(),
            "-bufsize".into(),
            format!("{}k", bitrate_kbps(r.video_bitrate) * 2),
            "-c:a".into(),
            "aac".into(),
            "-b:a".into(),
            AUDIO_BITRATE.into(),
            "-f".into(),
            "hls".into(),
            "-hls_time".into(),
            self.segment_secs.to_string(),
            "-hls_playlist_type".into(),
            "vod".into(),
            "-hls_flags".into(),
            "independent_segments".into(),
            "-hls_segment_filename".into(),
            segments.to_string_lossy().into_owned(),
            playlist.to_string_lossy().into_owned(),
        ]
    }
}

fn bitrate_kbps(bitrate: &str) -> u32 {
    bitrate
        .strip_suffix('k')
        .and_then(|v| v.parse().ok())
        .unwrap_or(1000)
}

fn master_playlist() -> String {
    let mut out = String::from("#EXTM3U\n#EXT-X-VERSION:3\n");
    for r in LADDER {
        out.push_str(&format!(
            "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={}x{}\n{}/index.m3u8\n",
            r.bandwidth, r.width, r.height, r.name
        ));
    }
    out
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    async fn encode(&self, source: &Path, output_dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(output_dir).await?;
        let log_path = output_dir.join("encode.log");
        let log_file = std::fs::File::create(&log_path)?;

        for rendition in LADDER {
            let rendition_dir = output_dir.join(rendition.name);
            tokio::fs::create_dir_all(&rendition_dir).await?;

            let args = self.rendition_args(source, &rendition_dir, rendition);
            debug!(rendition = rendition.name, ?args, "spawning ffmpeg");

            let mut child = tokio::process::Command::new(&self.ffmpeg_path)
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::from(log_file.try_clone()?))
                .spawn()
                .map_err(|e| Error::Encoder(format!("spawn ffmpeg: {e}")))?;

            let status = child
                .wait()
                .await
                .map_err(|e| Error::Encoder(format!("wait for ffmpeg: {e}")))?;
            if !status.success() {
                return Err(Error::Encoder(format!(
                    "ffmpeg exited with {status} for rendition {} of {}",
                    rendition.name,
                    source.display()
                )));
            }
        }

        // The master playlist is written last so its presence marks a
        // completed encode.
        tokio::fs::write(output_dir.join("master.m3u8"), master_playlist()).await?;
        info!(source = %source.display(), output = %output_dir.display(), "encode complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_playlist_references_every_rendition() {
        let playlist = master_playlist();
        assert!(playlist.starts_with("#EXTM3U"));
        for r in LADDER {
            assert!(playlist.contains(&format!("{}/index.m3u8", r.name)));
            assert!(playlist.contains(&format!("BANDWIDTH={}", r.bandwidth)));
        }
    }

    #[test]
    fn rendition_args_target_the_rendition_dir() {
        let encoder = FfmpegEncoder::new(&VideoConfig::default());
        let args = encoder.rendition_args(
            Path::new("/lib/movie.mp4"),
            Path::new("/lib/processed/movie/720p"),
            &LADDER[1],
        );
        assert!(args.contains(&"scale=-2:720".to_string()));
        assert!(args.iter().any(|a| a.ends_with("720p/index.m3u8")));
        assert!(args.iter().any(|a| a.contains("seg_%05d.ts")));
        // VOD playlists so finished encodes list every segment.
        assert!(args.contains(&"vod".to_string()));
    }

    #[test]
    fn bitrate_parsing() {
        assert_eq!(bitrate_kbps("4500k"), 4500);
        assert_eq!(bitrate_kbps("junk"), 1000);
    }
}
