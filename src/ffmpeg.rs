//! FFmpeg/ffprobe command wrapper utilities
//!
//! Video never links against libav*: every operation shells out to the system
//! `ffmpeg`/`ffprobe` binaries and exchanges raw RGB24 frames over pipes.

use serde::Deserialize;
use std::path::Path;
use std::process::{Child, Command, Output, Stdio};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FfmpegError {
    #[error("FFmpeg not found in system PATH")]
    NotInstalled,

    #[error("FFmpeg execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Invalid output: {0}")]
    InvalidOutput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Builder for one `ffmpeg` or `ffprobe` invocation
pub struct FfmpegCommand {
    program: &'static str,
    args: Vec<String>,
}

impl FfmpegCommand {
    pub fn new() -> Self {
        Self {
            program: "ffmpeg",
            args: vec!["-v".into(), "error".into(), "-nostdin".into()],
        }
    }

    pub fn probe() -> Self {
        Self {
            program: "ffprobe",
            args: vec!["-v".into(), "error".into()],
        }
    }

    pub fn input(mut self, path: impl AsRef<Path>) -> Self {
        self.args.push("-i".to_string());
        self.args.push(path.as_ref().display().to_string());
        self
    }

    pub fn output(mut self, path: impl AsRef<Path>) -> Self {
        self.args.push(path.as_ref().display().to_string());
        self
    }

    pub fn args(mut self, args: &[&str]) -> Self {
        self.args.extend(args.iter().map(|s| s.to_string()));
        self
    }

    /// Run to completion and capture output
    pub fn execute(self) -> Result<Output, FfmpegError> {
        let output = self
            .command()
            .stdin(Stdio::null())
            .output()
            .map_err(|e| spawn_error(self.program, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FfmpegError::ExecutionFailed(stderr.trim().to_string()));
        }

        Ok(output)
    }

    /// Spawn with the given stdio; stderr is discarded so a chatty child can
    /// never block on a full pipe
    pub fn spawn(self, stdin: Stdio, stdout: Stdio) -> Result<Child, FfmpegError> {
        self.command()
            .stdin(stdin)
            .stdout(stdout)
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| spawn_error(self.program, e))
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(self.program);
        cmd.args(&self.args);
        cmd
    }
}

impl Default for FfmpegCommand {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_error(program: &str, e: std::io::Error) -> FfmpegError {
    if e.kind() == std::io::ErrorKind::NotFound {
        FfmpegError::NotInstalled
    } else {
        FfmpegError::ExecutionFailed(format!("{}: {}", program, e))
    }
}

pub fn is_ffmpeg_installed() -> bool {
    let found = |program: &str| {
        Command::new(program)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    };
    found("ffmpeg") && found("ffprobe")
}

/// Geometry and timing of the first video stream
#[derive(Debug, Clone, PartialEq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    /// Rational frame rate as ffprobe reports it, e.g. `30000/1001`
    pub frame_rate: String,
}

impl VideoInfo {
    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    pub fn fps(&self) -> f64 {
        parse_rate(&self.frame_rate).unwrap_or(0.0)
    }
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
}

/// Probe the first video stream of a file
pub fn probe(path: impl AsRef<Path>) -> Result<VideoInfo, FfmpegError> {
    let output = FfmpegCommand::probe()
        .args(&[
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height,r_frame_rate",
            "-of",
            "json",
        ])
        .output(path)
        .execute()?;

    parse_probe(&output.stdout)
}

fn parse_probe(stdout: &[u8]) -> Result<VideoInfo, FfmpegError> {
    let parsed: ProbeOutput =
        serde_json::from_slice(stdout).map_err(|e| FfmpegError::InvalidOutput(e.to_string()))?;
    let stream = parsed
        .streams
        .into_iter()
        .next()
        .ok_or_else(|| FfmpegError::InvalidOutput("no video stream".to_string()))?;

    let (width, height) = match (stream.width, stream.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => return Err(FfmpegError::InvalidOutput("video stream has no dimensions".to_string())),
    };

    let frame_rate = stream
        .r_frame_rate
        .filter(|r| parse_rate(r).map(|fps| fps > 0.0).unwrap_or(false))
        .unwrap_or_else(|| "25/1".to_string());

    Ok(VideoInfo {
        width,
        height,
        frame_rate,
    })
}

fn parse_rate(rate: &str) -> Option<f64> {
    match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            (den != 0.0).then(|| num / den)
        }
        None => rate.trim().parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_probe() {
        let json = br#"{"programs":[],"streams":[{"width":640,"height":360,"r_frame_rate":"30000/1001"}]}"#;
        let info = parse_probe(json).unwrap();
        assert_eq!((info.width, info.height), (640, 360));
        assert!((info.fps() - 29.97).abs() < 0.01);
        assert_eq!(info.frame_len(), 640 * 360 * 3);
    }

    #[test]
    fn test_parse_probe_defaults_bad_rate() {
        let json = br#"{"streams":[{"width":2,"height":2,"r_frame_rate":"0/0"}]}"#;
        assert_eq!(parse_probe(json).unwrap().frame_rate, "25/1");
    }

    #[test]
    fn test_parse_probe_without_stream() {
        assert!(parse_probe(br#"{"streams":[]}"#).is_err());
        assert!(parse_probe(br#"{"streams":[{"r_frame_rate":"25/1"}]}"#).is_err());
        assert!(parse_probe(b"not json").is_err());
    }

    #[test]
    fn test_command_args() {
        let cmd = FfmpegCommand::new().input("in.mp4").args(&["-f", "rawvideo"]).output("pipe:1");
        assert_eq!(cmd.program, "ffmpeg");
        assert_eq!(&cmd.args[3..], ["-i", "in.mp4", "-f", "rawvideo", "pipe:1"]);
    }
}
