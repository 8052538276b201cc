//! Streaming video decode/encode via FFmpeg
//!
//! Frames travel as raw RGB24 over pipes: the decoder child writes them to our
//! stdin side, the encoder child reads them and muxes H.264 MP4. Only one frame
//! is materialised at a time on each side.

use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Stdio};

use crate::ffmpeg::{FfmpegCommand, FfmpegError, VideoInfo};
use crate::frame::Frame;

/// Pulls RGB24 frames out of an `ffmpeg` child
pub struct VideoDecoder {
    child: Option<Child>,
    stdout: ChildStdout,
    info: VideoInfo,
    frames_read: u64,
}

impl VideoDecoder {
    pub fn open(path: impl AsRef<Path>, info: VideoInfo) -> Result<Self, FfmpegError> {
        // -noautorotate keeps the decoded geometry equal to the probed one
        let mut child = FfmpegCommand::new()
            .args(&["-noautorotate"])
            .input(path)
            .args(&["-an", "-f", "rawvideo", "-pix_fmt", "rgb24"])
            .output("pipe:1")
            .spawn(Stdio::null(), Stdio::piped())?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FfmpegError::ExecutionFailed("decoder stdout unavailable".to_string()))?;

        Ok(Self {
            child: Some(child),
            stdout,
            info,
            frames_read: 0,
        })
    }

    pub fn info(&self) -> &VideoInfo {
        &self.info
    }

    /// Next frame, or `None` at a clean end of stream
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FfmpegError> {
        let len = self.info.frame_len();
        let mut buffer = vec![0u8; len];
        let mut filled = 0;

        while filled < len {
            match self.stdout.read(&mut buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        if filled == 0 {
            return Ok(None);
        }
        if filled < len {
            return Err(FfmpegError::InvalidOutput(format!(
                "truncated frame {} ({} of {} bytes)",
                self.frames_read, filled, len
            )));
        }

        self.frames_read += 1;
        Frame::from_rgb24(self.info.width, self.info.height, buffer)
            .map(Some)
            .ok_or_else(|| FfmpegError::InvalidOutput("frame buffer size mismatch".to_string()))
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    /// Reap the child and check it exited cleanly
    pub fn finish(mut self) -> Result<(), FfmpegError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let status = child.wait()?;
        if status.success() {
            Ok(())
        } else {
            Err(FfmpegError::ExecutionFailed(format!("decoder exited with {}", status)))
        }
    }
}

impl Drop for VideoDecoder {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Feeds RGB24 frames into an `ffmpeg` child producing H.264 MP4
pub struct VideoEncoder {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    width: u32,
    height: u32,
    frames_written: u64,
}

impl VideoEncoder {
    pub fn start(output: impl AsRef<Path>, width: u32, height: u32, frame_rate: &str) -> Result<Self, FfmpegError> {
        let size = format!("{}x{}", width, height);
        let mut child = FfmpegCommand::new()
            .args(&[
                "-y", "-f", "rawvideo", "-pix_fmt", "rgb24", "-s", &size, "-r", frame_rate, "-i", "pipe:0",
                "-an", "-c:v", "libx264", "-vf", "pad=ceil(iw/2)*2:ceil(ih/2)*2", "-pix_fmt", "yuv420p",
                "-movflags", "+faststart", "-f", "mp4",
            ])
            .output(output)
            .spawn(Stdio::piped(), Stdio::null())?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| FfmpegError::ExecutionFailed("encoder stdin unavailable".to_string()))?;

        Ok(Self {
            child: Some(child),
            stdin: Some(stdin),
            width,
            height,
            frames_written: 0,
        })
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn write_frame(&mut self, frame: Frame) -> Result<(), FfmpegError> {
        if frame.dimensions() != (self.width, self.height) {
            return Err(FfmpegError::InvalidOutput(format!(
                "frame is {}x{}, stream is {}x{}",
                frame.width(),
                frame.height(),
                self.width,
                self.height
            )));
        }

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| FfmpegError::ExecutionFailed("encoder already finished".to_string()))?;
        stdin.write_all(frame.into_rgb().as_raw())?;
        self.frames_written += 1;
        Ok(())
    }

    /// Close the pipe and wait for the muxer to finalise the file
    pub fn finish(mut self) -> Result<u64, FfmpegError> {
        drop(self.stdin.take());
        let Some(mut child) = self.child.take() else {
            return Ok(self.frames_written);
        };
        let status = child.wait()?;
        if status.success() {
            Ok(self.frames_written)
        } else {
            Err(FfmpegError::ExecutionFailed(format!("encoder exited with {}", status)))
        }
    }
}

impl Drop for VideoEncoder {
    fn drop(&mut self) {
        drop(self.stdin.take());
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
