//! Per-segment external decoder.
//!
//! One decoder subprocess per segment, owned by the playout engine and
//! destroyed at segment end. The child is placed in its own session so a
//! SIGINT aimed at the station does not take the codec down mid-segment
//! while DRAINING; teardown signals the whole process group, graceful
//! first, forced after a short timeout, so no orphans survive.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};

use retrowaves_core::frame::pad_to_frame;
use retrowaves_core::protocol_constants::PCM_FRAME_BYTES;

use crate::error::{StationError, StationResult};

/// Grace between SIGTERM and SIGKILL at teardown.
const TERM_GRACE: Duration = Duration::from_millis(500);

/// A running decode of one file into canonical PCM on stdout.
pub struct Decoder {
    child: Child,
    stdout: ChildStdout,
    /// Process-group id (the child's pid, it leads its own session).
    pgid: Option<i32>,
    eof: bool,
}

impl Decoder {
    /// Spawns ffmpeg decoding `path` to s16le 48 kHz stereo, honoring the
    /// event's gain trim and start offset.
    pub fn spawn(
        path: &Path,
        gain_db: Option<f32>,
        start_offset_ms: Option<u64>,
    ) -> StationResult<Self> {
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
        ];
        if let Some(offset) = start_offset_ms {
            args.push("-ss".into());
            args.push(format!("{:.3}", offset as f64 / 1000.0));
        }
        args.push("-i".into());
        args.push(path.display().to_string());
        if let Some(gain) = gain_db {
            args.push("-af".into());
            args.push(format!("volume={gain}dB"));
        }
        args.extend(
            ["-f", "s16le", "-ar", "48000", "-ac", "2", "pipe:1"]
                .iter()
                .map(|s| s.to_string()),
        );

        Self::launch("ffmpeg", &args)
    }

    fn launch(program: &str, args: &[String]) -> StationResult<Self> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // A fresh session detaches the codec from the station's controlling
        // terminal: an interactive ^C must not kill it mid-drain.
        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        let mut child = command
            .spawn()
            .map_err(|e| StationError::Decoder(format!("spawning {program}: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| StationError::Decoder("missing stdout pipe".into()))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log::warn!("[Decoder:stderr] {line}");
                }
            });
        }

        let pgid = child.id().map(|pid| pid as i32);
        Ok(Self {
            child,
            stdout,
            pgid,
            eof: false,
        })
    }

    /// Spawns an arbitrary command in place of ffmpeg (tests only).
    #[cfg(test)]
    pub fn launch_for_test(program: &str, args: &[String]) -> StationResult<Self> {
        Self::launch(program, args)
    }

    /// Reads the next complete PCM frame.
    ///
    /// Returns `None` at end of stream; a trailing partial read is padded
    /// to a full frame so only whole frames ever reach the bridge.
    pub async fn read_frame(&mut self) -> StationResult<Option<Bytes>> {
        if self.eof {
            return Ok(None);
        }

        let mut buf = vec![0u8; PCM_FRAME_BYTES];
        let mut filled = 0;
        while filled < PCM_FRAME_BYTES {
            match self.stdout.read(&mut buf[filled..]).await {
                Ok(0) => {
                    self.eof = true;
                    if filled == 0 {
                        return Ok(None);
                    }
                    return Ok(Some(pad_to_frame(&buf[..filled])));
                }
                Ok(n) => filled += n,
                Err(e) => {
                    self.eof = true;
                    return Err(StationError::Decoder(format!("stdout read: {e}")));
                }
            }
        }
        Ok(Some(Bytes::from(buf)))
    }

    /// Graceful stop: SIGTERM to the process group, short wait, SIGKILL.
    pub async fn shutdown(mut self) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid {
            unsafe {
                libc::kill(-pgid, libc::SIGTERM);
            }
        }

        match tokio::time::timeout(TERM_GRACE, self.child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                #[cfg(unix)]
                if let Some(pgid) = self.pgid {
                    unsafe {
                        libc::kill(-pgid, libc::SIGKILL);
                    }
                }
                let _ = self.child.kill().await;
            }
        }
    }
}
