//! Transcoder child process
//!
//! One ffmpeg invocation per stream encodes the whole ABR ladder: it pulls
//! `rtmp://<host>/live/<key>` and writes per-rung playlists and segments
//! plus the master playlist into the prepared artifact tree. The child
//! runs in its own process group so one signal reaches any grandchildren
//! ffmpeg forks for itself.

use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

use crate::hls::LadderProfile;

/// How many trailing stderr lines are kept for diagnostics
const STDERR_TAIL_LINES: usize = 20;

/// HLS output knobs the command contract needs
#[derive(Debug, Clone, Copy)]
pub struct HlsOutputOptions {
    pub segment_seconds: u32,
    pub playlist_segments: u32,
}

/// Build the ffmpeg argument list for one stream.
///
/// Pure so the contract is testable without spawning anything: input URL,
/// one scaled H.264 + AAC encode per rung, keyframes forced onto segment
/// boundaries, and an HLS muxer writing `%v/segment_%03d.ts` under the
/// output directory with a rolling window.
pub fn build_transcoder_args(
    input_url: &str,
    output_dir: &Path,
    ladder: &[LadderProfile],
    hls: HlsOutputOptions,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "warning".into(),
        "-nostats".into(),
        "-i".into(),
        input_url.into(),
    ];

    for _ in ladder {
        args.push("-map".into());
        args.push("0:v:0".into());
        args.push("-map".into());
        args.push("0:a:0".into());
    }

    for (i, rung) in ladder.iter().enumerate() {
        args.push(format!("-filter:v:{}", i));
        args.push(format!("scale=w={}:h={}", rung.width, rung.height));
        args.push(format!("-c:v:{}", i));
        args.push("libx264".into());
        args.push(format!("-preset:v:{}", i));
        args.push("veryfast".into());
        args.push(format!("-b:v:{}", i));
        args.push(format!("{}k", rung.video_kbps));
        args.push(format!("-maxrate:v:{}", i));
        args.push(format!("{}k", rung.max_kbps));
        args.push(format!("-bufsize:v:{}", i));
        args.push(format!("{}k", rung.buffer_kbps));
        args.push(format!("-profile:v:{}", i));
        args.push(rung.profile.as_str().into());
        args.push(format!("-level:v:{}", i));
        args.push(rung.level_string());
        args.push(format!("-c:a:{}", i));
        args.push("aac".into());
        args.push(format!("-b:a:{}", i));
        args.push(format!("{}k", rung.audio_kbps));
    }

    // GOPs aligned to segment boundaries: a keyframe every segment
    args.push("-sc_threshold".into());
    args.push("0".into());
    args.push("-force_key_frames".into());
    args.push(format!("expr:gte(t,n_forced*{})", hls.segment_seconds));

    let var_stream_map = (0..ladder.len())
        .map(|i| format!("v:{},a:{}", i, i))
        .collect::<Vec<_>>()
        .join(" ");

    args.push("-f".into());
    args.push("hls".into());
    args.push("-hls_time".into());
    args.push(hls.segment_seconds.to_string());
    args.push("-hls_list_size".into());
    args.push(hls.playlist_segments.to_string());
    args.push("-hls_flags".into());
    args.push("delete_segments+independent_segments".into());
    args.push("-hls_segment_filename".into());
    args.push(
        output_dir
            .join("%v")
            .join("segment_%03d.ts")
            .to_string_lossy()
            .into_owned(),
    );
    args.push("-master_pl_name".into());
    args.push("master.m3u8".into());
    args.push("-var_stream_map".into());
    args.push(var_stream_map);
    args.push(
        output_dir
            .join("%v")
            .join("playlist.m3u8")
            .to_string_lossy()
            .into_owned(),
    );

    args
}

/// A spawned transcoder and its diagnostics
#[derive(Debug)]
pub struct TranscoderChild {
    child: Child,
    pid: u32,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

impl TranscoderChild {
    /// Spawn the transcoder in its own process group with stderr captured.
    pub fn spawn(ffmpeg_bin: &str, args: &[String]) -> std::io::Result<Self> {
        let mut command = Command::new(ffmpeg_bin);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn()?;
        let pid = child.id().ok_or_else(|| {
            std::io::Error::other("transcoder exited before a pid could be read")
        })?;

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        if let Some(stderr) = child.stderr.take() {
            let tail = Arc::clone(&stderr_tail);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "transcoder", "{}", line);
                    let mut tail = tail.lock().expect("stderr tail poisoned");
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            });
        }

        Ok(Self {
            child,
            pid,
            stderr_tail,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Non-blocking liveness check; reaps the child if it has exited.
    pub fn try_wait(&mut self) -> Option<std::process::ExitStatus> {
        match self.child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(pid = self.pid, error = %e, "try_wait on transcoder failed");
                None
            }
        }
    }

    /// Stop the child's process group: SIGTERM, wait out the grace
    /// period, then SIGKILL. A zero grace goes straight to SIGKILL.
    ///
    /// Returns whether the child exited within the grace period.
    pub async fn terminate(&mut self, grace: Duration) -> bool {
        if self.try_wait().is_some() {
            return true;
        }

        if grace.is_zero() {
            self.signal_group(true);
            let _ = self.child.wait().await;
            return false;
        }

        self.signal_group(false);
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(_) => true,
            Err(_) => {
                tracing::warn!(pid = self.pid, "Transcoder ignored SIGTERM, killing");
                self.signal_group(true);
                let _ = self.child.wait().await;
                false
            }
        }
    }

    /// Last captured stderr lines, for exit diagnostics
    pub fn stderr_tail(&self) -> String {
        let tail = self.stderr_tail.lock().expect("stderr tail poisoned");
        tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    #[cfg(unix)]
    fn signal_group(&self, force: bool) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
        let Ok(pid) = i32::try_from(self.pid) else {
            return;
        };
        // The child is its own group leader, so the pgid equals its pid
        if let Err(e) = killpg(Pid::from_raw(pid), signal) {
            tracing::debug!(pid = self.pid, %signal, error = %e, "killpg failed");
        }
    }

    #[cfg(not(unix))]
    fn signal_group(&self, _force: bool) {
        let _ = self.child.start_kill();
    }
}
