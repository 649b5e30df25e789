//! External-process backend
//!
//! Raw RGBA frames go to ffmpeg's stdin and raw f32 audio goes to a named
//! FIFO; ffmpeg does all encoding and muxing. Producers never write to a pipe
//! themselves. Finished buffers are queued, and one writer task per stream
//! drains its queue sequentially, returning each buffer to its pool once the
//! bytes are out.

pub mod command;
pub mod pool;

use parking_lot::Mutex;
use std::future::Future;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::QueuePolicy;
use crate::encoder::convert::SampleFormat;
use crate::encoder::{EncoderSettings, EncoderStats, MediaEncoder};
use crate::utils::{RecorderError, Result, StreamKind};

use self::command::FfmpegCommandBuilder;
use self::pool::{BufferPool, PoolStats};

/// Grace period for a killed encoder process to be reaped
const KILL_GRACE: Duration = Duration::from_secs(5);

enum PipeItem<T> {
    Frame(Vec<T>),
    /// Write the previous frame again
    Repeat,
}

enum QueueSender<T> {
    Unbounded(mpsc::UnboundedSender<PipeItem<T>>),
    Block(mpsc::Sender<PipeItem<T>>),
    DropNewest(mpsc::Sender<PipeItem<T>>),
}

enum QueueReceiver<T> {
    Unbounded(mpsc::UnboundedReceiver<PipeItem<T>>),
    Bounded(mpsc::Receiver<PipeItem<T>>),
}

enum SendFailure<T> {
    Full(PipeItem<T>),
    Closed(PipeItem<T>),
}

fn frame_queue<T>(policy: QueuePolicy) -> (QueueSender<T>, QueueReceiver<T>) {
    match policy {
        QueuePolicy::Unbounded => {
            let (tx, rx) = mpsc::unbounded_channel();
            (QueueSender::Unbounded(tx), QueueReceiver::Unbounded(rx))
        }
        QueuePolicy::Block { max_pending } => {
            let (tx, rx) = mpsc::channel(max_pending.max(1));
            (QueueSender::Block(tx), QueueReceiver::Bounded(rx))
        }
        QueuePolicy::DropNewest { max_pending } => {
            let (tx, rx) = mpsc::channel(max_pending.max(1));
            (QueueSender::DropNewest(tx), QueueReceiver::Bounded(rx))
        }
    }
}

impl<T: Send> QueueSender<T> {
    fn send(&self, item: PipeItem<T>) -> std::result::Result<(), SendFailure<T>> {
        match self {
            QueueSender::Unbounded(tx) => tx.send(item).map_err(|e| SendFailure::Closed(e.0)),
            QueueSender::Block(tx) => match tx.try_send(item) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Closed(item)) => Err(SendFailure::Closed(item)),
                Err(mpsc::error::TrySendError::Full(item)) => {
                    off_runtime(|| tx.blocking_send(item)).map_err(|e| SendFailure::Closed(e.0))
                }
            },
            QueueSender::DropNewest(tx) => tx.try_send(item).map_err(|e| match e {
                mpsc::error::TrySendError::Full(item) => SendFailure::Full(item),
                mpsc::error::TrySendError::Closed(item) => SendFailure::Closed(item),
            }),
        }
    }
}

impl<T> QueueReceiver<T> {
    async fn recv(&mut self) -> Option<PipeItem<T>> {
        match self {
            QueueReceiver::Unbounded(rx) => rx.recv().await,
            QueueReceiver::Bounded(rx) => rx.recv().await,
        }
    }
}

/// Element types that can be written to a pipe
trait PipeSample: Clone + Default + Send + Sync + 'static {
    fn pipe_bytes<'a>(buf: &'a [Self], scratch: &'a mut Vec<u8>) -> &'a [u8];
}

impl PipeSample for u8 {
    fn pipe_bytes<'a>(buf: &'a [u8], _scratch: &'a mut Vec<u8>) -> &'a [u8] {
        buf
    }
}

impl PipeSample for f32 {
    fn pipe_bytes<'a>(buf: &'a [f32], scratch: &'a mut Vec<u8>) -> &'a [u8] {
        SampleFormat::F32Le.encode(buf, scratch);
        scratch
    }
}

/// Run blocking work where blocking is allowed.
///
/// A thread inside a tokio runtime context may not block on a channel or on
/// another runtime, so from there the work moves to a scoped thread.
fn off_runtime<R: Send>(work: impl FnOnce() -> R + Send) -> R {
    if tokio::runtime::Handle::try_current().is_err() {
        return work();
    }
    std::thread::scope(|scope| match scope.spawn(work).join() {
        Ok(result) => result,
        Err(panic) => std::panic::resume_unwind(panic),
    })
}

struct ChildHandle {
    monitor: JoinHandle<std::io::Result<ExitStatus>>,
    kill: Option<oneshot::Sender<()>>,
}

/// Encoder streaming raw frames to an ffmpeg subprocess
pub struct PipeEncoder {
    runtime: Option<Runtime>,
    width: u32,
    height: u32,
    channels: usize,
    video_pool: Arc<BufferPool<u8>>,
    audio_pool: Arc<BufferPool<f32>>,
    video_queue: Option<QueueSender<u8>>,
    audio_queue: Option<QueueSender<f32>>,
    queue_policy: QueuePolicy,
    writers: Vec<JoinHandle<Result<u64>>>,
    child: Option<ChildHandle>,
    /// Set once `end` starts, so the monitor knows an exit is expected
    ending: Arc<AtomicBool>,
    fault: Arc<Mutex<Option<String>>>,
    stderr_tail: Arc<Mutex<Option<String>>>,
    exited: Arc<watch::Sender<bool>>,
    current_video: Option<Vec<u8>>,
    current_audio: Option<(Vec<f32>, usize)>,
    /// A frame has been queued, so the writer has something to repeat
    video_started: bool,
    stats: EncoderStats,
    shutdown_timeout: Duration,
    _fifo_dir: Option<tempfile::TempDir>,
}

impl PipeEncoder {
    /// Start ffmpeg writing to `output_path`
    pub fn spawn(settings: &EncoderSettings, output_path: &Path) -> Result<Self> {
        let runtime = build_runtime()?;
        let launched = {
            let _guard = runtime.enter();
            launch(settings, output_path)
        };
        let Launched {
            child,
            stdin,
            stderr,
            fifo_dir,
            fifo,
        } = match launched {
            Ok(launched) => launched,
            Err(e) => {
                // A runtime must not be dropped from async code
                runtime.shutdown_background();
                return Err(e);
            }
        };

        let mut encoder = Self::new(settings, runtime, fifo_dir);
        match fifo.clone() {
            Some(path) => encoder.start_writers(std::future::ready(Ok(stdin)), async move {
                tokio::fs::OpenOptions::new().write(true).open(path).await
            }),
            None => encoder.start_writers(
                std::future::ready(Ok(stdin)),
                std::future::ready(Ok(tokio::io::sink())),
            ),
        }
        if let Some(stderr) = stderr {
            encoder.forward_stderr(stderr);
        }
        encoder.supervise(child, fifo);

        tracing::info!("Encoder process started for {:?}", output_path);
        Ok(encoder)
    }

    /// Stream into caller-supplied sinks instead of a subprocess
    pub fn with_sinks<VW, AW>(settings: &EncoderSettings, video: VW, audio: AW) -> Result<Self>
    where
        VW: AsyncWrite + Unpin + Send + 'static,
        AW: AsyncWrite + Unpin + Send + 'static,
    {
        let runtime = build_runtime()?;
        let mut encoder = Self::new(settings, runtime, None);
        encoder.start_writers(std::future::ready(Ok(video)), std::future::ready(Ok(audio)));
        Ok(encoder)
    }

    fn new(settings: &EncoderSettings, runtime: Runtime, fifo_dir: Option<tempfile::TempDir>) -> Self {
        let (exited, _) = watch::channel(false);
        Self {
            runtime: Some(runtime),
            width: settings.width,
            height: settings.height,
            channels: settings.channels.max(1) as usize,
            video_pool: Arc::new(BufferPool::new()),
            audio_pool: Arc::new(BufferPool::new()),
            video_queue: None,
            audio_queue: None,
            queue_policy: settings.pipe.queue,
            writers: Vec::new(),
            child: None,
            ending: Arc::new(AtomicBool::new(false)),
            fault: Arc::new(Mutex::new(None)),
            stderr_tail: Arc::new(Mutex::new(None)),
            exited: Arc::new(exited),
            current_video: None,
            current_audio: None,
            video_started: false,
            stats: EncoderStats::default(),
            shutdown_timeout: settings.shutdown_timeout(),
            _fifo_dir: fifo_dir,
        }
    }

    fn start_writers<VF, VW, AF, AW>(&mut self, video: VF, audio: AF)
    where
        VF: Future<Output = std::io::Result<VW>> + Send + 'static,
        VW: AsyncWrite + Unpin + Send + 'static,
        AF: Future<Output = std::io::Result<AW>> + Send + 'static,
        AW: AsyncWrite + Unpin + Send + 'static,
    {
        let Some(runtime) = &self.runtime else { return };
        let policy = self.queue_policy;
        let (vtx, vrx) = frame_queue::<u8>(policy);
        let (atx, arx) = frame_queue::<f32>(policy);
        self.video_queue = Some(vtx);
        self.audio_queue = Some(atx);

        self.writers.push(runtime.spawn(run_writer(
            StreamKind::Video,
            video,
            vrx,
            self.video_pool.clone(),
            self.exited.subscribe(),
        )));
        self.writers.push(runtime.spawn(run_writer(
            StreamKind::Audio,
            audio,
            arx,
            self.audio_pool.clone(),
            self.exited.subscribe(),
        )));
    }

    fn forward_stderr(&self, stderr: tokio::process::ChildStderr) {
        let Some(runtime) = &self.runtime else { return };
        let tail = self.stderr_tail.clone();
        runtime.spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(target: "ffmpeg", "{}", line);
                *tail.lock() = Some(line);
            }
        });
    }

    /// Watch the child; an exit before `end` faults the encoder
    fn supervise(&mut self, mut child: tokio::process::Child, fifo: Option<std::path::PathBuf>) {
        let Some(runtime) = &self.runtime else { return };
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let ending = self.ending.clone();
        let fault = self.fault.clone();
        let tail = self.stderr_tail.clone();
        let exited = self.exited.clone();

        let monitor = runtime.spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                Ok(()) = kill_rx => {
                    tracing::warn!("Killing encoder process");
                    let _ = child.kill().await;
                    child.wait().await
                }
            };
            if !ending.load(Ordering::Acquire) {
                let mut msg = match &status {
                    Ok(s) => format!("encoder process exited during recording ({})", s),
                    Err(e) => format!("lost track of encoder process: {}", e),
                };
                if let Some(line) = tail.lock().as_ref() {
                    msg.push_str(": ");
                    msg.push_str(line);
                }
                tracing::error!("{}", msg);
                *fault.lock() = Some(msg);
            }
            if let Some(path) = &fifo {
                release_fifo_writer(path);
            }
            exited.send_replace(true);
            status
        });

        self.child = Some(ChildHandle {
            monitor,
            kill: Some(kill_tx),
        });
    }

    pub fn pool_stats(&self) -> (PoolStats, PoolStats) {
        (self.video_pool.stats(), self.audio_pool.stats())
    }

    fn check_open(&self) -> Result<()> {
        if self.runtime.is_none() {
            return Err(RecorderError::EncoderClosed);
        }
        self.health()
    }

    fn release_current(&mut self) {
        if let Some(buf) = self.current_video.take() {
            self.video_pool.release(buf);
        }
        if let Some((buf, _)) = self.current_audio.take() {
            self.audio_pool.release(buf);
        }
    }

    fn record_video_result(&mut self, result: &Result<()>) {
        if let Err(e) = result {
            self.stats.dropped_frames += 1;
            if matches!(e, RecorderError::QueueFull(_)) {
                tracing::warn!("Video queue full, dropped frame ({} so far)", self.stats.dropped_frames);
            }
        }
    }
}

/// A started ffmpeg process and the pipes it reads
struct Launched {
    child: tokio::process::Child,
    stdin: tokio::process::ChildStdin,
    stderr: Option<tokio::process::ChildStderr>,
    fifo_dir: Option<tempfile::TempDir>,
    fifo: Option<std::path::PathBuf>,
}

/// Create the audio FIFO and start ffmpeg. Must run inside the encoder's
/// runtime context.
fn launch(settings: &EncoderSettings, output_path: &Path) -> Result<Launched> {
    let builder = FfmpegCommandBuilder::new(settings, output_path);

    #[cfg(unix)]
    let (fifo_dir, fifo) = {
        let dir = tempfile::Builder::new().prefix("lockstep-").tempdir()?;
        let fifo = dir.path().join("audio.f32le");
        make_fifo(&fifo)?;
        (Some(dir), Some(fifo))
    };
    #[cfg(not(unix))]
    let (fifo_dir, fifo): (Option<tempfile::TempDir>, Option<std::path::PathBuf>) = {
        tracing::warn!("Pipe backend records video only on this platform");
        (None, None)
    };

    let builder = match &fifo {
        Some(path) => builder.with_audio_input(path.clone()),
        None => builder,
    };
    let args = builder.build();
    tracing::debug!("Spawning {:?} {}", settings.pipe.ffmpeg_path, args.join(" "));

    let mut child = tokio::process::Command::new(&settings.pipe.ffmpeg_path)
        .args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            RecorderError::Subprocess(format!(
                "failed to start {:?}: {}",
                settings.pipe.ffmpeg_path, e
            ))
        })?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| RecorderError::Subprocess("failed to capture ffmpeg stdin".into()))?;
    let stderr = child.stderr.take();

    Ok(Launched {
        child,
        stdin,
        stderr,
        fifo_dir,
        fifo,
    })
}

/// Queue one item, returning its buffer to the pool if it cannot be queued
fn enqueue<T: PipeSample>(
    queue: Option<&QueueSender<T>>,
    pool: &BufferPool<T>,
    kind: StreamKind,
    item: PipeItem<T>,
) -> Result<()> {
    let Some(queue) = queue else {
        if let PipeItem::Frame(buf) = item {
            pool.release(buf);
        }
        return Err(RecorderError::EncoderClosed);
    };
    if matches!(item, PipeItem::Frame(_)) {
        pool.mark_pending();
    }
    let (item, err) = match queue.send(item) {
        Ok(()) => return Ok(()),
        Err(SendFailure::Full(item)) => (item, RecorderError::QueueFull(kind)),
        Err(SendFailure::Closed(item)) => (
            item,
            RecorderError::Subprocess(format!("{} writer has stopped", kind)),
        ),
    };
    if let PipeItem::Frame(buf) = item {
        pool.complete(buf);
    }
    Err(err)
}

/// Reorder interleaved samples from `from` channels to `to` channels in place
fn remap_channels(buf: &mut Vec<f32>, from: usize, to: usize) {
    if from == to || from == 0 || to == 0 {
        return;
    }
    let frames = buf.len() / from;
    if to < from {
        for i in 0..frames {
            for c in 0..to {
                buf[i * to + c] = buf[i * from + c];
            }
        }
        buf.truncate(frames * to);
    } else {
        buf.resize(frames * to, 0.0);
        for i in (0..frames).rev() {
            for c in (0..to).rev() {
                buf[i * to + c] = if c < from { buf[i * from + c] } else { 0.0 };
            }
        }
    }
}

impl MediaEncoder for PipeEncoder {
    fn begin_video(&mut self, width: u32, height: u32) -> Result<usize> {
        self.check_open()?;
        if width != self.width || height != self.height {
            return Err(RecorderError::ResolutionMismatch {
                got_width: width,
                got_height: height,
                want_width: self.width,
                want_height: self.height,
            });
        }
        // rawvideo input has no row padding
        let stride = width as usize * 4;
        let buf = self.video_pool.checkout(stride * height as usize);
        if let Some(old) = self.current_video.replace(buf) {
            self.video_pool.release(old);
        }
        Ok(stride)
    }

    fn video_buffer(&mut self) -> &mut [u8] {
        self.current_video.as_deref_mut().unwrap_or_default()
    }

    fn finish_video(&mut self) -> Result<()> {
        let Some(buf) = self.current_video.take() else {
            return Err(RecorderError::encoder(StreamKind::Video, "finish_video", "no frame prepared"));
        };
        let result = enqueue(
            self.video_queue.as_ref(),
            &self.video_pool,
            StreamKind::Video,
            PipeItem::Frame(buf),
        );
        self.record_video_result(&result);
        if result.is_ok() {
            self.video_started = true;
            self.stats.video_frames += 1;
        }
        result
    }

    fn discard_video(&mut self) {
        if let Some(buf) = self.current_video.take() {
            self.video_pool.release(buf);
        }
        self.stats.dropped_frames += 1;
    }

    fn hold_video(&mut self) -> Result<()> {
        self.check_open()?;
        let item = if self.video_started {
            PipeItem::Repeat
        } else {
            // Nothing to repeat yet; the slot is filled with black
            let mut buf = self
                .video_pool
                .checkout(self.width as usize * self.height as usize * 4);
            buf.fill(0);
            PipeItem::Frame(buf)
        };
        let result = enqueue(self.video_queue.as_ref(), &self.video_pool, StreamKind::Video, item);
        self.record_video_result(&result);
        if result.is_ok() {
            self.video_started = true;
            self.stats.held_frames += 1;
        }
        result
    }

    fn begin_audio(&mut self, channels: usize, samples: usize) -> Result<()> {
        self.check_open()?;
        let buf = self.audio_pool.checkout(channels * samples);
        if let Some((old, _)) = self.current_audio.replace((buf, channels)) {
            self.audio_pool.release(old);
        }
        Ok(())
    }

    fn audio_buffer(&mut self) -> &mut [f32] {
        self.current_audio
            .as_mut()
            .map(|(buf, _)| buf.as_mut_slice())
            .unwrap_or_default()
    }

    fn finish_audio(&mut self) -> Result<()> {
        let Some((mut buf, channels)) = self.current_audio.take() else {
            return Err(RecorderError::encoder(StreamKind::Audio, "finish_audio", "no batch prepared"));
        };
        remap_channels(&mut buf, channels, self.channels);
        let samples = (buf.len() / self.channels) as u64;
        let result = enqueue(
            self.audio_queue.as_ref(),
            &self.audio_pool,
            StreamKind::Audio,
            PipeItem::Frame(buf),
        );
        match &result {
            Ok(()) => self.stats.audio_samples += samples,
            Err(e) => tracing::warn!("Audio batch of {} samples lost: {}", samples, e),
        }
        result
    }

    fn discard_audio(&mut self) {
        if let Some((buf, _)) = self.current_audio.take() {
            self.audio_pool.release(buf);
        }
    }

    fn health(&self) -> Result<()> {
        match self.fault.lock().as_ref() {
            Some(msg) => Err(RecorderError::Subprocess(msg.clone())),
            None => Ok(()),
        }
    }

    fn stats(&self) -> EncoderStats {
        self.stats.clone()
    }

    fn end(&mut self) -> Result<EncoderStats> {
        let runtime = self.runtime.take().ok_or(RecorderError::EncoderClosed)?;
        self.ending.store(true, Ordering::Release);
        self.release_current();

        // Closing the queues lets the writers finish and close the pipes
        self.video_queue = None;
        self.audio_queue = None;

        let writers = std::mem::take(&mut self.writers);
        let child = self.child.take();
        let timeout = self.shutdown_timeout;
        let tail = self.stderr_tail.clone();

        let (bytes, errors) = off_runtime(move || {
            let outcome = runtime.block_on(async move {
                let mut errors = Vec::new();
                let mut bytes = 0u64;
                let deadline = tokio::time::Instant::now() + timeout;

                for writer in writers {
                    match tokio::time::timeout_at(deadline, writer).await {
                        Ok(Ok(Ok(n))) => bytes += n,
                        Ok(Ok(Err(e))) => errors.push(e),
                        Ok(Err(e)) => errors.push(RecorderError::Subprocess(format!(
                            "pipe writer failed: {}",
                            e
                        ))),
                        Err(_) => errors.push(RecorderError::Subprocess(
                            "timed out writing frames to the encoder process".into(),
                        )),
                    }
                }

                if let Some(mut child) = child {
                    let status = match tokio::time::timeout_at(deadline, &mut child.monitor).await {
                        Ok(status) => status,
                        Err(_) => {
                            errors.push(RecorderError::Subprocess(format!(
                                "encoder process still running after {}s, killed",
                                timeout.as_secs()
                            )));
                            if let Some(kill) = child.kill.take() {
                                let _ = kill.send(());
                            }
                            match tokio::time::timeout(KILL_GRACE, &mut child.monitor).await {
                                Ok(status) => status,
                                Err(_) => {
                                    child.monitor.abort();
                                    return (bytes, errors);
                                }
                            }
                        }
                    };
                    match status {
                        Ok(Ok(s)) if s.success() => {}
                        Ok(Ok(s)) => {
                            let detail = tail.lock().clone().unwrap_or_default();
                            errors.push(RecorderError::Subprocess(format!(
                                "encoder process exited with {}: {}",
                                s, detail
                            )));
                        }
                        Ok(Err(e)) => errors.push(RecorderError::Io(e)),
                        Err(e) => errors.push(RecorderError::Subprocess(format!(
                            "encoder monitor failed: {}",
                            e
                        ))),
                    }
                }
                (bytes, errors)
            });
            runtime.shutdown_timeout(Duration::from_secs(1));
            outcome
        });

        self.stats.bytes_written = bytes;
        let (video, audio) = self.pool_stats();
        tracing::info!(
            "Encoder process finished: {} bytes piped, video pool {:?}, audio pool {:?}",
            bytes,
            video,
            audio
        );

        match errors.into_iter().next() {
            Some(e) => Err(e),
            None => Ok(self.stats.clone()),
        }
    }
}

impl Drop for PipeEncoder {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            tracing::warn!("Pipe encoder dropped without end(), output may be incomplete");
            self.ending.store(true, Ordering::Release);
            self.video_queue = None;
            self.audio_queue = None;
            runtime.shutdown_background();
        }
    }
}

fn build_runtime() -> Result<Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("lockstep-pipe")
        .enable_all()
        .build()?)
}

#[cfg(unix)]
fn make_fifo(path: &Path) -> Result<()> {
    use std::os::unix::ffi::OsStrExt;

    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|e| RecorderError::Subprocess(format!("bad FIFO path {:?}: {}", path, e)))?;
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

/// Briefly open the FIFO's read end so a writer blocked in open() returns
fn release_fifo_writer(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        let _ = std::fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path);
    }
    #[cfg(not(unix))]
    let _ = path;
}

async fn child_exited(mut exited: watch::Receiver<bool>) {
    if exited.wait_for(|e| *e).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Drain one queue into one sink.
///
/// Keeps receiving after a write failure so every buffer still returns to the
/// pool and blocked producers are released.
async fn run_writer<T, F, W>(
    kind: StreamKind,
    open: F,
    mut queue: QueueReceiver<T>,
    pool: Arc<BufferPool<T>>,
    exited: watch::Receiver<bool>,
) -> Result<u64>
where
    T: PipeSample,
    F: Future<Output = std::io::Result<W>>,
    W: AsyncWrite + Unpin,
{
    let mut failure: Option<String> = None;
    let mut sink = tokio::select! {
        opened = open => match opened {
            Ok(sink) => Some(sink),
            Err(e) => {
                failure = Some(format!("failed to open {} pipe: {}", kind, e));
                None
            }
        },
        _ = child_exited(exited) => {
            failure = Some(format!("encoder process exited before reading {}", kind));
            None
        }
    };

    let mut scratch = Vec::new();
    let mut last: Option<Vec<T>> = None;
    let mut written = 0u64;

    while let Some(item) = queue.recv().await {
        let frame: &[T] = match item {
            PipeItem::Frame(buf) => {
                if let Some(prev) = last.replace(buf) {
                    pool.complete(prev);
                }
                last.as_deref().unwrap_or_default()
            }
            PipeItem::Repeat => match last.as_deref() {
                Some(buf) => buf,
                None => continue,
            },
        };

        if let Some(s) = sink.as_mut() {
            let bytes = T::pipe_bytes(frame, &mut scratch);
            match s.write_all(bytes).await {
                Ok(()) => written += bytes.len() as u64,
                Err(e) => {
                    tracing::error!("Writing {} to encoder pipe failed: {}", kind, e);
                    failure.get_or_insert(format!("{} pipe write failed: {}", kind, e));
                    sink = None;
                }
            }
        }
    }

    if let Some(prev) = last.take() {
        pool.complete(prev);
    }
    if let Some(mut s) = sink {
        if let Err(e) = s.shutdown().await {
            failure.get_or_insert(format!("closing {} pipe failed: {}", kind, e));
        }
    }

    match failure {
        Some(msg) => Err(RecorderError::Subprocess(msg)),
        None => Ok(written),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl AsyncWrite for SharedSink {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            self.0.lock().extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn settings() -> EncoderSettings {
        EncoderSettings::for_tests(4, 2, 60, 48_000, 2)
    }

    fn write_video(enc: &mut PipeEncoder, value: u8) -> Result<()> {
        enc.begin_video(4, 2)?;
        enc.video_buffer().fill(value);
        enc.finish_video()
    }

    #[test]
    fn test_frames_reach_sinks_in_order() {
        let (video, audio) = (SharedSink::default(), SharedSink::default());
        let mut enc = PipeEncoder::with_sinks(&settings(), video.clone(), audio.clone()).unwrap();

        write_video(&mut enc, 1).unwrap();
        write_video(&mut enc, 2).unwrap();
        enc.hold_video().unwrap();
        write_video(&mut enc, 3).unwrap();

        enc.begin_audio(2, 3).unwrap();
        enc.audio_buffer().copy_from_slice(&[0.5, -0.5, 0.5, -0.5, 0.5, -0.5]);
        enc.finish_audio().unwrap();

        let stats = enc.end().unwrap();
        assert_eq!(stats.video_frames, 3);
        assert_eq!(stats.held_frames, 1);
        assert_eq!(stats.audio_samples, 3);

        let frame = 4 * 2 * 4;
        let bytes = video.0.lock().clone();
        assert_eq!(bytes.len(), 4 * frame);
        assert!(bytes[..frame].iter().all(|b| *b == 1));
        // The held slot repeats frame 2
        assert!(bytes[frame..3 * frame].iter().all(|b| *b == 2));
        assert!(bytes[3 * frame..].iter().all(|b| *b == 3));

        assert_eq!(audio.0.lock().len(), 6 * 4);
        assert_eq!(stats.bytes_written, (4 * frame + 24) as u64);
    }

    #[test]
    fn test_hold_before_first_frame_writes_black() {
        let video = SharedSink::default();
        let mut enc = PipeEncoder::with_sinks(&settings(), video.clone(), SharedSink::default()).unwrap();

        enc.hold_video().unwrap();
        enc.hold_video().unwrap();
        write_video(&mut enc, 7).unwrap();
        let stats = enc.end().unwrap();
        assert_eq!(stats.held_frames, 2);
        assert_eq!(stats.video_frames, 1);

        // Every counted slot is present in the raw stream
        let frame = 4 * 2 * 4;
        let bytes = video.0.lock().clone();
        assert_eq!(bytes.len(), 3 * frame);
        assert!(bytes[..2 * frame].iter().all(|b| *b == 0));
        assert!(bytes[2 * frame..].iter().all(|b| *b == 7));
        let (pool, _) = enc.pool_stats();
        assert_eq!(pool.in_flight, 0);
    }

    #[test]
    fn test_blocking_queue_inside_async_context() {
        let mut s = settings();
        s.pipe.queue = QueuePolicy::Block { max_pending: 1 };
        let host = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let video = SharedSink::default();
        let stats = host.block_on(async {
            let mut enc = PipeEncoder::with_sinks(&s, video.clone(), SharedSink::default()).unwrap();
            for i in 0..30 {
                write_video(&mut enc, i).unwrap();
                if i % 5 == 0 {
                    enc.hold_video().unwrap();
                }
            }
            enc.end().unwrap()
        });

        assert_eq!(stats.video_frames, 30);
        assert_eq!(stats.held_frames, 6);
        assert_eq!(video.0.lock().len(), 36 * 4 * 2 * 4);
    }

    #[test]
    fn test_failed_spawn_inside_async_context() {
        let mut s = settings();
        s.pipe.ffmpeg_path = "/nonexistent/lockstep-ffmpeg".into();
        let dir = tempfile::tempdir().unwrap();
        let host = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let err = host
            .block_on(async { PipeEncoder::spawn(&s, &dir.path().join("out.mp4")).err() })
            .unwrap();
        assert!(matches!(err, RecorderError::Subprocess(_)));
    }

    #[test]
    fn test_pool_closes_after_end() {
        let mut enc =
            PipeEncoder::with_sinks(&settings(), SharedSink::default(), SharedSink::default()).unwrap();
        for i in 0..20 {
            write_video(&mut enc, i).unwrap();
            enc.begin_audio(2, 800).unwrap();
            enc.finish_audio().unwrap();
        }
        // Prepared but never finished
        enc.begin_video(4, 2).unwrap();
        enc.end().unwrap();

        let (video, audio) = enc.pool_stats();
        for stats in [video, audio] {
            assert_eq!(stats.pending, 0);
            assert_eq!(stats.in_flight, 0);
            assert_eq!(stats.available, stats.allocated);
        }
        assert!(video.allocated >= 1);
    }

    #[test]
    fn test_drop_newest_policy_drops_and_recovers_buffers() {
        let mut s = settings();
        s.pipe.queue = QueuePolicy::DropNewest { max_pending: 1 };
        let (writer, reader) = tokio::io::duplex(16);
        let mut enc = PipeEncoder::with_sinks(&s, writer, SharedSink::default()).unwrap();

        let mut full = 0;
        for i in 0..10 {
            match write_video(&mut enc, i) {
                Ok(()) => {}
                Err(RecorderError::QueueFull(StreamKind::Video)) => full += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        // One frame stuck in the writer, one in the queue
        assert!(full >= 8);
        assert_eq!(enc.stats().dropped_frames, full);

        drop(reader);
        assert!(enc.end().is_err());
        let (video, _) = enc.pool_stats();
        assert_eq!(video.pending, 0);
        assert_eq!(video.in_flight, 0);
    }

    #[test]
    fn test_resolution_mismatch_rejected() {
        let mut enc =
            PipeEncoder::with_sinks(&settings(), SharedSink::default(), SharedSink::default()).unwrap();
        assert!(matches!(
            enc.begin_video(8, 8),
            Err(RecorderError::ResolutionMismatch { .. })
        ));
        enc.end().unwrap();
        assert!(matches!(enc.end(), Err(RecorderError::EncoderClosed)));
    }

    #[test]
    fn test_remap_channels() {
        let mut surround: Vec<f32> = (0..12).map(|v| v as f32).collect();
        remap_channels(&mut surround, 6, 2);
        assert_eq!(surround, vec![0.0, 1.0, 6.0, 7.0]);

        let mut mono = vec![0.25, 0.5];
        remap_channels(&mut mono, 1, 2);
        assert_eq!(mono, vec![0.25, 0.0, 0.5, 0.0]);
    }

    #[test]
    fn test_missing_binary_is_reported() {
        let mut s = settings();
        s.pipe.ffmpeg_path = "/nonexistent/lockstep-ffmpeg".into();
        let dir = tempfile::tempdir().unwrap();
        let err = PipeEncoder::spawn(&s, &dir.path().join("out.mp4")).err().unwrap();
        assert!(matches!(err, RecorderError::Subprocess(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_early_exit_faults_encoder() {
        let mut s = settings();
        s.pipe.ffmpeg_path = "true".into();
        s.pipe.shutdown_timeout_secs = 2;
        let dir = tempfile::tempdir().unwrap();
        let mut enc = PipeEncoder::spawn(&s, &dir.path().join("out.mp4")).unwrap();

        let mut faulted = false;
        for _ in 0..100 {
            if enc.health().is_err() {
                faulted = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        assert!(faulted);
        assert!(matches!(write_video(&mut enc, 0), Err(RecorderError::Subprocess(_))));
        // Stop still completes
        let _ = enc.end();
    }
}
