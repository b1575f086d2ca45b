use crate::models::delta::{ParamValue, SceneDelta, MMAP_SIZE, OPTIONS};
use crate::models::error::IprError;
use crate::models::message::ControlMessage;
use crate::models::settings::SessionSetting;
use crate::services::channel::ControlSender;
use crate::services::frame_buffer::{FrameBuffer, FrameBufferDescriptor};
use crate::services::redraw::RedrawWaiter;
use crate::services::render_state::RenderState;
use std::io;
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Name of the viewport camera node every interactive session drives.
pub const VIEWPORT_CAMERA: &str = "__camera";

// Interactive preview renders at reduced resolution for responsiveness:
// above this edge length, the viewport is downscaled by 900 / (max + 600).
const FULL_RES_LIMIT: u32 = 300;
const SCALE_NUMERATOR: f32 = 900.0;
const SCALE_BIAS: f32 = 600.0;

const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[cfg(windows)]
const WORKER_BIN: &str = "barnold-worker.exe";
#[cfg(not(windows))]
const WORKER_BIN: &str = "barnold-worker";

/// Viewport projection, tracked so camera deltas stay sparse.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Projection {
    Perspective { fov: f32 },
    Orthographic { scale: f32 },
}

/// Host-side handle over one interactive preview session: the worker
/// process, the control channel, the shared frame buffer and the redraw
/// waiter thread. `update()` and `stop()` take `&mut self`, so a late send
/// can never race past the stop sentinel.
pub struct Session {
    id: Uuid,
    worker: Child,
    control: Option<ControlSender<ChildStdin>>,
    waiter: Option<JoinHandle<()>>,
    state: RenderState,
    buffer: FrameBuffer,
    requested: (u32, u32),
    generation: u32,
    view_matrix: Option<[[f32; 4]; 4]>,
    projection: Option<Projection>,
    settings: SessionSetting,
    stopped: bool,
}

impl Session {
    /// Launch a session with the user's saved settings. The worker receives
    /// the complete initial scene as its first channel message; `redraw`
    /// runs on the waiter thread once per wake and should only tag the
    /// viewport for a redraw.
    pub fn start<F>(
        initial_scene: SceneDelta,
        width: u32,
        height: u32,
        redraw: F,
    ) -> Result<Session, IprError>
    where
        F: Fn() + Send + 'static,
    {
        Self::with_settings(SessionSetting::load(), initial_scene, width, height, redraw)
    }

    pub fn with_settings<F>(
        settings: SessionSetting,
        initial_scene: SceneDelta,
        width: u32,
        height: u32,
        redraw: F,
    ) -> Result<Session, IprError>
    where
        F: Fn() + Send + 'static,
    {
        let id = Uuid::new_v4();
        let (target_w, target_h) = preview_resolution(width, height);
        let descriptor = FrameBufferDescriptor {
            name: region_name(&id, 0),
            width: target_w,
            height: target_h,
        };
        let buffer = FrameBuffer::create(&descriptor)?;
        let state = match RenderState::create(&id) {
            Ok(state) => state,
            Err(e) => {
                discard_backing(&id, &descriptor);
                return Err(e);
            }
        };

        let spawned = Command::new(worker_executable())
            .arg(format!("--session={id}"))
            .arg(format!("--buffer={}", descriptor.name))
            .arg(format!("--width={target_w}"))
            .arg(format!("--height={target_h}"))
            .arg(format!(
                "--initial-level={}",
                settings.initial_sampling_level
            ))
            .arg(format!("--aa-samples={}", settings.aa_samples))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn();
        let mut worker = match spawned {
            Ok(worker) => worker,
            Err(e) => {
                discard_backing(&id, &descriptor);
                return Err(IprError::Resource(format!(
                    "unable to launch render worker: {e}"
                )));
            }
        };

        let endpoints = worker.stdin.take().zip(worker.stdout.take());
        let Some((stdin, stdout)) = endpoints else {
            let _ = worker.kill();
            let _ = worker.wait();
            discard_backing(&id, &descriptor);
            return Err(IprError::Resource("worker stdio not piped".to_string()));
        };

        let mut control = ControlSender::new(stdin);
        if let Err(e) = control.send(&ControlMessage::Update(initial_scene)) {
            let _ = worker.kill();
            let _ = worker.wait();
            discard_backing(&id, &descriptor);
            return Err(e);
        }

        let waiter = thread::spawn(move || {
            let mut waiter = RedrawWaiter::new(stdout);
            // EOF means the worker is gone; stop()'s join handles the rest
            while let Ok(true) = waiter.wait() {
                redraw();
            }
        });

        Ok(Session {
            id,
            worker,
            control: Some(control),
            waiter: Some(waiter),
            state,
            buffer,
            requested: (width, height),
            generation: 0,
            view_matrix: None,
            projection: None,
            settings,
            stopped: false,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current descriptor and a read-only view of the shared pixels for
    /// the viewport to blit. Never blocks; a torn frame is repaired by the
    /// next wake.
    pub fn framebuffer(&self) -> (&FrameBufferDescriptor, &[f32]) {
        (self.buffer.descriptor(), self.buffer.pixels())
    }

    /// Push one viewport update. When the viewport size changed enough to
    /// move the downsampled target, a fresh region is created and its
    /// name travels in-band inside `delta` so the worker rebinds before
    /// the restarted ramp. An unchanged size re-creates nothing and an
    /// empty delta sends nothing.
    pub fn update(
        &mut self,
        width: u32,
        height: u32,
        mut delta: SceneDelta,
    ) -> Result<(FrameBufferDescriptor, &[f32]), IprError> {
        if self.stopped {
            return Err(IprError::SessionStopped);
        }
        if (width, height) != self.requested {
            self.requested = (width, height);
            let (target_w, target_h) = preview_resolution(width, height);
            let current = self.buffer.descriptor();
            if (target_w, target_h) != (current.width, current.height) {
                self.generation += 1;
                let next = FrameBufferDescriptor {
                    name: region_name(&self.id, self.generation),
                    width: target_w,
                    height: target_h,
                };
                let buffer = FrameBuffer::create(&next)?;
                delta
                    .entry(MMAP_SIZE)
                    .set("name", ParamValue::Str(next.name.clone()))
                    .set("width", ParamValue::Int(target_w as i32))
                    .set("height", ParamValue::Int(target_h as i32));
                let old = std::mem::replace(&mut self.buffer, buffer);
                // the worker's mapping stays valid until it rebinds, so the
                // old file can be retired right away
                if let Err(e) = FrameBuffer::remove_backing(old.descriptor()) {
                    debug!("Unable to retire old region: {e}");
                }
            }
        }
        if !delta.is_empty() {
            match self.control.as_mut() {
                Some(control) => control.send(&ControlMessage::Update(delta))?,
                None => return Err(IprError::ChannelClosed),
            }
        }
        Ok((self.buffer.descriptor().clone(), self.buffer.pixels()))
    }

    /// Diff the viewport camera against the last-known view and return the
    /// sparse delta for it, empty when nothing moved.
    pub fn track_view(&mut self, matrix: [[f32; 4]; 4], projection: Projection) -> SceneDelta {
        let mut delta = SceneDelta::default();
        if self.view_matrix == Some(matrix) && self.projection == Some(projection) {
            return delta;
        }
        let camera = delta.entry(VIEWPORT_CAMERA);
        match projection {
            Projection::Perspective { fov } => {
                camera.node_type = Some("persp_camera".to_string());
                camera.set("fov", ParamValue::Float(fov));
            }
            Projection::Orthographic { scale } => {
                camera.node_type = Some("ortho_camera".to_string());
                camera.set("screen_window_min", ParamValue::Vector2([-scale, scale]));
                camera.set("screen_window_max", ParamValue::Vector2([scale, -scale]));
            }
        }
        camera.set("matrix", ParamValue::Matrix(matrix));
        // the options camera pointer only moves when the projection kind does
        let kind_changed = match self.projection {
            Some(previous) => {
                std::mem::discriminant(&previous) != std::mem::discriminant(&projection)
            }
            None => true,
        };
        if kind_changed {
            delta
                .entry(OPTIONS)
                .set("camera", ParamValue::Node(VIEWPORT_CAMERA.to_string()));
        }
        self.view_matrix = Some(matrix);
        self.projection = Some(projection);
        delta
    }

    /// Tear the session down: flip the abort flag, send the sentinel,
    /// join the worker within the configured timeout (force-terminating a
    /// hung one), join the waiter and release the shared regions. Safe to
    /// call more than once; also runs from `Drop`.
    pub fn stop(&mut self) -> Result<(), IprError> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        self.state.abort();

        if let Some(mut control) = self.control.take() {
            if let Err(e) = control.send(&ControlMessage::Stop) {
                debug!("Worker already unreachable: {e}");
            }
            // dropping the sender closes the worker's stdin
        }

        let timeout = Duration::from_millis(self.settings.join_timeout_ms);
        match join_timeout(&mut self.worker, timeout) {
            Ok(Some(status)) => {
                if !status.success() {
                    error!("Render worker exited abnormally: {status}");
                }
            }
            Ok(None) => {
                warn!("Render worker did not exit within {timeout:?}, terminating");
                let _ = self.worker.kill();
                let _ = self.worker.wait();
            }
            Err(e) => error!("Unable to join render worker: {e}"),
        }

        // the dead worker's stdout is at EOF, so the waiter observes the
        // shutdown and exits
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.join();
        }

        if let Err(e) = FrameBuffer::remove_backing(self.buffer.descriptor()) {
            debug!("Unable to remove frame buffer backing: {e}");
        }
        if let Err(e) = RenderState::remove_backing(&self.id) {
            debug!("Unable to remove state flag backing: {e}");
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!("Error stopping session: {e}");
        }
    }
}

/// Downsampled target for an interactive viewport: full resolution up to
/// 300 px on the longest edge, then scaled by `900 / (max + 600)`.
pub fn preview_resolution(width: u32, height: u32) -> (u32, u32) {
    let longest = width.max(height);
    if longest <= FULL_RES_LIMIT {
        return (width, height);
    }
    let scale = SCALE_NUMERATOR / (longest as f32 + SCALE_BIAS);
    (
        (width as f32 * scale).round() as u32,
        (height as f32 * scale).round() as u32,
    )
}

fn region_name(session: &Uuid, generation: u32) -> String {
    format!("barnold/ipr/{session}-{generation}")
}

// A failed start must not leave mapped files behind.
fn discard_backing(session: &Uuid, descriptor: &FrameBufferDescriptor) {
    let _ = FrameBuffer::remove_backing(descriptor);
    let _ = RenderState::remove_backing(session);
}

fn worker_executable() -> PathBuf {
    if let Ok(path) = std::env::var("BARNOLD_WORKER") {
        return PathBuf::from(path);
    }
    match std::env::current_exe() {
        Ok(exe) => exe.with_file_name(WORKER_BIN),
        Err(_) => PathBuf::from(WORKER_BIN),
    }
}

/// Poll-join with a deadline. `Ok(None)` means the child is still running
/// when the deadline passed.
fn join_timeout(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(JOIN_POLL_INTERVAL);
    }
}
