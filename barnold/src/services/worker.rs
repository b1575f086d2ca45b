use crate::models::delta::{NodeDelta, ParamValue, SceneDelta, MMAP_SIZE, OPTIONS};
use crate::models::error::IprError;
use crate::models::message::ControlMessage;
use crate::services::channel::ControlReceiver;
use crate::services::frame_buffer::{FrameBuffer, FrameBufferDescriptor};
use crate::services::redraw::RedrawSignal;
use crate::services::render_state::RenderState;
use arnold::{NodeId, Render, RenderOutcome, TileAction, TileEvent, Value};
use std::collections::HashMap;
use std::io::Write;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Startup parameters handed to the worker process on its command line.
/// The complete initial scene arrives as the first channel message.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub session: Uuid,
    pub buffer: FrameBufferDescriptor,
    pub initial_sampling_level: i32,
    pub aa_samples: i32,
}

/// Progressive refinement ramp: every integer level in `initial..end`,
/// where `end` tracks the options delta's `AA_samples + 1`.
#[derive(Debug, Clone, Copy)]
struct SampleWindow {
    initial: i32,
    end: i32,
}

impl SampleWindow {
    fn new(initial: i32, aa_samples: i32) -> Self {
        SampleWindow {
            initial,
            end: aa_samples + 1,
        }
    }

    fn levels(&self) -> std::ops::Range<i32> {
        self.initial..self.end
    }
}

enum RampExit {
    /// Every level rendered to completion.
    Finished,
    /// The channel has pending data; coalesce and restart the ramp.
    NewInput,
    /// The state flag flipped; shut down.
    Aborted,
}

/// Worker-side state machine: drains the control channel, applies deltas
/// to live renderer nodes, drives the sample ramp, and streams finished
/// tiles into the shared frame buffer.
pub struct Worker<'a, R: Render, W: Write> {
    renderer: &'a mut R,
    channel: ControlReceiver,
    signal: RedrawSignal<W>,
    state: RenderState,
    buffer: FrameBuffer,
    nodes: HashMap<String, NodeId>,
    window: SampleWindow,
}

impl<'a, R: Render, W: Write> Worker<'a, R, W> {
    pub fn new(
        renderer: &'a mut R,
        channel: ControlReceiver,
        signal: RedrawSignal<W>,
        config: WorkerConfig,
    ) -> Result<Self, IprError> {
        let state = RenderState::open(&config.session)?;
        let buffer = FrameBuffer::open(&config.buffer)?;
        let mut nodes = HashMap::new();
        nodes.insert(OPTIONS.to_string(), renderer.options());
        Ok(Worker {
            renderer,
            channel,
            signal,
            state,
            buffer,
            nodes,
            window: SampleWindow::new(config.initial_sampling_level, config.aa_samples),
        })
    }

    pub fn run(mut self) -> Result<(), IprError> {
        // Starting: the first message must be the complete initial scene.
        let initial = match self.channel.receive() {
            Ok(ControlMessage::Update(delta)) => delta,
            Ok(ControlMessage::Stop) => return Ok(()),
            Err(_) => {
                info!("Control channel closed before the initial scene arrived");
                return Ok(());
            }
        };
        self.apply(initial);
        // the launch resolution is authoritative over whatever the host put
        // in the initial options
        self.sync_resolution();

        loop {
            if let RampExit::Aborted = self.render_ramp()? {
                break;
            }
            match self.coalesce() {
                Ok(Some(delta)) => self.apply(delta),
                Ok(None) => break,
                Err(IprError::ChannelClosed) => {
                    info!("Control channel closed; shutting down");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        info!("Render worker stopping");
        Ok(())
    }

    /// Rendering state: walk the sample window, re-checking the abort flag
    /// between levels and the channel inside the tile callback.
    fn render_ramp(&mut self) -> Result<RampExit, IprError> {
        for level in self.window.levels() {
            if self.state.is_aborted() {
                return Ok(RampExit::Aborted);
            }
            let options = self.renderer.options();
            if let Err(e) = self.renderer.set_param(options, "AA_samples", Value::Int(level)) {
                warn!(level, "Unable to set sampling level: {e}");
            }

            let Worker {
                renderer,
                channel,
                signal,
                state,
                buffer,
                ..
            } = self;
            let outcome = renderer.render(&mut |event| match event {
                TileEvent::Begin { .. } => {
                    if state.is_aborted() || channel.poll() {
                        TileAction::Interrupt
                    } else {
                        TileAction::Continue
                    }
                }
                TileEvent::Done {
                    x,
                    y,
                    width,
                    height,
                    pixels,
                } => {
                    if state.is_aborted() || channel.poll() {
                        // abandon the pending tile so the edit feels live
                        return TileAction::Interrupt;
                    }
                    buffer.write_tile(x, y, width, height, pixels);
                    if let Err(e) = signal.set() {
                        debug!("Redraw wake lost: {e}");
                    }
                    TileAction::Continue
                }
            });

            match outcome {
                Ok(RenderOutcome::Completed) => debug!(level, "Sample level complete"),
                Ok(RenderOutcome::Interrupted) => {
                    return Ok(if self.state.is_aborted() {
                        RampExit::Aborted
                    } else {
                        RampExit::NewInput
                    });
                }
                Err(e) => return Err(IprError::RenderFatal(e.to_string())),
            }
        }
        Ok(RampExit::Finished)
    }

    /// Idle state: block for the next delta, then fold in everything queued
    /// behind it so a burst of edits costs one re-render, not one each.
    /// `None` means the stop sentinel arrived.
    fn coalesce(&mut self) -> Result<Option<SceneDelta>, IprError> {
        let mut delta = match self.channel.receive()? {
            ControlMessage::Update(delta) => delta,
            ControlMessage::Stop => return Ok(None),
        };
        // The drain is deliberately uncapped: the producer is a human-paced
        // viewport, not a firehose.
        while self.channel.poll() {
            match self.channel.receive()? {
                ControlMessage::Update(next) => delta.merge(next),
                ControlMessage::Stop => return Ok(None),
            }
        }
        Ok(Some(delta))
    }

    /// Apply one (possibly coalesced) delta. Per-node failures log and
    /// skip; they never abort the rest of the delta.
    fn apply(&mut self, mut delta: SceneDelta) {
        // resize first, so every tile of the restarted ramp lands in the
        // new region
        if let Some(resize) = delta.targets.remove(MMAP_SIZE) {
            self.rebind(&resize);
        }

        let mut deferred: Vec<(String, NodeId, String, ParamValue)> = Vec::new();

        // options steer resolution and sampling, so they go first
        if let Some(options) = delta.targets.remove(OPTIONS) {
            self.apply_node(OPTIONS, &options, &mut deferred);
        }
        for (name, node) in &delta.targets {
            self.apply_node(name, node, &mut deferred);
        }

        // second pass: every node named in the delta now exists, so links
        // and node pointers resolve regardless of map order
        for (name, id, param, value) in deferred {
            match self.resolve(&value) {
                Ok(value) => {
                    if let Err(e) = self.renderer.set_param(id, &param, value) {
                        warn!(node = %name, param = %param, "Parameter rejected, skipping: {e}");
                    }
                }
                Err(missing) => {
                    warn!(node = %name, param = %param, "Link target '{missing}' not live, skipping");
                }
            }
        }
    }

    fn apply_node(
        &mut self,
        name: &str,
        node: &NodeDelta,
        deferred: &mut Vec<(String, NodeId, String, ParamValue)>,
    ) {
        let id = match self.nodes.get(name).copied() {
            Some(id) => id,
            None => {
                let Some(type_name) = &node.node_type else {
                    warn!(node = %name, "No live node and no type to create one, skipping");
                    return;
                };
                match self.renderer.create_node(type_name) {
                    Ok(id) => {
                        self.nodes.insert(name.to_string(), id);
                        id
                    }
                    Err(e) => {
                        warn!(node = %name, "Unable to create node, skipping: {e}");
                        return;
                    }
                }
            }
        };

        for (param, value) in &node.params {
            if name == OPTIONS && param == "AA_samples" {
                if let ParamValue::Int(aa_samples) = value {
                    // the ramp's end tracks the requested quality
                    self.window = SampleWindow::new(self.window.initial, *aa_samples);
                }
            }
            if value.is_deferred() {
                deferred.push((name.to_string(), id, param.clone(), value.clone()));
                continue;
            }
            match self.resolve(value) {
                Ok(value) => {
                    if let Err(e) = self.renderer.set_param(id, param, value) {
                        warn!(node = %name, param = %param, "Parameter rejected, skipping: {e}");
                    }
                }
                Err(missing) => {
                    warn!(node = %name, param = %param, "Link target '{missing}' not live, skipping");
                }
            }
        }
    }

    /// Switch to a freshly created frame-buffer region. The old mapping
    /// stays valid until it drops here, so a failed rebind keeps the
    /// session drawing into the previous region instead of crashing.
    fn rebind(&mut self, resize: &NodeDelta) {
        let name = match resize.params.get("name") {
            Some(ParamValue::Str(name)) => name.clone(),
            _ => {
                warn!("Resize entry without a region name, ignoring");
                return;
            }
        };
        let (Some(ParamValue::Int(width)), Some(ParamValue::Int(height))) =
            (resize.params.get("width"), resize.params.get("height"))
        else {
            warn!("Resize entry without dimensions, ignoring");
            return;
        };
        let descriptor = FrameBufferDescriptor {
            name,
            width: *width as u32,
            height: *height as u32,
        };
        match FrameBuffer::open(&descriptor) {
            Ok(buffer) => {
                info!(width = *width, height = *height, "Rebound frame buffer");
                self.buffer = buffer;
                self.sync_resolution();
            }
            Err(e) => error!("Unable to open resized frame buffer, keeping the old region: {e}"),
        }
    }

    /// Keep the renderer's output resolution in step with the region the
    /// tiles land in.
    fn sync_resolution(&mut self) {
        let options = self.renderer.options();
        let descriptor = self.buffer.descriptor();
        let (width, height) = (descriptor.width as i32, descriptor.height as i32);
        for (param, value) in [("xres", width), ("yres", height)] {
            if let Err(e) = self.renderer.set_param(options, param, Value::Int(value)) {
                warn!(param, "Unable to sync resolution: {e}");
            }
        }
    }

    /// Wire value to renderer value; `Err` carries the name of a link
    /// target that is not live.
    fn resolve(&self, value: &ParamValue) -> Result<Value, String> {
        Ok(match value {
            ParamValue::Bool(v) => Value::Bool(*v),
            ParamValue::Byte(v) => Value::Byte(*v),
            ParamValue::Int(v) => Value::Int(*v),
            ParamValue::Float(v) => Value::Float(*v),
            ParamValue::Rgb(v) => Value::Rgb(*v),
            ParamValue::Rgba(v) => Value::Rgba(*v),
            ParamValue::Vector(v) => Value::Vector(*v),
            ParamValue::Vector2(v) => Value::Vector2(*v),
            ParamValue::Str(v) => Value::Str(v.clone()),
            ParamValue::Matrix(v) => Value::Matrix(*v),
            ParamValue::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.resolve(item))
                    .collect::<Result<_, _>>()?,
            ),
            ParamValue::Link(name) => Value::Link(self.lookup(name)?),
            ParamValue::Node(name) => Value::Node(self.lookup(name)?),
        })
    }

    fn lookup(&self, name: &str) -> Result<NodeId, String> {
        self.nodes
            .get(name)
            .copied()
            .ok_or_else(|| name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arnold::RenderError;
    use std::sync::mpsc;

    /// Every message is queued before the worker runs, so the state
    /// machine's decisions are fully deterministic: `poll()` is exact over
    /// a plain in-process queue, and dropping the sender stands in for a
    /// closed transport.
    fn queued(messages: Vec<ControlMessage>) -> ControlReceiver {
        let (tx, rx) = mpsc::channel();
        for message in messages {
            tx.send(message).unwrap();
        }
        ControlReceiver::from_queue(rx)
    }

    /// Records every command and pretends each pass is a single tile.
    struct RecordingRenderer {
        options: NodeId,
        next_id: u64,
        created: Vec<(NodeId, String)>,
        params: Vec<(NodeId, String, Value)>,
        render_calls: u32,
    }

    impl RecordingRenderer {
        fn new() -> Self {
            RecordingRenderer {
                options: NodeId::from_raw(1),
                next_id: 2,
                created: Vec::new(),
                params: Vec::new(),
                render_calls: 0,
            }
        }

        fn id_of(&self, type_name: &str) -> NodeId {
            self.created
                .iter()
                .find(|(_, t)| t == type_name)
                .map(|(id, _)| *id)
                .expect("node was never created")
        }

        fn params_named<'s>(&'s self, name: &str) -> Vec<&'s (NodeId, String, Value)> {
            self.params.iter().filter(|(_, n, _)| n == name).collect()
        }
    }

    impl Render for RecordingRenderer {
        fn options(&self) -> NodeId {
            self.options
        }

        fn create_node(&mut self, type_name: &str) -> Result<NodeId, RenderError> {
            if type_name == "bogus" {
                return Err(RenderError::UnknownNodeType(type_name.to_string()));
            }
            let id = NodeId::from_raw(self.next_id);
            self.next_id += 1;
            self.created.push((id, type_name.to_string()));
            Ok(id)
        }

        fn set_param(&mut self, node: NodeId, name: &str, value: Value) -> Result<(), RenderError> {
            if name == "rejected" {
                return Err(RenderError::BadParam {
                    name: name.to_string(),
                    reason: "test".to_string(),
                });
            }
            self.params.push((node, name.to_string(), value));
            Ok(())
        }

        fn render(
            &mut self,
            on_tile: &mut (dyn FnMut(TileEvent<'_>) -> TileAction + '_),
        ) -> Result<RenderOutcome, RenderError> {
            self.render_calls += 1;
            let begin = TileEvent::Begin {
                x: 0,
                y: 0,
                width: 2,
                height: 2,
            };
            if on_tile(begin) == TileAction::Interrupt {
                return Ok(RenderOutcome::Interrupted);
            }
            let pixels = [0.25f32; 2 * 2 * 4];
            let done = TileEvent::Done {
                x: 0,
                y: 0,
                width: 2,
                height: 2,
                pixels: &pixels,
            };
            if on_tile(done) == TileAction::Interrupt {
                return Ok(RenderOutcome::Interrupted);
            }
            Ok(RenderOutcome::Completed)
        }
    }

    struct Rig {
        session: Uuid,
        descriptor: FrameBufferDescriptor,
        config: WorkerConfig,
        _controller_side: FrameBuffer,
    }

    impl Rig {
        /// Controller-side resources a worker needs to attach to.
        fn new(initial_level: i32, aa_samples: i32) -> Self {
            let session = Uuid::new_v4();
            let descriptor = FrameBufferDescriptor {
                name: format!("barnold/ipr/{session}-0"),
                width: 8,
                height: 8,
            };
            let controller_side = FrameBuffer::create(&descriptor).unwrap();
            let _state = RenderState::create(&session).unwrap();
            Rig {
                session,
                descriptor: descriptor.clone(),
                config: WorkerConfig {
                    session,
                    buffer: descriptor,
                    initial_sampling_level: initial_level,
                    aa_samples,
                },
                _controller_side: controller_side,
            }
        }
    }

    impl Drop for Rig {
        fn drop(&mut self) {
            let _ = FrameBuffer::remove_backing(&self.descriptor);
            let _ = RenderState::remove_backing(&self.session);
        }
    }

    fn camera_delta(matrix_seed: f32) -> SceneDelta {
        let mut delta = SceneDelta::default();
        let mut matrix = [[0.0f32; 4]; 4];
        matrix[3][0] = matrix_seed;
        delta
            .entry("__camera")
            .set("matrix", ParamValue::Matrix(matrix));
        delta
    }

    fn initial_scene() -> SceneDelta {
        let mut delta = SceneDelta::default();
        delta.entry(OPTIONS).set("AA_samples", ParamValue::Int(0));
        *delta.entry("__camera") = NodeDelta::with_type("persp_camera");
        delta
            .entry("__camera")
            .set("matrix", ParamValue::Matrix([[0.0; 4]; 4]));
        delta
            .entry(OPTIONS)
            .set("camera", ParamValue::Node("__camera".into()));
        delta
    }

    #[test]
    fn burst_of_edits_applies_once_at_the_merged_value() {
        let rig = Rig::new(0, 0);
        // five rapid camera edits queued behind the initial scene; the
        // dropped sender ends the run once the queue drains
        let mut messages = vec![ControlMessage::Update(initial_scene())];
        for seed in 1..=5 {
            messages.push(ControlMessage::Update(camera_delta(seed as f32)));
        }
        let channel = queued(messages);
        let signal = RedrawSignal::new(Vec::<u8>::new());

        let mut renderer = RecordingRenderer::new();
        let worker = Worker::new(&mut renderer, channel, signal, rig.config.clone()).unwrap();
        worker.run().unwrap();

        let camera = renderer.id_of("persp_camera");
        let matrices: Vec<_> = renderer
            .params
            .iter()
            .filter(|(id, name, _)| *id == camera && name == "matrix")
            .collect();
        // one from the initial scene, then exactly one merged edit
        assert_eq!(matrices.len(), 2);
        let mut expected = [[0.0f32; 4]; 4];
        expected[3][0] = 5.0;
        assert_eq!(matrices[1].2, Value::Matrix(expected));

        // first ramp was interrupted by the queued burst, second ramp ran
        // the single level to completion: never one render per edit
        assert_eq!(renderer.render_calls, 2);
    }

    #[test]
    fn links_resolve_regardless_of_delta_order() {
        let rig = Rig::new(0, 0);
        // "aaa_surface" sorts before its link target "zzz_image"
        let mut scene = initial_scene();
        *scene.entry("aaa_surface") = NodeDelta::with_type("standard_surface");
        scene
            .entry("aaa_surface")
            .set("base_color", ParamValue::Link("zzz_image".into()));
        *scene.entry("zzz_image") = NodeDelta::with_type("image");

        let channel = queued(vec![ControlMessage::Update(scene)]);
        let signal = RedrawSignal::new(Vec::<u8>::new());

        let mut renderer = RecordingRenderer::new();
        let worker = Worker::new(&mut renderer, channel, signal, rig.config.clone()).unwrap();
        worker.run().unwrap();

        let surface = renderer.id_of("standard_surface");
        let image = renderer.id_of("image");
        let links = renderer.params_named("base_color");
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].0, surface);
        assert_eq!(links[0].2, Value::Link(image));

        // the options camera pointer resolved the same way
        let cameras = renderer.params_named("camera");
        assert_eq!(cameras[0].2, Value::Node(renderer.id_of("persp_camera")));
    }

    #[test]
    fn bad_nodes_are_skipped_without_losing_the_rest() {
        let rig = Rig::new(0, 0);
        let mut scene = initial_scene();
        *scene.entry("broken") = NodeDelta::with_type("bogus");
        scene.entry("broken").set("radius", ParamValue::Float(1.0));
        scene
            .entry("__camera")
            .set("rejected", ParamValue::Float(1.0));
        *scene.entry("lamp") = NodeDelta::with_type("point_light");
        scene.entry("lamp").set("intensity", ParamValue::Float(3.0));

        let channel = queued(vec![ControlMessage::Update(scene), ControlMessage::Stop]);
        let signal = RedrawSignal::new(Vec::<u8>::new());

        let mut renderer = RecordingRenderer::new();
        let worker = Worker::new(&mut renderer, channel, signal, rig.config.clone()).unwrap();
        worker.run().unwrap();

        // the failing node and parameter vanished, the rest applied
        assert!(renderer.created.iter().all(|(_, t)| t != "bogus"));
        assert!(renderer.params_named("rejected").is_empty());
        assert_eq!(renderer.params_named("intensity").len(), 1);
    }

    #[test]
    fn resize_entry_rebinds_the_frame_buffer() {
        let rig = Rig::new(0, 0);
        let session = rig.session;
        let next_descriptor = FrameBufferDescriptor {
            name: format!("barnold/ipr/{session}-1"),
            width: 4,
            height: 4,
        };
        let _next_region = FrameBuffer::create(&next_descriptor).unwrap();

        let mut resize = SceneDelta::default();
        resize
            .entry(MMAP_SIZE)
            .set("name", ParamValue::Str(next_descriptor.name.clone()))
            .set("width", ParamValue::Int(4))
            .set("height", ParamValue::Int(4));

        let channel = queued(vec![
            ControlMessage::Update(initial_scene()),
            ControlMessage::Update(resize),
        ]);
        let signal = RedrawSignal::new(Vec::<u8>::new());

        let mut renderer = RecordingRenderer::new();
        let worker = Worker::new(&mut renderer, channel, signal, rig.config.clone()).unwrap();
        worker.run().unwrap();

        // resolution followed the rebind: 8x8 at start, 4x4 after
        let xres: Vec<_> = renderer.params_named("xres");
        assert_eq!(xres.first().map(|(_, _, v)| v), Some(&Value::Int(8)));
        assert_eq!(xres.last().map(|(_, _, v)| v), Some(&Value::Int(4)));

        let _ = FrameBuffer::remove_backing(&next_descriptor);
    }

    #[test]
    fn abort_flag_ends_the_run_between_levels() {
        let rig = Rig::new(-3, 4);
        // flip the shared flag before the worker starts rendering
        let controller_state = RenderState::open(&rig.session).unwrap();
        controller_state.abort();

        let channel = queued(vec![ControlMessage::Update(initial_scene())]);
        let signal = RedrawSignal::new(Vec::<u8>::new());

        let mut renderer = RecordingRenderer::new();
        let worker = Worker::new(&mut renderer, channel, signal, rig.config.clone()).unwrap();
        worker.run().unwrap();

        assert_eq!(renderer.render_calls, 0);
    }
}
