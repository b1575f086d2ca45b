use crate::value::Value;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque handle to a live renderer node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(u64);

impl NodeId {
    pub fn from_raw(raw: u64) -> Self {
        NodeId(raw)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

/// Tile callback event. `Begin` is the null-buffer case of the display
/// callback (tile about to start); `Done` delivers the finished pixels.
#[derive(Debug)]
pub enum TileEvent<'a> {
    Begin {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },
    /// `pixels` holds `width * height * 4` floats, row-major RGBA. The
    /// slice is only valid for the duration of the callback; the renderer
    /// reclaims the backing buffer afterwards.
    Done {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        pixels: &'a [f32],
    },
}

/// Callback answer: keep going, or abort the current pass mid-frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileAction {
    Continue,
    Interrupt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderOutcome {
    /// The pass ran to natural completion.
    Completed,
    /// The callback asked for an interrupt before the pass finished.
    Interrupted,
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Unknown node type: {0}")]
    UnknownNodeType(String),
    #[error("No live node for handle {0:?}")]
    UnknownNode(NodeId),
    #[error("Parameter {name} rejected: {reason}")]
    BadParam { name: String, reason: String },
    #[error("Renderer internal error: {0}")]
    Fatal(String),
}

/// Command interface over the renderer instance. One implementation wraps
/// the real SDK; [`crate::PreviewRenderer`] is the software stand-in.
///
/// A render pass always runs at the sampling level currently stored in the
/// global options node (`AA_samples`), which is how the progressive
/// refinement ramp drives quality.
pub trait Render {
    /// Handle of the global options node. Always live.
    fn options(&self) -> NodeId;

    fn create_node(&mut self, type_name: &str) -> Result<NodeId, RenderError>;

    fn set_param(&mut self, node: NodeId, name: &str, value: Value) -> Result<(), RenderError>;

    /// Drive one pass, delivering tiles through `on_tile` as they start and
    /// finish. Returns whether the pass completed or was interrupted.
    fn render(
        &mut self,
        on_tile: &mut (dyn FnMut(TileEvent<'_>) -> TileAction + '_),
    ) -> Result<RenderOutcome, RenderError>;
}
