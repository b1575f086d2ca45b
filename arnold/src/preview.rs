use crate::render::{NodeId, Render, RenderError, RenderOutcome, TileAction, TileEvent};
use crate::value::Value;
use std::collections::HashMap;
use tracing::debug;

// Matches the renderer's default bucket size.
const TILE_SIZE: u32 = 64;

const OPTIONS_TYPE: &str = "options";

struct NodeData {
    type_name: String,
    params: HashMap<String, Value>,
}

/// Deterministic software renderer behind the [`Render`] seam.
///
/// Shades a gradient tinted by the active camera's position, with a grain
/// term that fades as the sampling level climbs, so progressive refinement
/// and scene edits are both observable without the SDK being present.
pub struct PreviewRenderer {
    nodes: HashMap<NodeId, NodeData>,
    options: NodeId,
    next_id: u64,
}

impl PreviewRenderer {
    pub fn new() -> Self {
        let options = NodeId::from_raw(1);
        let mut nodes = HashMap::new();
        nodes.insert(
            options,
            NodeData {
                type_name: OPTIONS_TYPE.to_string(),
                params: HashMap::new(),
            },
        );
        PreviewRenderer {
            nodes,
            options,
            next_id: 2,
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn int_param(&self, node: NodeId, name: &str) -> Option<i32> {
        match self.nodes.get(&node)?.params.get(name)? {
            Value::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// Tint derived from the camera the options node points at. Moving the
    /// camera visibly changes the image, which is all the preview needs.
    fn camera_tint(&self) -> [f32; 3] {
        let camera = match self.nodes.get(&self.options).and_then(|n| n.params.get("camera")) {
            Some(Value::Node(camera)) => *camera,
            _ => return [1.0, 1.0, 1.0],
        };
        let node = match self.nodes.get(&camera) {
            Some(node) if node.type_name.ends_with("_camera") => node,
            _ => return [1.0, 1.0, 1.0],
        };
        let matrix = match node.params.get("matrix") {
            Some(Value::Matrix(matrix)) => matrix,
            _ => return [1.0, 1.0, 1.0],
        };
        let translation = matrix[3];
        [
            0.5 + (translation[0] * 0.125).sin().abs() * 0.5,
            0.5 + (translation[1] * 0.125).sin().abs() * 0.5,
            0.5 + (translation[2] * 0.125).sin().abs() * 0.5,
        ]
    }
}

impl Default for PreviewRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Render for PreviewRenderer {
    fn options(&self) -> NodeId {
        self.options
    }

    fn create_node(&mut self, type_name: &str) -> Result<NodeId, RenderError> {
        if type_name.is_empty() {
            return Err(RenderError::UnknownNodeType(type_name.to_string()));
        }
        let id = NodeId::from_raw(self.next_id);
        self.next_id += 1;
        self.nodes.insert(
            id,
            NodeData {
                type_name: type_name.to_string(),
                params: HashMap::new(),
            },
        );
        Ok(id)
    }

    fn set_param(&mut self, node: NodeId, name: &str, value: Value) -> Result<(), RenderError> {
        match &value {
            Value::Link(target) | Value::Node(target) => {
                if !self.nodes.contains_key(target) {
                    return Err(RenderError::BadParam {
                        name: name.to_string(),
                        reason: format!("dangling reference {target:?}"),
                    });
                }
            }
            _ => {}
        }
        let data = self
            .nodes
            .get_mut(&node)
            .ok_or(RenderError::UnknownNode(node))?;
        data.params.insert(name.to_string(), value);
        Ok(())
    }

    fn render(
        &mut self,
        on_tile: &mut (dyn FnMut(TileEvent<'_>) -> TileAction + '_),
    ) -> Result<RenderOutcome, RenderError> {
        let width = self.int_param(self.options, "xres").unwrap_or(0).max(0) as u32;
        let height = self.int_param(self.options, "yres").unwrap_or(0).max(0) as u32;
        if width == 0 || height == 0 {
            return Ok(RenderOutcome::Completed);
        }
        let level = self.int_param(self.options, "AA_samples").unwrap_or(0);
        let tint = self.camera_tint();
        let grain = grain_amplitude(level);
        debug!(width, height, level, "Preview pass");

        let mut y = 0;
        while y < height {
            let tile_h = TILE_SIZE.min(height - y);
            let mut x = 0;
            while x < width {
                let tile_w = TILE_SIZE.min(width - x);
                let begin = TileEvent::Begin {
                    x,
                    y,
                    width: tile_w,
                    height: tile_h,
                };
                if on_tile(begin) == TileAction::Interrupt {
                    return Ok(RenderOutcome::Interrupted);
                }

                let mut pixels = vec![0.0f32; (tile_w * tile_h * 4) as usize];
                for row in 0..tile_h {
                    for col in 0..tile_w {
                        let px = x + col;
                        let py = y + row;
                        let u = (px as f32 + 0.5) / width as f32;
                        let v = (py as f32 + 0.5) / height as f32;
                        let idx = ((row * tile_w + col) * 4) as usize;
                        pixels[idx] = (0.15 + 0.7 * u) * tint[0] + grain * (hash01(px, py, level) - 0.5);
                        pixels[idx + 1] =
                            (0.15 + 0.7 * v) * tint[1] + grain * (hash01(py, px, level) - 0.5);
                        pixels[idx + 2] =
                            0.35 * tint[2] + grain * (hash01(px ^ py, px, level) - 0.5);
                        pixels[idx + 3] = 1.0;
                    }
                }

                let done = TileEvent::Done {
                    x,
                    y,
                    width: tile_w,
                    height: tile_h,
                    pixels: &pixels,
                };
                if on_tile(done) == TileAction::Interrupt {
                    return Ok(RenderOutcome::Interrupted);
                }
                x += tile_w;
            }
            y += tile_h;
        }
        Ok(RenderOutcome::Completed)
    }
}

// Grain shrinks as the sampling level climbs; levels start negative.
fn grain_amplitude(level: i32) -> f32 {
    0.25 / (level + 5).max(1) as f32
}

fn hash01(x: u32, y: u32, level: i32) -> f32 {
    let mut state = x
        .wrapping_mul(0x9E37_79B9)
        .wrapping_add(y.wrapping_mul(0x85EB_CA6B))
        .wrapping_add(level as u32);
    state ^= state >> 15;
    state = state.wrapping_mul(0x2C1B_3C6D);
    state ^= state >> 12;
    state = state.wrapping_mul(0x297A_2D39);
    state ^= state >> 15;
    state as f32 / u32::MAX as f32
}
