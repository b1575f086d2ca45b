/*
    Interactive preview render (IPR) pipeline.

    The host viewport talks to a render worker process through three
    OS-level primitives: an ordered control channel riding the worker's
    stdin, a shared memory-mapped frame buffer the worker streams tiles
    into, and a redraw wake riding the worker's stdout. The Session struct
    in services::session owns the whole arrangement from the host side;
    the barnold-worker binary is the other end.
*/
pub mod models;
pub mod services;

pub use models::delta::{NodeDelta, ParamValue, SceneDelta};
pub use models::error::IprError;
pub use services::session::{Projection, Session};
