// ordered control channel over the worker's stdin
pub mod channel;

// shared memory-mapped frame buffer
pub mod frame_buffer;

// cross-process redraw wake over the worker's stdout
pub mod redraw;

// cross-process RUNNING/ABORT flag
pub mod render_state;

// host-side session: owns the worker's lifecycle
pub mod session;

// worker-side state machine
pub mod worker;
