// incremental scene-edit payloads and their merge rules
pub mod delta;

// session error taxonomy
pub mod error;

// control-channel message frames
pub mod message;

// user-tunable session configuration
pub mod settings;
