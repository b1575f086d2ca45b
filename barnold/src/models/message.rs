use crate::models::delta::SceneDelta;
use serde::{Deserialize, Serialize};

/// Control-channel payload, controller to worker. `Stop` is the shutdown
/// sentinel: no more messages will follow it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlMessage {
    Update(SceneDelta),
    Stop,
}

impl ControlMessage {
    pub fn ser(&self) -> Result<Vec<u8>, Box<bincode::ErrorKind>> {
        bincode::serialize(self)
    }

    pub fn de(data: &[u8]) -> Result<Self, Box<bincode::ErrorKind>> {
        bincode::deserialize(data)
    }
}
