use crate::models::error::IprError;
use crate::models::message::ControlMessage;
use std::io::{BufReader, Read, Write};
use std::sync::mpsc::{self, TryRecvError};
use std::thread;
use tracing::error;

/*
    Single-producer/single-consumer, ordered, unbounded. Frames are a
    little-endian u32 length prefix followed by a bincode payload, riding
    the worker's stdin pipe. The receiving side decodes on a dedicated
    reader thread so the render loop gets a non-blocking poll() and a
    blocking receive() without ever touching the pipe directly.
*/

/// Controller-side send endpoint.
pub struct ControlSender<W: Write> {
    sink: W,
}

impl<W: Write> ControlSender<W> {
    pub fn new(sink: W) -> Self {
        ControlSender { sink }
    }

    /// Send one message. Any transport failure means the peer is gone.
    pub fn send(&mut self, message: &ControlMessage) -> Result<(), IprError> {
        let data = message.ser()?;
        let frame = (data.len() as u32).to_le_bytes();
        self.sink
            .write_all(&frame)
            .and_then(|_| self.sink.write_all(&data))
            .and_then(|_| self.sink.flush())
            .map_err(|_| IprError::ChannelClosed)
    }
}

/// Worker-side receive endpoint with one-message lookahead, so `poll()`
/// can probe readiness without losing anything.
pub struct ControlReceiver {
    queue: mpsc::Receiver<ControlMessage>,
    lookahead: Option<ControlMessage>,
}

impl ControlReceiver {
    /// Spawn the reader thread over the transport's read end.
    pub fn spawn<R: Read + Send + 'static>(source: R) -> Self {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut source = BufReader::new(source);
            loop {
                let mut prefix = [0u8; 4];
                if source.read_exact(&mut prefix).is_err() {
                    break; // EOF: the controller closed the channel
                }
                let len = u32::from_le_bytes(prefix) as usize;
                let mut data = vec![0u8; len];
                if source.read_exact(&mut data).is_err() {
                    break;
                }
                match ControlMessage::de(&data) {
                    Ok(message) => {
                        if tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Corrupt control frame: {e}");
                        break;
                    }
                }
            }
        });
        ControlReceiver {
            queue: rx,
            lookahead: None,
        }
    }

    /// Non-blocking: is a message ready right now? A closed channel has no
    /// message ready; closure surfaces from the next blocking `receive()`.
    pub fn poll(&mut self) -> bool {
        if self.lookahead.is_some() {
            return true;
        }
        match self.queue.try_recv() {
            Ok(message) => {
                self.lookahead = Some(message);
                true
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => false,
        }
    }

    /// Blocking receive, in send order.
    pub fn receive(&mut self) -> Result<ControlMessage, IprError> {
        if let Some(message) = self.lookahead.take() {
            return Ok(message);
        }
        self.queue.recv().map_err(|_| IprError::ChannelClosed)
    }

    /// Receiver over an already-populated queue, bypassing the framed
    /// transport. Keeps the worker state-machine tests deterministic.
    #[cfg(test)]
    pub(crate) fn from_queue(queue: mpsc::Receiver<ControlMessage>) -> Self {
        ControlReceiver {
            queue,
            lookahead: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::delta::{ParamValue, SceneDelta};
    use std::io::pipe;

    fn update(target: &str, param: &str, value: f32) -> ControlMessage {
        let mut delta = SceneDelta::default();
        delta.entry(target).set(param, ParamValue::Float(value));
        ControlMessage::Update(delta)
    }

    #[test]
    fn messages_arrive_in_send_order() {
        let (reader, writer) = pipe().unwrap();
        let mut sender = ControlSender::new(writer);
        let mut receiver = ControlReceiver::spawn(reader);

        for i in 0..3 {
            sender.send(&update("__camera", "fov", i as f32)).unwrap();
        }
        sender.send(&ControlMessage::Stop).unwrap();

        for i in 0..3 {
            assert_eq!(receiver.receive().unwrap(), update("__camera", "fov", i as f32));
        }
        assert_eq!(receiver.receive().unwrap(), ControlMessage::Stop);
    }

    #[test]
    fn poll_lookahead_loses_nothing() {
        let (reader, writer) = pipe().unwrap();
        let mut sender = ControlSender::new(writer);
        let mut receiver = ControlReceiver::spawn(reader);

        sender.send(&ControlMessage::Stop).unwrap();
        // wait for the reader thread to queue it, then probe repeatedly
        while !receiver.poll() {
            std::thread::yield_now();
        }
        assert!(receiver.poll());
        assert_eq!(receiver.receive().unwrap(), ControlMessage::Stop);
    }

    #[test]
    fn closed_transport_surfaces_as_channel_closed() {
        let (reader, writer) = pipe().unwrap();
        let mut receiver = ControlReceiver::spawn(reader);
        drop(writer);
        assert!(matches!(receiver.receive(), Err(IprError::ChannelClosed)));
    }

    #[test]
    fn send_into_a_closed_pipe_fails() {
        let (reader, writer) = pipe().unwrap();
        drop(reader);
        let mut sender = ControlSender::new(writer);
        // a broken pipe may take one buffered write to show up
        let mut failed = false;
        for _ in 0..4 {
            if sender.send(&ControlMessage::Stop).is_err() {
                failed = true;
                break;
            }
        }
        assert!(failed);
    }
}
