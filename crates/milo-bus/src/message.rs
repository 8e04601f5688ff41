// Message value type carried between the buses.
use bytes::Bytes;

/// A published message: an opaque topic used for prefix filtering and an
/// arbitrary payload. Both fields are owned and cheap to clone.
///
/// On the wire a message is a two-frame multipart: frame 0 is the topic,
/// frame 1 is the payload. Payload framing is agreed between producer and
/// consumer out of band.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub topic: Bytes,
    pub payload: Bytes,
}

impl Message {
    pub fn new(topic: impl Into<Bytes>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Build a message from a received multipart. Frames beyond the first
    /// two are ignored; fewer than two frames is not a message.
    pub fn from_frames(frames: Vec<Vec<u8>>) -> Option<Self> {
        let mut frames = frames.into_iter();
        let topic = Bytes::from(frames.next()?);
        let payload = Bytes::from(frames.next()?);
        Some(Self { topic, payload })
    }
}
