use lib_common::core::FrameMeta;
use serde::Deserialize;

/// Text messages a browser may send.
#[derive(Deserialize, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Announces the binary frame that follows.
    FrameMeta {
        #[serde(default)]
        width: u32,
        #[serde(default)]
        height: u32,
        #[serde(default)]
        size: u64,
    },
    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    pub fn frame_meta(&self) -> Option<FrameMeta> {
        match *self {
            ClientMessage::FrameMeta { width, height, size } => Some(FrameMeta {
                width,
                height,
                byte_size: size,
            }),
            ClientMessage::Unknown => None,
        }
    }
}
