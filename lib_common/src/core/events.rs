//! Messages pushed from the relay to a connected browser.

use serde::Serialize;

use super::registry::SessionId;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// First message on every connection.
    Hello { session_id: SessionId },
    /// Detections for the session's most recently processed frame, exactly
    /// as the worker reported them.
    Inference { boxes: Vec<serde_json::Value> },
    /// One debounced alert batch.
    Violation {
        session_id: SessionId,
        missing_items: Vec<String>,
        tracks: Vec<i64>,
    },
}

impl ServerEvent {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_shapes() {
        let id: SessionId = "4".parse().unwrap();
        assert_eq!(
            serde_json::to_value(ServerEvent::Hello { session_id: id }).unwrap(),
            json!({"type": "hello", "sessionId": "4"})
        );

        // Worker spellings and unknown fields pass through untouched.
        let worker_box = json!({"x1": 0.0, "y1": 0.0, "x2": 2.0, "y2": 2.0,
                                "conf": 0.9, "class": 3, "name": "person", "id": 9, "mask": [1, 2]});
        assert_eq!(
            serde_json::to_value(ServerEvent::Inference { boxes: vec![worker_box.clone()] }).unwrap(),
            json!({"type": "inference", "boxes": [worker_box]})
        );

        let violation = ServerEvent::Violation {
            session_id: id,
            missing_items: vec!["boots".into(), "vest".into()],
            tracks: vec![9, 11],
        };
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&violation.to_json().unwrap()).unwrap(),
            json!({"type": "violation", "sessionId": "4", "missingItems": ["boots", "vest"], "tracks": [9, 11]})
        );
    }
}
