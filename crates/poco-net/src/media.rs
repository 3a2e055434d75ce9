//! Inbound media boundary for direct channels.
//!
//! A transform installed on a direct connection sees every reassembled
//! message body before it is decoded. Progress it reports through the
//! callback surfaces as `"media progress"` events on the connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PocoNetError;

/// Byte-level hook applied to each reassembled inbound body.
///
/// The transform runs on the channel's pump task; implementations
/// should be quick and must not block. Returning the input unchanged
/// passes the message through.
pub trait MediaTransform: Send + Sync {
    fn transform(
        &self,
        input: &[u8],
        progress: &mut dyn FnMut(MediaProgress),
    ) -> Result<Vec<u8>, PocoNetError>;
}

/// Payload of the `"media progress"` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaProgress {
    /// Bytes handled so far in the current unit of work.
    pub processed: usize,
    /// Bytes the unit of work spans.
    pub total: usize,
}

impl MediaProgress {
    pub fn from_value(args: &Value) -> Result<Self, PocoNetError> {
        serde_json::from_value(args.clone())
            .map_err(|_| PocoNetError::protocol("malformed media progress payload"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn progress_decodes_from_event_args() {
        let args = json!({ "processed": 40, "total": 120 });
        let progress = MediaProgress::from_value(&args).unwrap();
        assert_eq!(progress, MediaProgress { processed: 40, total: 120 });

        assert!(MediaProgress::from_value(&json!({ "processed": 1 })).is_err());
    }

    #[test]
    fn transforms_rewrite_bodies_and_report() {
        struct Reverse;
        impl MediaTransform for Reverse {
            fn transform(
                &self,
                input: &[u8],
                progress: &mut dyn FnMut(MediaProgress),
            ) -> Result<Vec<u8>, PocoNetError> {
                let mut out = input.to_vec();
                out.reverse();
                progress(MediaProgress { processed: out.len(), total: input.len() });
                Ok(out)
            }
        }

        let mut reports = Vec::new();
        let out = Reverse.transform(b"abc", &mut |p| reports.push(p)).unwrap();
        assert_eq!(&out[..], b"cba");
        assert_eq!(reports, vec![MediaProgress { processed: 3, total: 3 }]);
    }
}
