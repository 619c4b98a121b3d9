//! Frameflow wire types
//!
//! Shapes of the data that crosses process boundaries: stream entries read from the
//! image stream, result entries published to the predictions stream, and the service
//! descriptors used to name workers and the orchestrator.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Field names carried by entries of the image stream
pub mod fields {
    pub const PARTICIPANT_ID: &str = "participantId";
    pub const TIMESTAMP: &str = "timestamp";
    pub const IMAGE: &str = "img";
    pub const PREDICTION_COUNT: &str = "predictionCount";
}

/// Errors raised while decoding wire values
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("invalid service descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("invalid stream entry id: {0}")]
    InvalidEntryId(String),

    #[error("entry {entry_id} is missing required field '{field}'")]
    MissingField { entry_id: String, field: &'static str },
}

// Service descriptors

const DESCRIPTOR_PREFIX: &str = "svc";

/// Identity of a service in the pipeline, encoded as `svc:<type>:<id>`
///
/// The id may be empty, which names a service type rather than an instance
/// (the orchestrator is addressed as `svc:sgn:`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub service_type: String,
    pub service_id: String,
}

impl ServiceDescriptor {
    pub fn new(service_type: impl Into<String>, service_id: impl Into<String>) -> Self {
        Self {
            service_type: service_type.into(),
            service_id: service_id.into(),
        }
    }

    /// Encoded form, used as consumer name and registration payload
    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// True when the descriptor names a concrete instance
    pub fn is_instance(&self) -> bool {
        !self.service_id.is_empty()
    }
}

impl fmt::Display for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", DESCRIPTOR_PREFIX, self.service_type, self.service_id)
    }
}

impl FromStr for ServiceDescriptor {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(DESCRIPTOR_PREFIX), Some(service_type), Some(service_id))
                if !service_type.is_empty() =>
            {
                Ok(Self::new(service_type, service_id))
            }
            _ => Err(WireError::InvalidDescriptor(s.to_string())),
        }
    }
}

// Stream entries

/// Position of an entry in a stream (`<millis>-<seq>`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EntryId {
    pub millis: u64,
    pub seq: u64,
}

impl EntryId {
    pub const MIN: EntryId = EntryId { millis: 0, seq: 0 };

    pub fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }

    /// The smallest id strictly greater than this one
    pub fn next(&self) -> Self {
        match self.seq.checked_add(1) {
            Some(seq) => Self::new(self.millis, seq),
            None => Self::new(self.millis + 1, 0),
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || WireError::InvalidEntryId(s.to_string());
        let (millis, seq) = match s.split_once('-') {
            Some((millis, seq)) => (millis, seq),
            None => (s, "0"),
        };
        Ok(Self {
            millis: millis.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

/// An entry read from a stream
///
/// The id is kept in the store's own textual form so it can be acknowledged verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: HashMap<String, Vec<u8>>,
}

impl StreamEntry {
    pub fn new(id: impl Into<String>, fields: HashMap<String, Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    pub fn field(&self, name: &str) -> Option<&[u8]> {
        self.fields.get(name).map(Vec::as_slice)
    }

    fn required(&self, name: &'static str) -> Result<&[u8], WireError> {
        self.field(name).ok_or_else(|| WireError::MissingField {
            entry_id: self.id.clone(),
            field: name,
        })
    }
}

/// A decoded image-stream entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFrame<'a> {
    pub participant_id: &'a [u8],
    pub timestamp: &'a [u8],
    pub image: &'a [u8],
}

impl<'a> TryFrom<&'a StreamEntry> for ImageFrame<'a> {
    type Error = WireError;

    fn try_from(entry: &'a StreamEntry) -> Result<Self, Self::Error> {
        Ok(Self {
            participant_id: entry.required(fields::PARTICIPANT_ID)?,
            timestamp: entry.required(fields::TIMESTAMP)?,
            image: entry.required(fields::IMAGE)?,
        })
    }
}

// Predictions

/// One object found in an image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub score: f32,
    /// Corner coordinates `[x1, y1, x2, y2]` in source-image pixels
    pub bbox: [i32; 4],
}

impl Detection {
    pub fn new(label: impl Into<String>, score: f32, bbox: [i32; 4]) -> Self {
        Self {
            label: label.into(),
            score,
            bbox,
        }
    }

    /// `label|score|x1;y1;x2;y2`
    pub fn encode(&self) -> String {
        let coords: Vec<String> = self.bbox.iter().map(i32::to_string).collect();
        format!("{}|{}|{}", self.label, self.score, coords.join(";"))
    }
}

/// Entry published to the predictions stream for one processed frame
#[derive(Debug, Clone, PartialEq)]
pub struct ResultEntry {
    pub participant_id: Vec<u8>,
    pub timestamp: Vec<u8>,
    pub detections: Vec<Detection>,
}

impl ResultEntry {
    pub fn new(frame: &ImageFrame<'_>, detections: Vec<Detection>) -> Self {
        Self {
            participant_id: frame.participant_id.to_vec(),
            timestamp: frame.timestamp.to_vec(),
            detections,
        }
    }

    /// Field name of the i-th prediction
    pub fn prediction_field(index: usize) -> String {
        format!("p{}", index)
    }

    /// Flatten into stream fields, metadata first, then count, then predictions in order
    pub fn into_fields(self) -> Vec<(String, Vec<u8>)> {
        let mut out = Vec::with_capacity(3 + self.detections.len());
        out.push((fields::PARTICIPANT_ID.to_string(), self.participant_id));
        out.push((fields::TIMESTAMP.to_string(), self.timestamp));
        out.push((
            fields::PREDICTION_COUNT.to_string(),
            self.detections.len().to_string().into_bytes(),
        ));
        for (i, detection) in self.detections.iter().enumerate() {
            out.push((Self::prediction_field(i), detection.encode().into_bytes()));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(pairs: &[(&str, &[u8])]) -> StreamEntry {
        StreamEntry::new(
            "1-0",
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_vec()))
                .collect(),
        )
    }

    #[test]
    fn test_descriptor_roundtrip() {
        let desc: ServiceDescriptor = "svc:inf:worker-7".parse().unwrap();
        assert_eq!(desc.service_type, "inf");
        assert_eq!(desc.service_id, "worker-7");
        assert!(desc.is_instance());
        assert_eq!(desc.encode(), "svc:inf:worker-7");
    }

    #[test]
    fn test_partial_descriptor() {
        let desc: ServiceDescriptor = "svc:sgn:".parse().unwrap();
        assert!(!desc.is_instance());
        assert_eq!(desc.encode(), "svc:sgn:");
    }

    #[test]
    fn test_invalid_descriptors() {
        assert!("inf:worker".parse::<ServiceDescriptor>().is_err());
        assert!("svc::x".parse::<ServiceDescriptor>().is_err());
        assert!("host:inf:x".parse::<ServiceDescriptor>().is_err());
    }

    #[test]
    fn test_entry_id_ordering() {
        let a: EntryId = "1000-0".parse().unwrap();
        let b: EntryId = "1000-1".parse().unwrap();
        let c: EntryId = "999".parse().unwrap();
        assert!(a < b);
        assert!(c < a);
        assert_eq!(a.next(), b);
        assert_eq!(EntryId::new(5, u64::MAX).next(), EntryId::new(6, 0));
        assert!("abc-1".parse::<EntryId>().is_err());
    }

    #[test]
    fn test_result_entry_with_detection() {
        let source = entry(&[
            ("participantId", b"p1"),
            ("timestamp", b"1000"),
            ("img", b"\x89PNG"),
        ]);
        let frame = ImageFrame::try_from(&source).unwrap();
        let result = ResultEntry::new(&frame, vec![Detection::new("cat", 0.91, [10, 20, 30, 40])]);

        let fields = result.into_fields();
        assert_eq!(
            fields,
            vec![
                ("participantId".to_string(), b"p1".to_vec()),
                ("timestamp".to_string(), b"1000".to_vec()),
                ("predictionCount".to_string(), b"1".to_vec()),
                ("p0".to_string(), b"cat|0.91|10;20;30;40".to_vec()),
            ]
        );
    }

    #[test]
    fn test_result_entry_without_detections() {
        let source = entry(&[("participantId", b"p1"), ("timestamp", b"1"), ("img", b"")]);
        let frame = ImageFrame::try_from(&source).unwrap();
        let fields = ResultEntry::new(&frame, Vec::new()).into_fields();

        assert_eq!(fields.len(), 3);
        assert_eq!(fields[2], ("predictionCount".to_string(), b"0".to_vec()));
        assert!(!fields.iter().any(|(k, _)| k == "p0"));
    }

    #[test]
    fn test_missing_image_field() {
        let source = entry(&[("participantId", b"p1"), ("timestamp", b"1")]);
        let err = ImageFrame::try_from(&source).unwrap_err();
        assert_eq!(
            err,
            WireError::MissingField {
                entry_id: "1-0".to_string(),
                field: "img"
            }
        );
    }

    #[test]
    fn test_detection_from_json() {
        let parsed: Vec<Detection> =
            serde_json::from_str(r#"[{"label":"dog","score":0.5,"bbox":[1,2,3,4]}]"#).unwrap();
        assert_eq!(parsed, vec![Detection::new("dog", 0.5, [1, 2, 3, 4])]);
        assert_eq!(parsed[0].encode(), "dog|0.5|1;2;3;4");
    }
}
