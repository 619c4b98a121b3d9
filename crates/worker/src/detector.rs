//! Inference function boundary
//!
//! The worker treats object detection as an opaque function from encoded image bytes to
//! a list of normalized detections. Model internals live behind [`Detector`].

use async_trait::async_trait;
use frameflow_common::config::DetectorConfig;
use frameflow_common::{FrameflowError, Result};
use frameflow_proto::Detection;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Runs inference on one encoded image
#[async_trait]
pub trait Detector: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    async fn detect(&self, image: &[u8]) -> Result<Vec<Detection>>;
}

/// Build the detector selected by configuration
pub fn from_config(config: &DetectorConfig) -> Result<Arc<dyn Detector>> {
    match config.kind.as_str() {
        "none" => Ok(Arc::new(NoopDetector)),
        "command" => {
            let program = config
                .command
                .clone()
                .ok_or_else(|| FrameflowError::config("command detector requires detector.command"))?;
            Ok(Arc::new(CommandDetector::new(
                program,
                config.args.clone(),
                Duration::from_millis(config.timeout_ms),
            )))
        }
        other => Err(FrameflowError::config(format!("Unknown detector kind: {}", other))),
    }
}

/// Reports no objects for every image
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDetector;

#[async_trait]
impl Detector for NoopDetector {
    fn name(&self) -> &str {
        "none"
    }

    async fn detect(&self, _image: &[u8]) -> Result<Vec<Detection>> {
        Ok(Vec::new())
    }
}

/// Delegates inference to an external program
///
/// The program receives the encoded image on stdin and prints a JSON array of
/// `{"label", "score", "bbox": [x1, y1, x2, y2]}` objects on stdout. A non-zero exit
/// status or unparsable output is an inference failure.
#[derive(Debug, Clone)]
pub struct CommandDetector {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandDetector {
    pub fn new(program: PathBuf, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program,
            args,
            timeout,
        }
    }

    async fn run(&self, image: &[u8]) -> Result<Vec<Detection>> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Feed stdin while draining stdout so large outputs cannot stall the pipe
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(image).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output?;
        if !output.status.success() {
            return Err(FrameflowError::inference(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        fed?;

        let detections: Vec<Detection> = serde_json::from_slice(&output.stdout)
            .map_err(|e| FrameflowError::inference(format!("invalid detector output: {}", e)))?;
        debug!(count = detections.len(), "Detector returned predictions");
        Ok(detections)
    }
}

#[async_trait]
impl Detector for CommandDetector {
    fn name(&self) -> &str {
        "command"
    }

    async fn detect(&self, image: &[u8]) -> Result<Vec<Detection>> {
        tokio::time::timeout(self.timeout, self.run(image))
            .await
            .map_err(|_| {
                FrameflowError::inference(format!(
                    "{} did not finish within {:?}",
                    self.program.display(),
                    self.timeout
                ))
            })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_detector() {
        let detections = NoopDetector.detect(b"jpeg").await.unwrap();
        assert!(detections.is_empty());
    }

    #[test]
    fn test_from_config() {
        let detector = from_config(&DetectorConfig::default()).unwrap();
        assert_eq!(detector.name(), "none");

        let config = DetectorConfig {
            kind: "command".to_string(),
            command: Some(PathBuf::from("/bin/cat")),
            ..DetectorConfig::default()
        };
        assert_eq!(from_config(&config).unwrap().name(), "command");

        let config = DetectorConfig {
            kind: "onnx".to_string(),
            ..DetectorConfig::default()
        };
        assert!(from_config(&config).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_detector_parses_stdout() {
        // `cat` echoes the "image" back, so feed it a JSON payload
        let detector = CommandDetector::new(PathBuf::from("cat"), Vec::new(), Duration::from_secs(5));
        let payload = br#"[{"label":"cat","score":0.91,"bbox":[10,20,30,40]}]"#;

        let detections = detector.detect(payload).await.unwrap();
        assert_eq!(detections, vec![Detection::new("cat", 0.91, [10, 20, 30, 40])]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_detector_rejects_garbage() {
        let detector = CommandDetector::new(PathBuf::from("cat"), Vec::new(), Duration::from_secs(5));
        let err = detector.detect(b"\x89PNG").await.unwrap_err();
        assert!(matches!(err, FrameflowError::Inference(_)));
    }
}
