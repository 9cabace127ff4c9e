//! Object detection over the image store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tgwh_core::{ClassTaxonomy, DetectionRecord, ImageCategory, RawDetection};
use tgwh_storage::ImageStore;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Failures that stop the detect stage instead of skipping one image.
#[derive(Debug, Error)]
pub enum DetectError {
    #[error("detector {program} could not be started")]
    Unavailable {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("detector failed on all {failed} images")]
    NothingClassified { failed: usize },
}

#[async_trait]
pub trait Detector: Send + Sync {
    async fn detect(&self, image: &Path) -> Result<RawDetection>;
}

/// Runs an external detector once per image: `{program} {args..} {image}`.
/// The last non-empty stdout line must be `{"classes":[..],"confidences":[..]}`.
#[derive(Debug, Clone)]
pub struct CommandDetector {
    program: String,
    args: Vec<String>,
}

impl CommandDetector {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl Detector for CommandDetector {
    async fn detect(&self, image: &Path) -> Result<RawDetection> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(image)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| DetectError::Unavailable {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            bail!(
                "detector {} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        parse_detector_output(&String::from_utf8_lossy(&output.stdout))
    }
}

pub fn parse_detector_output(stdout: &str) -> Result<RawDetection> {
    let line = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .context("detector printed nothing")?;
    let raw: RawDetection =
        serde_json::from_str(line).with_context(|| format!("decoding detector output {line:?}"))?;
    if raw.confidences.iter().any(|c| !(0.0..=1.0).contains(c)) {
        bail!("detector confidences out of range: {:?}", raw.confidences);
    }
    Ok(raw)
}

#[derive(Debug, Default)]
pub struct DetectionRun {
    pub records: Vec<DetectionRecord>,
    pub images_seen: usize,
    pub failed: Vec<PathBuf>,
}

impl DetectionRun {
    pub fn category_counts(&self) -> BTreeMap<ImageCategory, usize> {
        let mut counts: BTreeMap<ImageCategory, usize> =
            ImageCategory::ALL.into_iter().map(|c| (c, 0)).collect();
        for record in &self.records {
            *counts.entry(record.image_category).or_default() += 1;
        }
        counts
    }
}

/// Detect and classify every image in the store. An image the detector
/// cannot handle is logged and left out. A detector that cannot start, or
/// that fails on every image found, fails the whole pass.
pub async fn detect_images(
    images: &ImageStore,
    detector: &dyn Detector,
    taxonomy: &ClassTaxonomy,
) -> Result<DetectionRun> {
    let found = images.list().await?;
    let mut run = DetectionRun {
        images_seen: found.len(),
        ..Default::default()
    };

    for image in found {
        match detector.detect(&image.path).await {
            Ok(raw) => {
                debug!(channel = %image.channel_name, message_id = image.message_id, classes = ?raw.classes, "detected");
                run.records.push(DetectionRecord::from_raw(
                    image.message_id,
                    image.channel_name,
                    image.path.display().to_string(),
                    raw,
                    taxonomy,
                ));
            }
            Err(err) if err.downcast_ref::<DetectError>().is_some() => return Err(err),
            Err(err) => {
                warn!(path = %image.path.display(), error = %format!("{err:#}"), "detection failed; skipping image");
                run.failed.push(image.path);
            }
        }
    }

    if run.images_seen > 0 && run.records.is_empty() {
        return Err(DetectError::NothingClassified {
            failed: run.failed.len(),
        }
        .into());
    }

    for (category, count) in run.category_counts() {
        info!(category = %category, count, "detection category count");
    }
    Ok(run)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    struct StubDetector {
        by_message: HashMap<String, Vec<u32>>,
    }

    #[async_trait]
    impl Detector for StubDetector {
        async fn detect(&self, image: &Path) -> Result<RawDetection> {
            let stem = image
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            match self.by_message.get(&stem) {
                Some(classes) => Ok(RawDetection {
                    classes: classes.clone(),
                    confidences: classes.iter().map(|_| 0.8).collect(),
                }),
                None => bail!("unreadable image"),
            }
        }
    }

    async fn seed(images: &ImageStore, channel: &str, id: i64) {
        images
            .store_with(channel, id, || async { Ok::<_, std::io::Error>(b"img".to_vec()) })
            .await
            .expect("store");
    }

    #[test]
    fn detector_output_uses_the_last_line() {
        let raw = parse_detector_output("loading weights...\n{\"classes\":[0,39],\"confidences\":[0.5,0.9]}\n\n")
            .expect("parse");
        assert_eq!(raw.classes, vec![0, 39]);

        let empty = parse_detector_output("{}").expect("parse");
        assert!(empty.classes.is_empty());

        assert!(parse_detector_output("").is_err());
        assert!(parse_detector_output("{\"classes\":[0],\"confidences\":[1.7]}").is_err());
    }

    #[tokio::test]
    async fn failed_images_are_skipped_and_the_rest_classified() {
        let dir = tempdir().expect("tempdir");
        let images = ImageStore::new(dir.path());
        seed(&images, "Lobelia4Cosmetics", 1).await;
        seed(&images, "Lobelia4Cosmetics", 2).await;
        seed(&images, "tikvahpharma", 3).await;

        let detector = StubDetector {
            by_message: HashMap::from([("1".to_string(), vec![0, 39]), ("3".to_string(), vec![])]),
        };
        let run = detect_images(&images, &detector, &ClassTaxonomy::default())
            .await
            .expect("detect");

        assert_eq!(run.images_seen, 3);
        assert_eq!(run.failed.len(), 1);
        let categories: Vec<_> = run.records.iter().map(|r| (r.message_id, r.image_category)).collect();
        assert_eq!(
            categories,
            vec![(1, ImageCategory::Promotional), (3, ImageCategory::Other)]
        );
        let counts = run.category_counts();
        assert_eq!(counts[&ImageCategory::Promotional], 1);
        assert_eq!(counts[&ImageCategory::Lifestyle], 0);
    }

    #[tokio::test]
    async fn a_detector_failing_on_every_image_fails_the_pass() {
        let dir = tempdir().expect("tempdir");
        let images = ImageStore::new(dir.path());
        seed(&images, "CheMed123", 2041).await;
        seed(&images, "CheMed123", 2042).await;

        let detector = StubDetector {
            by_message: HashMap::new(),
        };
        let err = detect_images(&images, &detector, &ClassTaxonomy::default())
            .await
            .expect_err("must fail");
        assert!(matches!(
            err.downcast_ref::<DetectError>(),
            Some(DetectError::NothingClassified { failed: 2 })
        ));
    }

    #[tokio::test]
    async fn a_missing_detector_program_fails_the_pass() {
        let dir = tempdir().expect("tempdir");
        let images = ImageStore::new(dir.path());
        seed(&images, "CheMed123", 2041).await;

        let detector = CommandDetector::new("tgwh-no-such-detector-binary", vec![]);
        let err = detect_images(&images, &detector, &ClassTaxonomy::default())
            .await
            .expect_err("must fail");
        assert!(matches!(
            err.downcast_ref::<DetectError>(),
            Some(DetectError::Unavailable { .. })
        ));
        assert!(err.to_string().contains("tgwh-no-such-detector-binary"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_detector_passes_the_image_path_last() {
        let detector = CommandDetector::new(
            "sh",
            vec![
                "-c".into(),
                r#"echo "{\"classes\":[0],\"confidences\":[0.42]}"; test -n "$0""#.into(),
            ],
        );
        let raw = detector.detect(Path::new("/tmp/1.jpg")).await.expect("detect");
        assert_eq!(raw.classes, vec![0]);

        let failing = CommandDetector::new("sh", vec!["-c".into(), "echo 'no model' >&2; exit 2".into()]);
        let err = failing.detect(Path::new("/tmp/1.jpg")).await.expect_err("must fail");
        assert!(format!("{err:#}").contains("no model"));
    }
}
