//! Result publisher writing merged markdown to a local directory.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tracing::debug;

use super::{PublishAck, ResultPublisher};
use crate::domain::PublishError;
use crate::pipeline::MergedResult;

pub const OUTPUT_SUFFIX: &str = "-arch.md";

/// Writes `<out_dir>/<repo>-arch.md`, replacing any previous file atomically.
pub struct FsResultPublisher {
    out_dir: PathBuf,
}

impl FsResultPublisher {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
        }
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub fn path_for(&self, repo_id: &str) -> PathBuf {
        let safe: String = repo_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
            .collect();
        self.out_dir.join(format!("{}{OUTPUT_SUFFIX}", safe.trim_start_matches('.')))
    }
}

fn write_atomic(path: &Path, body: &str) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(body.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[async_trait]
impl ResultPublisher for FsResultPublisher {
    async fn publish(&self, repo_id: &str, result: &MergedResult) -> Result<PublishAck, PublishError> {
        let path = self.path_for(repo_id);
        let mut body = result.to_markdown();
        body.push('\n');

        let target = path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&target, &body))
            .await
            .map_err(|e| PublishError::Io(format!("publish task failed: {e}")))?
            .map_err(|e| PublishError::Io(format!("{}: {e}", path.display())))?;

        debug!(repo = %repo_id, path = %path.display(), sections = result.sections.len(), "published result");
        Ok(PublishAck {
            location: path.display().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Section;

    fn merged(content: &str) -> MergedResult {
        MergedResult {
            repo_id: "is-odd".into(),
            branch: "main".into(),
            commit_id: "abc123".into(),
            category: "libraries".into(),
            sections: vec![
                Section {
                    step_id: "overview".into(),
                    content: content.into(),
                    applicable: true,
                },
                Section {
                    step_id: "security".into(),
                    content: "No secrets.".into(),
                    applicable: true,
                },
            ],
        }
    }

    #[tokio::test]
    async fn writes_markdown_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = FsResultPublisher::new(dir.path().join("out"));

        let ack = publisher.publish("is-odd", &merged("First.")).await.unwrap();
        let path = dir.path().join("out").join("is-odd-arch.md");
        assert_eq!(ack.location, path.display().to_string());
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "# overview\n\nFirst.\n\n# security\n\nNo secrets.\n"
        );

        publisher.publish("is-odd", &merged("Second.")).await.unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("Second."));
        let leftovers = std::fs::read_dir(dir.path().join("out")).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn repo_ids_are_made_file_safe() {
        let publisher = FsResultPublisher::new("/tmp/out");
        assert_eq!(
            publisher.path_for("acme/api"),
            PathBuf::from("/tmp/out/acme_api-arch.md")
        );
        assert_eq!(
            publisher.path_for("../x"),
            PathBuf::from("/tmp/out/_x-arch.md")
        );
    }
}
