use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::DeliveryError;
use crate::message::Message;

/// Maildir-style destination: one uniquely named file per delivered
/// message, written to a temporary name and renamed into place so readers
/// never observe a partial file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDestination {
    dir: PathBuf,
}

impl FileDestination {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn deliver(&self, message: &Message) -> Result<(), DeliveryError> {
        let name = format!(
            "{}_{}.eml",
            Utc::now().format("%Y%m%d_%H%M%S"),
            Uuid::new_v4()
        );
        let tmp_path = self.dir.join(format!(".{}.tmp", name));
        let final_path = self.dir.join(&name);

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
            .await?;
        file.write_all(&message.body).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, &final_path).await?;

        tracing::info!(path = %final_path.display(), "wrote message to filesystem");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(body: &[u8]) -> Message {
        Message {
            sender: Some("sender@example.com".to_string()),
            recipients: vec!["user@example.com".to_string()],
            body: body.to_vec(),
        }
    }

    #[tokio::test]
    async fn writes_one_file_with_the_raw_body() {
        let dir = tempfile::tempdir().unwrap();
        let dest = FileDestination::new(dir.path());

        dest.deliver(&message(b"Subject: hi\r\n\r\nHello\r\n"))
            .await
            .unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap())
            .collect();
        assert_eq!(entries.len(), 1);
        let name = entries[0].file_name().into_string().unwrap();
        assert!(name.ends_with(".eml"), "unexpected file name {}", name);
        assert!(!name.starts_with('.'), "temp file left behind: {}", name);
        assert_eq!(
            std::fs::read(entries[0].path()).unwrap(),
            b"Subject: hi\r\n\r\nHello\r\n"
        );
    }

    #[tokio::test]
    async fn two_deliveries_never_collide() {
        let dir = tempfile::tempdir().unwrap();
        let dest = FileDestination::new(dir.path());

        dest.deliver(&message(b"first\r\n")).await.unwrap();
        dest.deliver(&message(b"second\r\n")).await.unwrap();

        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[tokio::test]
    async fn missing_directory_reports_a_delivery_failure() {
        let dest = FileDestination::new("/nonexistent/kutsche-test");
        let err = dest.deliver(&message(b"x\r\n")).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Io(_)));
    }
}
