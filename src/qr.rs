//
// QR pair manager.
//
// Splits the MitID channel-binding hex value into two QR payloads, writes
// PNG frames atomically into a per-connection directory under the OS temp
// dir, and runs a background animator that alternates `current_frame`
// between 1 and 2 on a 1 s tick. Atomic writes go through
// `util::write_file_atomic` (write-to-temp-then-rename); the animator task
// uses `tokio::spawn` plus a `tokio::sync::Notify` shutdown signal so the
// caller has a single owning handle and a clean join point instead of a
// bare callback.

use std::sync::Arc;
use std::time::Duration;

use image::Luma;
use qrcode::QrCode;
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::error::Error;
use crate::util;

pub const FRAME1_NAME: &str = "qr_frame1.png";
pub const FRAME2_NAME: &str = "qr_frame2.png";
pub const CURRENT_FRAME_NAME: &str = "current_frame";
pub const STATUS_NAME: &str = "status";

const ANIMATOR_TICK: Duration = Duration::from_secs(1);
/// Time the per-connection directory survives after the flow ends.
pub const CLEANUP_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QrStatus {
    Initializing,
    QrReady,
    WaitingApproval,
    Approved,
    Complete,
    Failed,
}

impl QrStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            QrStatus::Initializing => "initializing",
            QrStatus::QrReady => "qr_ready",
            QrStatus::WaitingApproval => "waiting_approval",
            QrStatus::Approved => "approved",
            QrStatus::Complete => "complete",
            QrStatus::Failed => "failed",
        }
    }
}

#[derive(Serialize)]
struct QrPayload<'a> {
    v: u8,
    p: u8,
    t: u8,
    h: &'a str,
    uc: u32,
}

fn qr_dir_for(connection_id: &str, qr_tmp_dir: Option<&str>) -> String {
    let base = qr_tmp_dir.map(str::to_string).unwrap_or_else(|| std::env::temp_dir().to_string_lossy().into_owned());
    format!("{base}/mitid_qr_{connection_id}")
}

fn png_bytes_for(payload: &str) -> Result<Vec<u8>, Error> {
    let code = QrCode::new(payload.as_bytes())
        .map_err(|e| Error::new("failed to encode QR payload", format!("qrcode error: {e}")))?;
    let image = code.render::<Luma<u8>>().build();
    let mut bytes: Vec<u8> = Vec::new();
    image::DynamicImage::ImageLuma8(image)
        .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
        .map_err(|e| Error::new("failed to encode QR PNG", format!("png encode error: {e}")))?;
    Ok(bytes)
}

/// Owns the animator task and the per-connection directory for one MitID
/// flow. Dropped implicitly once `cleanup` runs; there is no `Drop` impl
/// because shutdown must be awaited, not fired-and-forgotten.
pub struct QrManager {
    dir: String,
    animator: Mutex<Option<(JoinHandle<()>, Arc<Notify>)>>,
}

impl QrManager {
    pub fn new(connection_id: &str, qr_tmp_dir: Option<&str>) -> Self {
        Self {
            dir: qr_dir_for(connection_id, qr_tmp_dir),
            animator: Mutex::new(None),
        }
    }

    pub fn dir(&self) -> &str {
        &self.dir
    }

    fn path(&self, name: &str) -> String {
        format!("{}/{}", self.dir, name)
    }

    /// Writes both PNG frames atomically, recreating the directory if
    /// absent, and seeds `current_frame`/`status`.
    pub fn generate(&self, binding_value_hex: &str, update_count: u32) -> Result<(), Error> {
        util::ensure_dir(&self.dir)?;

        let mid = binding_value_hex.len() / 2;
        let (half1, half2) = binding_value_hex.split_at(mid);

        let payload1 = QrPayload {
            v: 1,
            p: 1,
            t: 2,
            h: half1,
            uc: update_count,
        };
        let payload2 = QrPayload {
            v: 1,
            p: 2,
            t: 2,
            h: half2,
            uc: update_count,
        };

        let json1 = serde_json::to_string(&payload1)?;
        let json2 = serde_json::to_string(&payload2)?;

        util::write_file_atomic(&self.path(FRAME1_NAME), &png_bytes_for(&json1)?)?;
        util::write_file_atomic(&self.path(FRAME2_NAME), &png_bytes_for(&json2)?)?;
        util::write_file_atomic(&self.path(CURRENT_FRAME_NAME), b"1")?;
        self.set_status(QrStatus::QrReady)?;

        Ok(())
    }

    pub fn set_status(&self, status: QrStatus) -> Result<(), Error> {
        util::write_file_atomic(&self.path(STATUS_NAME), status.as_str().as_bytes())
    }

    pub fn status(&self) -> Result<String, Error> {
        Ok(util::read_file_string(&self.path(STATUS_NAME))?.trim().to_string())
    }

    pub fn current_frame_path(&self) -> Result<String, Error> {
        let frame = util::read_file_string(&self.path(CURRENT_FRAME_NAME))?;
        match frame.trim() {
            "2" => Ok(self.path(FRAME2_NAME)),
            _ => Ok(self.path(FRAME1_NAME)),
        }
    }

    /// Starts the animator if not already running. Idempotent: calling this
    /// on a running animator is a no-op.
    pub async fn start_animator(self: &Arc<Self>) {
        let mut guard = self.animator.lock().await;
        if guard.is_some() {
            return;
        }

        let shutdown = Arc::new(Notify::new());
        let shutdown_task = shutdown.clone();
        let manager = self.clone();

        let handle = tokio::spawn(async move {
            let mut current = 1u8;
            loop {
                tokio::select! {
                    _ = shutdown_task.notified() => break,
                    _ = tokio::time::sleep(ANIMATOR_TICK) => {
                        current = if current == 1 { 2 } else { 1 };
                        let frame_path = manager.path(CURRENT_FRAME_NAME);
                        let _ = util::write_file_atomic(&frame_path, current.to_string().as_bytes());
                    }
                }
            }
        });

        *guard = Some((handle, shutdown));
    }

    /// Stops the animator, waiting for the task to exit. A no-op if the
    /// animator isn't running.
    pub async fn stop_animator(&self) {
        let mut guard = self.animator.lock().await;
        if let Some((handle, shutdown)) = guard.take() {
            shutdown.notify_one();
            let _ = handle.await;
        }
    }

    /// Removes the entire per-connection directory, 5 seconds after the
    /// flow finishes, irrespective of outcome.
    pub async fn cleanup_after_delay(self: Arc<Self>) {
        tokio::time::sleep(CLEANUP_DELAY).await;
        self.stop_animator().await;
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_manager(name: &str) -> Arc<QrManager> {
        let dir = std::env::temp_dir().join(format!("broker-core-qr-test-{name}-{}", util::get_uuid()));
        Arc::new(QrManager {
            dir: dir.to_string_lossy().into_owned(),
            animator: Mutex::new(None),
        })
    }

    #[test]
    fn generate_writes_both_frames_nonempty() {
        let manager = temp_manager("generate");
        manager.generate(&"ab".repeat(32), 1).unwrap();

        let frame1 = util::read_file(&manager.path(FRAME1_NAME)).unwrap();
        let frame2 = util::read_file(&manager.path(FRAME2_NAME)).unwrap();
        assert!(!frame1.is_empty());
        assert!(!frame2.is_empty());

        std::fs::remove_dir_all(&manager.dir).unwrap();
    }

    #[test]
    fn generate_sets_status_qr_ready() {
        let manager = temp_manager("status");
        manager.generate(&"cd".repeat(32), 1).unwrap();
        assert_eq!(manager.status().unwrap(), "qr_ready");
        std::fs::remove_dir_all(&manager.dir).unwrap();
    }

    #[test]
    fn current_frame_defaults_to_frame1() {
        let manager = temp_manager("current-frame");
        manager.generate(&"ef".repeat(32), 1).unwrap();
        assert!(manager.current_frame_path().unwrap().ends_with(FRAME1_NAME));
        std::fs::remove_dir_all(&manager.dir).unwrap();
    }

    #[tokio::test]
    async fn animator_toggles_current_frame_after_one_tick() {
        let manager = temp_manager("animator");
        manager.generate(&"12".repeat(32), 1).unwrap();
        manager.start_animator().await;

        tokio::time::sleep(Duration::from_millis(1200)).await;
        let after_one_tick = util::read_file_string(&manager.path(CURRENT_FRAME_NAME)).unwrap();
        assert_eq!(after_one_tick.trim(), "2");

        manager.stop_animator().await;
        std::fs::remove_dir_all(&manager.dir).unwrap();
    }

    #[tokio::test]
    async fn starting_running_animator_is_noop() {
        let manager = temp_manager("animator-idempotent");
        manager.generate(&"34".repeat(32), 1).unwrap();
        manager.start_animator().await;
        manager.start_animator().await;
        assert!(manager.animator.lock().await.is_some());
        manager.stop_animator().await;
        std::fs::remove_dir_all(&manager.dir).unwrap();
    }
}
