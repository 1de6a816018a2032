// ─────────────────────────────────────────────────────────────────────────────
//  ble-dfu :: prompt  —  operator input for interactive device selection
// ─────────────────────────────────────────────────────────────────────────────

use std::io::BufRead;

use async_trait::async_trait;
use ble_dfu::SelectionPrompt;

/// Reads one line from stdin without blocking the runtime.
pub struct StdinPrompt;

#[async_trait]
impl SelectionPrompt for StdinPrompt {
    async fn read_selection(&mut self) -> Option<String> {
        let line = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            match std::io::stdin().lock().read_line(&mut line) {
                Ok(0) => None,
                Ok(_) => Some(line),
                Err(e) => {
                    log::warn!("failed to read selection: {}", e);
                    None
                }
            }
        })
        .await;

        match line {
            Ok(line) => line,
            Err(e) => {
                log::warn!("selection reader task failed: {}", e);
                None
            }
        }
    }
}
