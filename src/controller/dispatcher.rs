use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::input::OsInput;
use crate::schema::{Action, ActionKind};

/// Maps validated actions onto OS input calls. Input primitives are
/// synchronous and uninterruptible, so each dispatch runs on a blocking
/// worker under a timeout; the cooperative loop never stalls on them and
/// pause still cannot land mid-dispatch.
pub struct Dispatcher {
    input: Arc<dyn OsInput>,
    timeout: Duration,
    last_fingerprint: Option<String>,
}

impl Dispatcher {
    pub fn new(input: Arc<dyn OsInput>, timeout: Duration) -> Self {
        Self { input, timeout, last_fingerprint: None }
    }

    /// Execute one action. Returns plain success/failure; dispatch is never
    /// retried here — a failed step is the engine's bookkeeping problem.
    pub async fn execute(&mut self, action: &Action) -> bool {
        let fingerprint = fingerprint(action);
        if self.last_fingerprint.as_deref() == Some(fingerprint.as_str()) {
            // The same action resurfacing right after a context refresh has
            // almost always already been applied; re-sending it would
            // double-click or double-type.
            info!("Duplicate action suppressed: {}", action.summary());
            return true;
        }

        let succeeded = match &action.kind {
            ActionKind::Click { x, y } => {
                let (x, y) = (*x, *y);
                self.run_blocking(move |input| input.click(x, y)).await
            }
            ActionKind::Type { text } => {
                let text = text.clone();
                self.run_blocking(move |input| input.type_text(&text)).await
            }
            ActionKind::Key { key } => {
                let key = key.clone();
                self.run_blocking(move |input| input.press(&key)).await
            }
            ActionKind::KeySequence { keys } => {
                let parts: Vec<String> = keys
                    .split('+')
                    .map(|k| k.trim().to_string())
                    .filter(|k| !k.is_empty())
                    .collect();
                if parts.is_empty() {
                    warn!("Empty key sequence: {}", action.summary());
                    false
                } else if parts.len() == 1 {
                    let key = parts.into_iter().next().unwrap_or_default();
                    self.run_blocking(move |input| input.press(&key)).await
                } else {
                    self.run_blocking(move |input| input.hotkey(&parts)).await
                }
            }
            ActionKind::Scroll { amount } => {
                let amount = *amount;
                self.run_blocking(move |input| input.scroll(amount)).await
            }
            ActionKind::Unrecognized { raw_kind } => {
                // Soft no-op: give the screen a moment and move on.
                warn!("Unrecognized action kind '{}'; treating as settle wait", raw_kind);
                tokio::time::sleep(Duration::from_millis(500)).await;
                true
            }
        };

        if succeeded {
            self.last_fingerprint = Some(fingerprint);
        }
        succeeded
    }

    async fn run_blocking<F>(&self, op: F) -> bool
    where
        F: FnOnce(&dyn OsInput) -> anyhow::Result<()> + Send + 'static,
    {
        let input = Arc::clone(&self.input);
        let task = tokio::task::spawn_blocking(move || op(input.as_ref()));

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(Ok(()))) => true,
            Ok(Ok(Err(e))) => {
                warn!("Input call failed: {}", e);
                false
            }
            Ok(Err(e)) => {
                warn!("Input task panicked: {}", e);
                false
            }
            Err(_) => {
                warn!("Input call timed out after {:?}", self.timeout);
                false
            }
        }
    }
}

/// Identity of an action for duplicate suppression: kind plus its key-ish
/// payload plus the description, hashed.
fn fingerprint(action: &Action) -> String {
    let key_part = match &action.kind {
        ActionKind::Click { x, y } => format!("{}:{}", x, y),
        ActionKind::Type { text } => text.clone(),
        ActionKind::Key { key } => key.clone(),
        ActionKind::KeySequence { keys } => keys.clone(),
        ActionKind::Scroll { amount } => amount.to_string(),
        ActionKind::Unrecognized { raw_kind } => raw_kind.clone(),
    };

    let mut hasher = Sha256::new();
    hasher.update(action.kind.name().as_bytes());
    hasher.update(b"\x00");
    hasher.update(key_part.as_bytes());
    hasher.update(b"\x00");
    hasher.update(action.description.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ActionProvenance;
    use anyhow::Result;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct CountingInput {
        presses: AtomicUsize,
        hotkeys: Mutex<Vec<Vec<String>>>,
        clicks: AtomicUsize,
        typed: Mutex<Vec<String>>,
        scrolls: AtomicUsize,
    }

    impl OsInput for CountingInput {
        fn press(&self, _key: &str) -> Result<()> {
            self.presses.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn hotkey(&self, keys: &[String]) -> Result<()> {
            self.hotkeys.lock().unwrap().push(keys.to_vec());
            Ok(())
        }
        fn click(&self, _x: i32, _y: i32) -> Result<()> {
            self.clicks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn type_text(&self, text: &str) -> Result<()> {
            self.typed.lock().unwrap().push(text.to_string());
            Ok(())
        }
        fn scroll(&self, _amount: i32) -> Result<()> {
            self.scrolls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn action(kind: ActionKind, description: &str) -> Action {
        Action {
            kind,
            description: description.to_string(),
            confidence: 80,
            provenance: ActionProvenance::Model,
        }
    }

    fn dispatcher(input: Arc<CountingInput>) -> Dispatcher {
        Dispatcher::new(input, Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_identical_consecutive_actions_dispatch_once() {
        let input = Arc::new(CountingInput::default());
        let mut dispatcher = dispatcher(Arc::clone(&input));

        let click = action(ActionKind::Click { x: 100, y: 100 }, "Click the icon");
        assert!(dispatcher.execute(&click).await);
        assert!(dispatcher.execute(&click).await);
        assert_eq!(input.clicks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_actions_both_dispatch() {
        let input = Arc::new(CountingInput::default());
        let mut dispatcher = dispatcher(Arc::clone(&input));

        let first = action(ActionKind::Click { x: 100, y: 100 }, "Click the icon");
        let second = action(ActionKind::Click { x: 200, y: 100 }, "Click the icon");
        assert!(dispatcher.execute(&first).await);
        assert!(dispatcher.execute(&second).await);
        assert_eq!(input.clicks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_key_sequence_single_key_uses_press() {
        let input = Arc::new(CountingInput::default());
        let mut dispatcher = dispatcher(Arc::clone(&input));

        let seq = action(ActionKind::KeySequence { keys: "enter".to_string() }, "Press enter");
        assert!(dispatcher.execute(&seq).await);
        assert_eq!(input.presses.load(Ordering::SeqCst), 1);
        assert!(input.hotkeys.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_key_sequence_combo_uses_hotkey() {
        let input = Arc::new(CountingInput::default());
        let mut dispatcher = dispatcher(Arc::clone(&input));

        let seq = action(ActionKind::KeySequence { keys: "ctrl + shift + t".to_string() }, "Reopen tab");
        assert!(dispatcher.execute(&seq).await);
        let hotkeys = input.hotkeys.lock().unwrap();
        assert_eq!(hotkeys.len(), 1);
        assert_eq!(hotkeys[0], vec!["ctrl", "shift", "t"]);
    }

    #[tokio::test]
    async fn test_unrecognized_kind_is_soft_success() {
        let input = Arc::new(CountingInput::default());
        let mut dispatcher = dispatcher(Arc::clone(&input));

        let odd = action(ActionKind::Unrecognized { raw_kind: "hover".to_string() }, "Hover the menu");
        assert!(dispatcher.execute(&odd).await);
        assert_eq!(input.presses.load(Ordering::SeqCst), 0);
        assert_eq!(input.clicks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_dispatch_reports_false_and_does_not_pin_fingerprint() {
        struct FailingInput;
        impl OsInput for FailingInput {
            fn press(&self, _key: &str) -> Result<()> {
                Err(anyhow::anyhow!("input blocked"))
            }
            fn hotkey(&self, _keys: &[String]) -> Result<()> {
                Ok(())
            }
            fn click(&self, _x: i32, _y: i32) -> Result<()> {
                Ok(())
            }
            fn type_text(&self, _text: &str) -> Result<()> {
                Ok(())
            }
            fn scroll(&self, _amount: i32) -> Result<()> {
                Ok(())
            }
        }

        let mut dispatcher = Dispatcher::new(Arc::new(FailingInput), Duration::from_secs(1));
        let press = action(ActionKind::Key { key: "enter".to_string() }, "Press enter");
        assert!(!dispatcher.execute(&press).await);
        // A failed action must not suppress its own retry-by-regeneration.
        assert!(dispatcher.last_fingerprint.is_none());
    }
}
