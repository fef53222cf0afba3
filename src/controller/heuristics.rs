use once_cell::sync::Lazy;

use crate::input::{meta_key, os_search_chord};
use crate::schema::{Action, ActionKind, ActionProvenance};

/// Applications the fallback rules can recognize in step text, with the
/// query typed into OS search to reach them.
static KNOWN_APPS: Lazy<Vec<(&'static str, &'static str)>> = Lazy::new(|| {
    vec![
        ("chrome", "Chrome"),
        ("firefox", "Firefox"),
        ("edge", "Edge"),
        ("calculator", "Calculator"),
        ("notepad", "Notepad"),
        ("terminal", "Terminal"),
        ("explorer", "File Explorer"),
        ("files", "Files"),
        ("settings", "Settings"),
    ]
});

fn fallback(kind: ActionKind, description: impl Into<String>, confidence: u8) -> Action {
    Action {
        kind,
        description: description.into(),
        confidence,
        provenance: ActionProvenance::Fallback,
    }
}

fn open_search_action(why: &str) -> Action {
    fallback(
        ActionKind::KeySequence { keys: os_search_chord().join("+") },
        format!("Open OS search ({})", why),
        60,
    )
}

/// Deterministic keyword-based action generator. Rules are ordered by
/// priority; the first match wins. This exists to keep the loop advancing
/// when the language model is degraded — it is a fixed rule table, nothing
/// is learned. Returns None only when there is no text to key off at all.
pub fn fallback_action(step: &str, objective: &str) -> Option<Action> {
    let step_lower = step.to_lowercase();
    let combined = format!("{} {}", step_lower, objective.to_lowercase());
    if combined.trim().is_empty() {
        return None;
    }

    // 1. Explicit search intent: bring up the OS search surface.
    if step_lower.contains("search") || step_lower.contains("find ") {
        return Some(open_search_action("step asks to search"));
    }

    // 2. Start-menu / launcher intent: the meta key on its own.
    if step_lower.contains("start menu") || step_lower.contains("launcher") {
        return Some(fallback(
            ActionKind::Key { key: meta_key().to_string() },
            "Press the OS meta key to open the start menu",
            65,
        ));
    }

    // 3. Known application mentioned: pick a template off the verb.
    for (needle, query) in KNOWN_APPS.iter() {
        if !combined.contains(needle) {
            continue;
        }
        if step_lower.contains("type") || step_lower.contains("enter the name") {
            return Some(fallback(
                ActionKind::Type { text: (*query).to_string() },
                format!("Type '{}' into the search box", query),
                70,
            ));
        }
        if step_lower.contains("press enter") || step_lower.contains("launch") || step_lower.contains("open") {
            return Some(fallback(
                ActionKind::Key { key: "enter".to_string() },
                format!("Press enter to launch {}", query),
                65,
            ));
        }
        if step_lower.contains("click") {
            return Some(fallback(
                ActionKind::Click { x: 300, y: 200 },
                format!("Click where {} is expected", query),
                55,
            ));
        }
        // App named but verb unclear: typing its name into search is the
        // least destructive way forward.
        return Some(fallback(
            ActionKind::Type { text: (*query).to_string() },
            format!("Type '{}' to search for it", query),
            55,
        ));
    }

    // 4. Generic click intent: canonical mid-screen region.
    if step_lower.contains("click") {
        return Some(fallback(
            ActionKind::Click { x: 640, y: 360 },
            "Click the center screen region",
            45,
        ));
    }

    // 5. Nothing matched: opening OS search at least changes state in a
    // recoverable way.
    Some(open_search_action("no rule matched"))
}

/// Last-resort action when retries are exhausted and no fallback rule gave
/// anything better. Pressing the platform meta key is recoverable on every
/// supported OS.
pub fn emergency_action() -> Action {
    Action {
        kind: ActionKind::Key { key: meta_key().to_string() },
        description: "Press the OS meta key (emergency fallback)".to_string(),
        confidence: 20,
        provenance: ActionProvenance::Emergency,
    }
}
