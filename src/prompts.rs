/// Marker line the planner's thinking phase may emit to request one context
/// refresh before committing to a plan. Checked verbatim, at most once per
/// goal.
pub const CONTEXT_REFRESH_MARKER: &str = "CONTEXT_REFRESH_REQUIRED";

pub const OBJECTIVE_SYSTEM_PROMPT: &str = r#"
You restate user requests as concrete desktop-automation objectives.
Given the user's goal, reply with brief reasoning followed by a single final
line containing only the actionable objective. The final line must stand on
its own: specific, imperative, and achievable through mouse and keyboard.
"#;

pub const VISUAL_ANALYSIS_PROMPT: &str = r#"
You are describing a desktop screenshot to an automation agent.
Below is the list of UI elements detected on screen, each with its pixel
center coordinates and whether it is interactive.

Write a short narrative of what is on screen: which application is in focus,
which controls are visible, and where the notable interactive elements sit
(use their pixel coordinates). Do not invent elements that are not listed.

ELEMENTS:
{elements}
"#;

pub const THINKING_PROMPT: &str = r#"
You are planning how to accomplish an objective on a live desktop.

OBJECTIVE: {objective}

CURRENT SCREEN: {narrative}

Reason about the state of the screen and the strategy to reach the objective.
If the screen description above is insufficient to plan, reply with a single
line containing exactly CONTEXT_REFRESH_REQUIRED and nothing else.
Otherwise reply with your strategic reasoning as plain text.
"#;

pub const STEPS_PROMPT: &str = r#"
Turn the strategy below into an ordered list of concrete UI steps.

OBJECTIVE: {objective}

STRATEGY: {thinking}

CURRENT SCREEN: {narrative}

Reply with a numbered list, one step per line (e.g. "1. Open the start menu").
Each step must be a single mouse or keyboard interaction the agent can
perform. No headings, no commentary.
"#;

pub const ACTION_SYSTEM_PROMPT: &str = r#"
You control a desktop through single JSON actions. Reply with exactly one
action for the step you are given, inside a ```json fenced block.

Available actions:
1. Click: { "kind": "click", "x": 640, "y": 360, "description": "..." }
2. Type: { "kind": "type", "text": "hello", "description": "..." }
3. Key: { "kind": "key", "key": "enter", "description": "..." }
4. Key combo: { "kind": "key_sequence", "keys": "ctrl+l", "description": "..." }
5. Scroll: { "kind": "scroll", "amount": -3, "description": "..." }

Every action carries "description" (what it does, one sentence) and
"confidence" (0-100). Coordinates are screen pixels. Output ONLY the JSON.
"#;

pub fn visual_analysis_prompt(elements_json: &str) -> String {
    VISUAL_ANALYSIS_PROMPT.replace("{elements}", elements_json)
}

pub fn thinking_prompt(objective: &str, narrative: &str) -> String {
    THINKING_PROMPT
        .replace("{objective}", objective)
        .replace("{narrative}", narrative)
}

pub fn steps_prompt(objective: &str, thinking: &str, narrative: &str) -> String {
    STEPS_PROMPT
        .replace("{objective}", objective)
        .replace("{thinking}", thinking)
        .replace("{narrative}", narrative)
}

pub fn action_user_prompt(
    step: &str,
    objective: &str,
    narrative: &str,
    attempt: u32,
    context_stale: bool,
) -> String {
    let mut prompt = format!(
        "CURRENT SCREEN:\n{}\n\nOVERALL OBJECTIVE:\n{}\n\nSTEP TO PERFORM NOW:\n{}\n",
        narrative, objective, step
    );
    if context_stale {
        prompt.push_str(
            "\nNote: earlier actions likely changed the screen since this description was captured.\n",
        );
    }
    if attempt > 1 {
        prompt.push_str(&format!(
            "\nAttempt {} for this step. Previous replies could not be parsed as one JSON action; reply with exactly one action in a ```json block.\n",
            attempt
        ));
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_substitution() {
        let p = thinking_prompt("open chrome", "desktop is visible");
        assert!(p.contains("open chrome"));
        assert!(p.contains("desktop is visible"));
        assert!(!p.contains("{objective}"));
    }

    #[test]
    fn test_retry_note_only_after_first_attempt() {
        let first = action_user_prompt("Open search", "obj", "screen", 1, false);
        assert!(!first.contains("Attempt"));
        let second = action_user_prompt("Open search", "obj", "screen", 2, true);
        assert!(second.contains("Attempt 2"));
        assert!(second.contains("changed the screen"));
    }
}
