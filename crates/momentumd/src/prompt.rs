//! Agent prompt construction.

use momentum_core::{Guardrail, Task};
use std::fmt::Write as _;

/// Preamble used when no custom instructions are configured.
pub const DEFAULT_INSTRUCTIONS: &str = "\
Goal: finish exactly one board task, confirm the change works, then move the task to done on the board.

Process:
1) Read the task context below and locate the code it concerns.
2) Study the surrounding files and follow their existing patterns; keep the change small.
3) Implement the task.
4) Verify it:
   - Run the project's existing tests or scripts where they exist; otherwise run a build or a focused manual check.
   - Say what you ran and what happened.
   - Leave a comment on the task summarising the change and the verification.
5) Set the task status to \"done\" on the board and name the task ID in your final message.

Constraints:
- Leave unrelated files alone.
- Never reset or revert changes you did not make.
- Keep explanations short.

If something blocks you, stop and describe the blocker rather than guessing, move the task back to \"planning\", and comment with the reason.";

/// Render the prompt for `task`. `instructions` replaces the default preamble;
/// the task context is always appended.
pub fn build_prompt(task: &Task, instructions: Option<&str>) -> String {
    let preamble = instructions
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .unwrap_or(DEFAULT_INSTRUCTIONS);

    let mut out = String::with_capacity(preamble.len() + 256);
    out.push_str(preamble.trim_end());
    out.push_str("\n\nTask context:\n");
    let _ = writeln!(out, "- Task ID: {}", task.id);
    let _ = writeln!(out, "- Task: {}", task.title);
    if !task.notes.is_empty() {
        let _ = writeln!(out, "- Details:\n{}", task.notes);
    }

    if !task.acceptance_criteria.is_empty() {
        out.push_str("\nAcceptance Criteria:\n");
        for criterion in &task.acceptance_criteria {
            let _ = writeln!(out, "- [ ] {criterion}");
        }
    }

    if !task.guardrails.is_empty() {
        out.push_str("\nGuardrails:\n");
        for guardrail in by_priority(&task.guardrails) {
            let _ = writeln!(out, "- {}", guardrail.text);
        }
    }

    out
}

/// Most critical (highest number) first; equal numbers keep their order.
fn by_priority(guardrails: &[Guardrail]) -> Vec<&Guardrail> {
    let mut sorted: Vec<&Guardrail> = guardrails.iter().collect();
    sorted.sort_by(|a, b| b.number.cmp(&a.number));
    sorted
}
