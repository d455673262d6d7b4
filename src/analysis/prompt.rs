use crate::analysis::AnalysisInput;
use crate::job::ExitStatus;

pub const TRUNCATION_MARKER: &str = "\n[... output truncated ...]\n";

pub(crate) const SYSTEM_PROMPT: &str = "You are a security analyst. You review the raw output of \
an authorized attack-simulation tool and report the vulnerabilities it shows, an overall risk \
score and concrete mitigations. Reply with a single JSON object and nothing else.";

/// Keep at most `max_chars` characters of `text`, cutting from the middle.
///
/// Head and tail are kept (head gets the extra char on odd splits) with
/// [`TRUNCATION_MARKER`] between them. The marker counts toward the limit,
/// except when the limit is smaller than the marker itself.
pub fn truncate_middle(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }

    let marker_len = TRUNCATION_MARKER.chars().count();
    let budget = max_chars.saturating_sub(marker_len);
    let head_chars = budget.div_ceil(2);
    let tail_chars = budget / 2;

    let head_end = text
        .char_indices()
        .nth(head_chars)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let tail_start = text
        .char_indices()
        .nth(total - tail_chars)
        .map(|(i, _)| i)
        .unwrap_or(text.len());

    let mut out = String::with_capacity(head_end + marker_len + (text.len() - tail_start));
    out.push_str(&text[..head_end]);
    out.push_str(TRUNCATION_MARKER);
    out.push_str(&text[tail_start..]);
    out
}

pub(crate) fn build_prompt(input: &AnalysisInput, max_context_chars: usize) -> String {
    let exit = match input.exit {
        ExitStatus::Exited(code) => format!("exited with code {}", code),
        ExitStatus::TimedOut => "killed after timeout (partial output)".to_string(),
    };
    let output = if input.output.trim().is_empty() {
        "(no output)".to_string()
    } else {
        truncate_middle(&input.output, max_context_chars)
    };

    format!(
        r#"Analyze the following attack simulation.

JOB
- Tool: {tool}
- Target: {target}
- Severity level: {severity}
- Attack vectors: {vectors}
- Tool status: {exit}{capped}

TOOL OUTPUT
{output}

Respond with JSON in exactly this shape:
{{
  "vulnerabilities": [
    {{"kind": "string", "description": "string", "severity": "low|medium|high|critical", "cvss": 0.0}}
  ],
  "risk_score": 1,
  "confidence": 0.0,
  "mitigations": ["string"],
  "summary": "string"
}}

risk_score is an integer from 1 to 100. cvss is optional (0.0 to 10.0). List mitigations in the
order they should be applied."#,
        tool = input.tool,
        target = input.target_description,
        severity = input.severity,
        vectors = input.attack_vectors,
        exit = exit,
        capped = if input.truncated {
            ", output capped"
        } else {
            ""
        },
        output = output,
    )
}
