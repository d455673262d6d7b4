//! Offline keyword analysis of tool output.

use std::sync::LazyLock;

use regex::Regex;

use crate::analysis::{AnalysisInput, FallbackAnalyzer};
use crate::error::FallbackFailure;
use crate::job::{Assessment, Provenance, Severity, Vulnerability};

const FALLBACK_CONFIDENCE: f32 = 0.7;
const FALLBACK_MODEL: &str = "fallback_rules";

/// Added per distinct finding beyond the first.
const PER_FINDING_BONUS: u32 = 5;

const GENERIC_MITIGATIONS: &[&str] = &[
    "Review the findings with the system owner and confirm they are in scope",
    "Re-run the simulation after remediation to verify the fixes",
];

struct Rule {
    kind: &'static str,
    pattern: Regex,
    severity: Severity,
    cvss: f32,
    description: &'static str,
    mitigation: &'static str,
}

fn rule(
    kind: &'static str,
    pattern: &str,
    severity: Severity,
    cvss: f32,
    description: &'static str,
    mitigation: &'static str,
) -> Rule {
    Rule {
        kind,
        pattern: Regex::new(pattern).expect("static fallback rule pattern"),
        severity,
        cvss,
        description,
        mitigation,
    }
}

static RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    vec![
        rule(
            "remote_code_execution",
            r"(?i)remote[\s_-]code[\s_-]execution|\brce\b|command[\s_-]injection",
            Severity::Critical,
            9.8,
            "Output indicates remote code or command execution",
            "Patch or isolate the affected service immediately and audit for compromise",
        ),
        rule(
            "buffer_overflow",
            r"(?i)buffer[\s_-]?overflow|stack[\s_-]smashing",
            Severity::Critical,
            9.0,
            "Output indicates a memory corruption issue",
            "Update the affected binary and enable exploit mitigations (ASLR, stack canaries)",
        ),
        rule(
            "sql_injection",
            r"(?i)sql[\s_-]?injection|\bsqli\b|injectable",
            Severity::High,
            8.5,
            "Output indicates SQL injection",
            "Use parameterized queries and input validation",
        ),
        rule(
            "weak_authentication",
            r"(?i)weak[\s_-]?(auth|authentication|password|credentials?)|default[\s_-](credentials?|password)|anonymous[\s_-]login",
            Severity::High,
            7.5,
            "Output indicates weak or default authentication",
            "Implement MFA and strong password policies",
        ),
        rule(
            "known_cve",
            r"\bCVE-\d{4}-\d{4,}\b",
            Severity::High,
            7.0,
            "Output references a known CVE",
            "Apply vendor patches for the referenced CVEs",
        ),
        rule(
            "csrf",
            r"(?i)\bcsrf\b|cross[\s-]site[\s-]request[\s-]forgery",
            Severity::Medium,
            6.5,
            "Output indicates cross-site request forgery",
            "Require anti-CSRF tokens and SameSite cookies",
        ),
        rule(
            "xss",
            r"(?i)\bxss\b|cross[\s-]site[\s-]scripting",
            Severity::Medium,
            6.1,
            "Output indicates cross-site scripting",
            "Implement output encoding and CSP headers",
        ),
        rule(
            "weak_tls",
            r"(?i)\bsslv[23]\b|\btlsv1\.0\b|weak[\s_-]cipher|self[\s-]signed[\s_-]certificate",
            Severity::Medium,
            5.9,
            "Output indicates weak TLS configuration",
            "Disable legacy protocols and ciphers and deploy trusted certificates",
        ),
        rule(
            "open_ports",
            r"(?im)^\s*\d{1,5}/(tcp|udp)\s+open\b|open[\s_]ports?",
            Severity::Medium,
            5.0,
            "Output lists reachable open ports",
            "Close unnecessary ports and implement firewall rules",
        ),
    ]
});

fn severity_weight(severity: Severity) -> u32 {
    match severity {
        Severity::Critical => 90,
        Severity::High => 75,
        Severity::Medium => 50,
        Severity::Low => 25,
    }
}

/// Baseline risk implied by how aggressive the simulation was.
fn job_baseline(severity: Severity) -> u32 {
    match severity {
        Severity::Critical => 90,
        Severity::High => 80,
        Severity::Medium => 50,
        Severity::Low => 20,
    }
}

/// Risk score from the job's severity and the matched findings, in [1, 100].
fn risk_score(job_severity: Severity, findings: &[&Rule]) -> u8 {
    let baseline = job_baseline(job_severity);
    let score = match findings.iter().map(|r| severity_weight(r.severity)).max() {
        None => baseline / 4,
        Some(worst) => {
            (worst + baseline) / 2 + PER_FINDING_BONUS * (findings.len() as u32 - 1)
        }
    };
    score.clamp(1, 100) as u8
}

/// Regex-table analyzer. Always available, never calls out.
#[derive(Debug, Default, Clone, Copy)]
pub struct RuleBasedAnalyzer;

impl RuleBasedAnalyzer {
    pub fn new() -> Self {
        Self
    }
}

impl FallbackAnalyzer for RuleBasedAnalyzer {
    fn analyze(&self, input: &AnalysisInput) -> Result<Assessment, FallbackFailure> {
        let findings: Vec<&Rule> = RULES
            .iter()
            .filter(|r| r.pattern.is_match(&input.output))
            .collect();

        let vulnerabilities = findings
            .iter()
            .map(|r| Vulnerability {
                kind: r.kind.to_string(),
                description: r.description.to_string(),
                severity: r.severity,
                cvss: Some(r.cvss),
            })
            .collect();

        let mut mitigations: Vec<String> = Vec::new();
        for step in findings
            .iter()
            .map(|r| r.mitigation)
            .chain(GENERIC_MITIGATIONS.iter().copied())
        {
            if !mitigations.iter().any(|m| m == step) {
                mitigations.push(step.to_string());
            }
        }

        let summary = if findings.is_empty() {
            format!(
                "Rule-based analysis of {} output found no known vulnerability patterns",
                input.tool
            )
        } else {
            let kinds: Vec<&str> = findings.iter().map(|r| r.kind).collect();
            format!(
                "Rule-based analysis of {} output found {} issue type(s): {}",
                input.tool,
                findings.len(),
                kinds.join(", ")
            )
        };

        let assessment = Assessment {
            vulnerabilities,
            risk_score: risk_score(input.severity, &findings),
            confidence: FALLBACK_CONFIDENCE,
            mitigations,
            summary,
            provenance: Provenance::Fallback,
            model: FALLBACK_MODEL.to_string(),
        };

        assessment
            .validate()
            .map_err(|reason| FallbackFailure { reason })?;
        Ok(assessment)
    }
}
