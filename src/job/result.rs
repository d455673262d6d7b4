use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Severity;

/// How the tool process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "code")]
pub enum ExitStatus {
    /// The tool exited on its own. A non-zero code is still tool output.
    Exited(i64),
    /// The wall-clock deadline expired and the container was killed.
    TimedOut,
}

/// Raw output of one sandboxed tool run. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub container_id: String,
    pub output: String,
    pub exit: ExitStatus,
    /// Output was cut short, either by the byte cap or by a timeout.
    pub truncated: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionResult {
    pub fn timed_out(&self) -> bool {
        self.exit == ExitStatus::TimedOut
    }
}

/// Which analyzer produced an assessment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Ai,
    Fallback,
}

impl std::fmt::Display for Provenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ai => write!(f, "ai"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vulnerability {
    /// Short machine-friendly label, e.g. `sql_injection`.
    pub kind: String,
    pub description: String,
    pub severity: Severity,
    /// CVSS-like base score in `0.0..=10.0`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cvss: Option<f32>,
}

/// Analysis of one job's tool output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    pub vulnerabilities: Vec<Vulnerability>,
    /// Aggregate risk in `1..=100`.
    pub risk_score: u8,
    /// Confidence in `0.0..=1.0`.
    pub confidence: f32,
    pub mitigations: Vec<String>,
    pub summary: String,
    pub provenance: Provenance,
    /// Model or rule set that produced the assessment.
    pub model: String,
}

impl Assessment {
    /// Check the structural invariants shared by both analyzers.
    pub fn validate(&self) -> Result<(), String> {
        if !(1..=100).contains(&self.risk_score) {
            return Err(format!("risk score {} outside 1..=100", self.risk_score));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(format!("confidence {} outside 0.0..=1.0", self.confidence));
        }
        for vuln in &self.vulnerabilities {
            if vuln.description.trim().is_empty() {
                return Err("vulnerability with empty description".to_string());
            }
            if let Some(cvss) = vuln.cvss
                && !(0.0..=10.0).contains(&cvss)
            {
                return Err(format!("cvss {} outside 0.0..=10.0", cvss));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assessment() -> Assessment {
        Assessment {
            vulnerabilities: vec![Vulnerability {
                kind: "open_ports".to_string(),
                description: "Port 22 open".to_string(),
                severity: Severity::Medium,
                cvss: Some(5.0),
            }],
            risk_score: 40,
            confidence: 0.7,
            mitigations: vec!["Close unused ports".to_string()],
            summary: "One finding".to_string(),
            provenance: Provenance::Fallback,
            model: "rules".to_string(),
        }
    }

    #[test]
    fn test_validate_accepts_well_formed() {
        assert!(assessment().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let mut a = assessment();
        a.risk_score = 0;
        assert!(a.validate().is_err());

        let mut a = assessment();
        a.vulnerabilities[0].cvss = Some(11.5);
        assert!(a.validate().is_err());

        let mut a = assessment();
        a.confidence = 1.5;
        assert!(a.validate().is_err());
    }

    #[test]
    fn test_exit_status_serialization() {
        let json = serde_json::to_string(&ExitStatus::Exited(2)).unwrap();
        assert_eq!(json, r#"{"kind":"exited","code":2}"#);
        let json = serde_json::to_string(&ExitStatus::TimedOut).unwrap();
        assert_eq!(json, r#"{"kind":"timed_out"}"#);
    }
}
