use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::evm::types::address_to_hex;
use crate::fuzz::report::{ExpressionRule, FuzzingReport, ParameterSummary, TermKind};

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
}

fn word_hex(word: &[u8; 32]) -> String {
    format!("0x{}", hex::encode(word))
}

fn hex_word(raw: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    if let Ok(bytes) = hex::decode(raw.trim_start_matches("0x")) {
        if bytes.len() == 32 {
            out.copy_from_slice(&bytes);
        }
    }
    out
}

/// One exported parameter rule; scalars are 0x-prefixed 32-byte words.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleParameter {
    pub param_index: usize,
    pub param_type: u8,
    #[serde(default)]
    pub single_values: Vec<String>,
    pub is_range: bool,
    #[serde(default)]
    pub range_min: String,
    #[serde(default)]
    pub range_max: String,
    pub occurrence_count: u64,
}

impl RuleParameter {
    pub fn from_summary(summary: &ParameterSummary) -> Self {
        Self {
            param_index: summary.param_index,
            param_type: summary.param_type,
            single_values: summary.single_values.iter().map(word_hex).collect(),
            is_range: summary.is_range,
            range_min: word_hex(&summary.range_min),
            range_max: word_hex(&summary.range_max),
            occurrence_count: summary.occurrence_count,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirewallRule {
    pub project: String,
    pub function_sig: String,
    pub threshold: f64,
    pub rule_count: u64,
    pub parameters: Vec<RuleParameter>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TermExport {
    pub kind: String,
    pub param_index: usize,
    pub param_type: u8,
    pub slot: String,
    pub coeff: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpressionExport {
    pub contract: String,
    pub function_sig: String,
    #[serde(rename = "type")]
    pub expression_type: String,
    pub terms: Vec<TermExport>,
    pub threshold: String,
    pub scale: u64,
    pub confidence: f64,
    pub sample_count: u64,
    pub min_margin_hex: String,
    pub strategy: String,
    pub generated_at: u64,
}

impl ExpressionExport {
    pub fn from_rule(rule: &ExpressionRule) -> Self {
        Self {
            contract: address_to_hex(rule.contract),
            function_sig: rule.function_sig.clone(),
            expression_type: rule.expression_type.clone(),
            terms: rule
                .terms
                .iter()
                .map(|t| TermExport {
                    kind: match t.kind {
                        TermKind::Param => "param".to_string(),
                        TermKind::Slot => "slot".to_string(),
                    },
                    param_index: t.param_index,
                    param_type: t.param_type,
                    slot: word_hex(&t.slot),
                    coeff: t.coeff,
                })
                .collect(),
            threshold: word_hex(&rule.threshold),
            scale: rule.scale,
            confidence: rule.confidence,
            sample_count: rule.sample_count,
            min_margin_hex: word_hex(&rule.min_margin),
            strategy: rule.strategy.clone(),
            generated_at: rule.generated_at,
        }
    }

    pub fn dedup_key(&self) -> String {
        let mut parts = vec![format!(
            "{}/{}/{}",
            self.contract, self.function_sig, self.expression_type
        )];
        for term in &self.terms {
            parts.push(format!(
                "{}:{}:{}:{}:{}",
                term.kind, term.param_index, term.param_type, term.slot, term.coeff
            ));
        }
        parts.join("|")
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RuleFile {
    pub version: u64,
    pub last_update: u64,
    #[serde(default)]
    pub rules: Vec<FirewallRule>,
    #[serde(default)]
    pub expressions: Vec<ExpressionExport>,
}

/// Merge `incoming` parameters into `existing`, per param index:
/// range+range widens to the union, discrete+discrete unions the value
/// sets, mixed shapes are superseded by the incoming one. Occurrences
/// accumulate. The merged result never shrinks.
pub fn merge_parameters(existing: &mut Vec<RuleParameter>, incoming: &[RuleParameter]) {
    for new_param in incoming {
        match existing
            .iter_mut()
            .find(|p| p.param_index == new_param.param_index)
        {
            None => existing.push(new_param.clone()),
            Some(old) => {
                let occurrences = old.occurrence_count + new_param.occurrence_count;
                if old.is_range && new_param.is_range {
                    if hex_word(&new_param.range_min) < hex_word(&old.range_min) {
                        old.range_min = new_param.range_min.clone();
                    }
                    if hex_word(&new_param.range_max) > hex_word(&old.range_max) {
                        old.range_max = new_param.range_max.clone();
                    }
                } else if !old.is_range && !new_param.is_range {
                    for value in &new_param.single_values {
                        if !old.single_values.contains(value) {
                            old.single_values.push(value.clone());
                        }
                    }
                } else {
                    // shape changed; the newer observation wins
                    *old = new_param.clone();
                }
                old.occurrence_count = occurrences;
            }
        }
    }
}

/// Merge expressions by `(contract, functionSig, type)` with a structural
/// de-dup over all linear terms.
pub fn merge_expressions(existing: &mut Vec<ExpressionExport>, incoming: &[ExpressionExport]) {
    let mut seen: HashSet<String> = existing.iter().map(|e| e.dedup_key()).collect();
    for expression in incoming {
        if seen.insert(expression.dedup_key()) {
            existing.push(expression.clone());
        }
    }
}

/// Maintains the local rules file: merges reports keyed by
/// `(project, functionSig)` and persists atomically (tmp + rename).
pub struct RuleExporter {
    path: PathBuf,
    enabled: bool,
    collection: RwLock<RuleFile>,
}

impl RuleExporter {
    pub fn new(path: PathBuf, enabled: bool, format: &str) -> Self {
        if format.eq_ignore_ascii_case("yaml") {
            // the yaml branch never shipped anywhere real; emit json
            warn!("yaml rule export requested, emitting json");
        }
        let collection = std::fs::read_to_string(&path)
            .ok()
            .and_then(|data| serde_json::from_str(&data).ok())
            .unwrap_or_else(|| RuleFile {
                version: 1,
                ..Default::default()
            });
        Self {
            path,
            enabled,
            collection: RwLock::new(collection),
        }
    }

    pub fn merge_report(&self, report: &FuzzingReport) {
        if !self.enabled {
            return;
        }
        let mut collection = self.collection.write().unwrap();
        let incoming_params: Vec<RuleParameter> = report
            .valid_parameters
            .iter()
            .map(RuleParameter::from_summary)
            .collect();

        match collection.rules.iter_mut().find(|r| {
            r.project == report.project && r.function_sig == report.function_signature
        }) {
            Some(rule) => {
                merge_parameters(&mut rule.parameters, &incoming_params);
                rule.rule_count += 1;
                rule.threshold = rule.threshold.max(report.stats.max_similarity);
            }
            None => collection.rules.push(FirewallRule {
                project: report.project.clone(),
                function_sig: report.function_signature.clone(),
                threshold: report.stats.max_similarity,
                rule_count: 1,
                parameters: incoming_params,
            }),
        }

        let incoming_expressions: Vec<ExpressionExport> = report
            .expression_rules
            .iter()
            .map(ExpressionExport::from_rule)
            .collect();
        merge_expressions(&mut collection.expressions, &incoming_expressions);
        debug!(
            project = %report.project,
            sig = %report.function_signature,
            "merged report into rule collection"
        );
    }

    /// Atomic write: serialize to `<path>.tmp`, then rename over the
    /// target. Rename is atomic within a filesystem.
    pub fn persist(&self) -> Result<(), ExportError> {
        if !self.enabled {
            return Ok(());
        }
        let mut collection = self.collection.write().unwrap();
        collection.last_update = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let data = serde_json::to_string_pretty(&*collection)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, data).map_err(|source| ExportError::Io {
            path: tmp.display().to_string(),
            source,
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|source| ExportError::Io {
            path: self.path.display().to_string(),
            source,
        })?;
        info!(path = %self.path.display(), rules = collection.rules.len(), "rules persisted");
        Ok(())
    }

    pub fn snapshot(&self) -> RuleFile {
        self.collection.read().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evm::types::{EVMAddress, EVMU256};
    use crate::fuzz::report::FuzzingStats;

    fn word(v: u64) -> [u8; 32] {
        EVMU256::from(v).to_be_bytes::<32>()
    }

    fn report_with(
        discrete0: Vec<u64>,
        range1: (u64, u64),
    ) -> FuzzingReport {
        FuzzingReport {
            project: "p1".into(),
            contract: EVMAddress::from_slice(&[1; 20]),
            selector: [0; 4],
            function_signature: "swap(uint256,uint256)".into(),
            stats: FuzzingStats {
                max_similarity: 0.9,
                ..Default::default()
            },
            valid_parameters: vec![
                ParameterSummary {
                    param_index: 0,
                    param_type: 0,
                    is_range: false,
                    single_values: discrete0.iter().map(|v| word(*v)).collect(),
                    range_min: [0; 32],
                    range_max: [0; 32],
                    occurrence_count: discrete0.len() as u64,
                },
                ParameterSummary {
                    param_index: 1,
                    param_type: 0,
                    is_range: true,
                    single_values: vec![],
                    range_min: word(range1.0),
                    range_max: word(range1.1),
                    occurrence_count: 1,
                },
            ],
            expression_rules: vec![],
            constraint_rule: None,
            origin_tx_hash: "0x0".into(),
        }
    }

    #[test]
    fn merge_unions_discrete_and_widens_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        let exporter = RuleExporter::new(path.clone(), true, "json");

        exporter.merge_report(&report_with(vec![0x01], (0x10, 0x20)));
        exporter.merge_report(&report_with(vec![0x02], (0x05, 0x18)));
        exporter.persist().unwrap();

        let written: RuleFile =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written.rules.len(), 1);
        let rule = &written.rules[0];
        assert_eq!(rule.rule_count, 2);

        let p0 = &rule.parameters[0];
        assert!(!p0.is_range);
        let mut values = p0.single_values.clone();
        values.sort();
        assert_eq!(values, vec![word_hex(&word(1)), word_hex(&word(2))]);
        assert_eq!(p0.occurrence_count, 2);

        let p1 = &rule.parameters[1];
        assert!(p1.is_range);
        assert_eq!(p1.range_min, word_hex(&word(0x05)));
        assert_eq!(p1.range_max, word_hex(&word(0x20)));

        // no tmp file left behind
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn merge_never_shrinks() {
        let mut existing = vec![RuleParameter {
            param_index: 0,
            param_type: 0,
            is_range: true,
            single_values: vec![],
            range_min: word_hex(&word(10)),
            range_max: word_hex(&word(20)),
            occurrence_count: 1,
        }];
        merge_parameters(
            &mut existing,
            &[RuleParameter {
                param_index: 0,
                param_type: 0,
                is_range: true,
                single_values: vec![],
                range_min: word_hex(&word(15)),
                range_max: word_hex(&word(18)),
                occurrence_count: 1,
            }],
        );
        // narrower incoming range does not shrink the union
        assert_eq!(existing[0].range_min, word_hex(&word(10)));
        assert_eq!(existing[0].range_max, word_hex(&word(20)));
        assert_eq!(existing[0].occurrence_count, 2);
    }

    #[test]
    fn expressions_dedup_structurally() {
        let term = TermExport {
            kind: "param".into(),
            param_index: 0,
            param_type: 0,
            slot: word_hex(&[0; 32]),
            coeff: 1,
        };
        let expression = ExpressionExport {
            contract: "0x01".into(),
            function_sig: "f()".into(),
            expression_type: "param_ge_threshold".into(),
            terms: vec![term],
            threshold: word_hex(&word(5)),
            scale: 1,
            confidence: 0.5,
            sample_count: 2,
            min_margin_hex: word_hex(&word(0)),
            strategy: "boundary-scan".into(),
            generated_at: 0,
        };
        let mut existing = vec![];
        merge_expressions(&mut existing, &[expression.clone()]);
        merge_expressions(&mut existing, &[expression.clone()]);
        assert_eq!(existing.len(), 1);
        let mut different = expression;
        different.terms[0].coeff = 2;
        merge_expressions(&mut existing, &[different]);
        assert_eq!(existing.len(), 2);
    }
}
