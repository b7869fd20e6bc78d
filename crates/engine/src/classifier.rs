//! Risk classification
//!
//! Maps the aggregate metrics of an impact analysis onto a coarse risk level.
//! Thresholds live in a [`RiskTable`] so they can be tuned through configuration
//! without touching the evaluation logic.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::impact::{ImpactAnalysis, ImpactMetrics, RecommendedAction};

/// Coarse severity of a plan change
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
            RiskLevel::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            "critical" => Ok(RiskLevel::Critical),
            other => Err(format!("unknown risk level '{}'", other)),
        }
    }
}

/// One row of the threshold table. A row matches when either threshold is met.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskThreshold {
    pub level: RiskLevel,
    pub min_affected: u64,
    pub min_revenue_impact: Decimal,
}

impl RiskThreshold {
    fn matches(&self, metrics: &ImpactMetrics) -> bool {
        metrics.affected_count >= self.min_affected
            || metrics.revenue_impact >= self.min_revenue_impact
    }
}

/// Threshold rows ordered from most to least severe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskTable {
    rows: Vec<RiskThreshold>,
}

impl Default for RiskTable {
    fn default() -> Self {
        let row = |level, min_affected, revenue: i64| RiskThreshold {
            level,
            min_affected,
            min_revenue_impact: Decimal::from(revenue),
        };
        Self {
            rows: vec![
                row(RiskLevel::Critical, 500, 20_000),
                row(RiskLevel::High, 200, 5_000),
                row(RiskLevel::Medium, 50, 1_000),
                row(RiskLevel::Low, 0, 0),
            ],
        }
    }
}

impl RiskTable {
    /// Build a table, ordering rows critical first and requiring a `low` row
    pub fn new(mut rows: Vec<RiskThreshold>) -> Result<Self, String> {
        rows.sort_by(|a, b| b.level.cmp(&a.level));
        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = rows.iter().find(|r| !seen.insert(r.level)) {
            return Err(format!("risk level {} listed twice", dup.level));
        }
        if !rows.iter().any(|r| r.level == RiskLevel::Low) {
            return Err("risk table needs a 'low' row".to_string());
        }
        Ok(Self { rows })
    }

    /// Parse `level:affected:revenue` entries separated by commas,
    /// e.g. `critical:500:20000,high:200:5000,medium:50:1000,low:0:0`
    pub fn parse(raw: &str) -> Result<Self, String> {
        let rows = raw
            .split(',')
            .map(|entry| {
                let parts: Vec<&str> = entry.split(':').map(str::trim).collect();
                if parts.len() != 3 {
                    return Err(format!("expected level:affected:revenue, got '{}'", entry));
                }
                Ok(RiskThreshold {
                    level: parts[0].parse()?,
                    min_affected: parts[1]
                        .parse()
                        .map_err(|_| format!("bad affected count '{}'", parts[1]))?,
                    min_revenue_impact: parts[2]
                        .parse()
                        .map_err(|_| format!("bad revenue threshold '{}'", parts[2]))?,
                })
            })
            .collect::<Result<Vec<_>, String>>()?;
        Self::new(rows)
    }

    pub fn rows(&self) -> &[RiskThreshold] {
        &self.rows
    }
}

/// Risk verdict embedded in every impact analysis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    /// Affected-count threshold of the matching row
    pub affected_threshold: u64,
    /// Revenue-impact threshold of the matching row
    pub revenue_threshold: Decimal,
    pub recommendations: Vec<String>,
}

/// Pure classifier over impact metrics
#[derive(Debug, Clone, Default)]
pub struct RiskClassifier {
    table: RiskTable,
}

impl RiskClassifier {
    pub fn new(table: RiskTable) -> Self {
        Self { table }
    }

    pub fn classify(&self, impact: &ImpactAnalysis) -> RiskAssessment {
        self.assess(&impact.metrics)
    }

    pub fn assess(&self, metrics: &ImpactMetrics) -> RiskAssessment {
        let matched = if metrics.affected_count == 0 {
            None
        } else {
            self.table.rows.iter().find(|row| row.matches(metrics))
        };

        // Below every row is still low; report the low row's own thresholds
        let row = matched.or_else(|| self.table.rows.iter().find(|r| r.level == RiskLevel::Low));
        let (level, affected_threshold, revenue_threshold) = match row {
            Some(row) => (row.level, row.min_affected, row.min_revenue_impact),
            None => (RiskLevel::Low, 0, Decimal::ZERO),
        };

        RiskAssessment {
            level,
            affected_threshold,
            revenue_threshold,
            recommendations: recommendations(level, metrics),
        }
    }
}

fn recommendations(level: RiskLevel, metrics: &ImpactMetrics) -> Vec<String> {
    let mut out = Vec::new();

    if metrics.affected_count == 0 {
        out.push("No active subscriptions are affected; the change can be applied directly".to_string());
        return out;
    }

    out.push(
        match level {
            RiskLevel::Critical => {
                "Critical impact: an explicit override is required before planning a migration"
            }
            RiskLevel::High => "High impact: review affected accounts and use a long grace period",
            RiskLevel::Medium => "Medium impact: notify affected subscribers ahead of the change",
            RiskLevel::Low => "Low impact: safe to apply with standard notice",
        }
        .to_string(),
    );

    let majority = |action| metrics.count_for(action) * 2 > metrics.affected_count;
    if majority(RecommendedAction::Migrate) {
        out.push("Stage a migration plan before applying".to_string());
    } else if majority(RecommendedAction::Upgrade) {
        out.push("Prepare upgrade offers for affected subscribers".to_string());
    } else if majority(RecommendedAction::Grandfather) {
        out.push("Consider grandfathering existing subscribers at their current price".to_string());
    } else if majority(RecommendedAction::Downgrade) {
        out.push("Offer cheaper alternatives to subscribers who are behind on payment".to_string());
    }

    if metrics.exceeding_limits_count > 0 {
        out.push(format!(
            "{} subscriptions will exceed the new limit; create a migration plan before applying",
            metrics.exceeding_limits_count
        ));
    }
    if metrics.losing_features_count > 0 {
        out.push(format!(
            "{} subscriptions will lose features they currently use",
            metrics.losing_features_count
        ));
    }

    out
}
