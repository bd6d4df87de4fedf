use crate::assembler::Statement;
use crate::period::PeriodColumn;
use crate::taxonomy::CanonicalLineItem;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MetricName {
    GrossMargin,
    OperatingMargin,
    NetMargin,
    EbitdaMargin,
    YoYRevenueGrowth,
    YoYNetIncomeGrowth,
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricFormula {
    Ratio {
        numerator: CanonicalLineItem,
        denominator: CanonicalLineItem,
    },
    /// `(x[p] - x[prior]) / x[prior]`, prior = same kind of period one year earlier
    Growth { item: CanonicalLineItem },
}

impl fmt::Display for MetricFormula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricFormula::Ratio {
                numerator,
                denominator,
            } => write!(f, "{} / {}", numerator, denominator),
            MetricFormula::Growth { item } => write!(f, "yoy_growth({})", item),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricDefinition {
    pub name: MetricName,
    pub formula: MetricFormula,
}

use CanonicalLineItem::*;

pub const DEFAULT_METRICS: &[MetricDefinition] = &[
    MetricDefinition {
        name: MetricName::GrossMargin,
        formula: MetricFormula::Ratio {
            numerator: GrossProfit,
            denominator: Revenue,
        },
    },
    MetricDefinition {
        name: MetricName::OperatingMargin,
        formula: MetricFormula::Ratio {
            numerator: OperatingIncome,
            denominator: Revenue,
        },
    },
    MetricDefinition {
        name: MetricName::NetMargin,
        formula: MetricFormula::Ratio {
            numerator: NetIncome,
            denominator: Revenue,
        },
    },
    MetricDefinition {
        name: MetricName::EbitdaMargin,
        formula: MetricFormula::Ratio {
            numerator: Ebitda,
            denominator: Revenue,
        },
    },
    MetricDefinition {
        name: MetricName::YoYRevenueGrowth,
        formula: MetricFormula::Growth { item: Revenue },
    },
    MetricDefinition {
        name: MetricName::YoYNetIncomeGrowth,
        formula: MetricFormula::Growth { item: NetIncome },
    },
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Metric {
    pub name: MetricName,
    pub formula: String,
    /// `None` when undefined for the period.
    pub values: BTreeMap<String, Option<f64>>,
}

impl Metric {
    pub fn value(&self, period: &str) -> Option<f64> {
        self.values.get(period).copied().flatten()
    }
}

fn finite(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

pub fn ratio(numerator: Option<f64>, denominator: Option<f64>) -> Option<f64> {
    match (numerator, denominator) {
        (Some(n), Some(d)) if d != 0.0 => finite(n / d),
        _ => None,
    }
}

pub fn growth(current: Option<f64>, prior: Option<f64>) -> Option<f64> {
    match (current, prior) {
        (Some(c), Some(p)) if p != 0.0 => finite((c - p) / p),
        _ => None,
    }
}

pub struct MetricsEngine {
    definitions: Vec<MetricDefinition>,
}

impl Default for MetricsEngine {
    fn default() -> Self {
        Self::new(DEFAULT_METRICS.to_vec())
    }
}

impl MetricsEngine {
    pub fn new(definitions: Vec<MetricDefinition>) -> Self {
        Self { definitions }
    }

    pub fn definitions(&self) -> &[MetricDefinition] {
        &self.definitions
    }

    /// Pure function of its inputs: recomputing yields identical metrics.
    pub fn compute(&self, statement: &Statement, periods: &[PeriodColumn]) -> Vec<Metric> {
        self.definitions
            .iter()
            .map(|definition| {
                let values = statement
                    .periods()
                    .iter()
                    .map(|period| (period.clone(), self.evaluate(definition, statement, periods, period)))
                    .collect::<BTreeMap<_, _>>();

                debug!(
                    "{}: defined for {} of {} periods",
                    definition.name,
                    values.values().filter(|v| v.is_some()).count(),
                    values.len()
                );

                Metric {
                    name: definition.name,
                    formula: definition.formula.to_string(),
                    values,
                }
            })
            .collect()
    }

    fn evaluate(
        &self,
        definition: &MetricDefinition,
        statement: &Statement,
        periods: &[PeriodColumn],
        period: &str,
    ) -> Option<f64> {
        match definition.formula {
            MetricFormula::Ratio {
                numerator,
                denominator,
            } => ratio(
                statement.value(period, numerator),
                statement.value(period, denominator),
            ),
            MetricFormula::Growth { item } => {
                let column = periods.iter().find(|p| p.id == period)?;
                let prior = column.kind.prior_year().id();
                if !statement.has_period(&prior) {
                    return None;
                }
                growth(statement.value(period, item), statement.value(&prior, item))
            }
        }
    }
}

/// `name → value` for one period, in declaration order of the metric list.
pub fn metrics_for_period(metrics: &[Metric], period: &str) -> Vec<(MetricName, Option<f64>)> {
    metrics.iter().map(|m| (m.name, m.value(period))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::period::PeriodKind;
    use crate::{StatementCell, ValueOrigin};
    use chrono::NaiveDate;

    fn column(year: i32, index: usize) -> PeriodColumn {
        PeriodColumn {
            column_index: index,
            raw_label: format!("FY{}", year),
            id: format!("FY{}", year),
            kind: PeriodKind::FiscalYear { year },
            end_date: NaiveDate::from_ymd_opt(year, 12, 31).unwrap(),
        }
    }

    fn build(values: &[(&str, CanonicalLineItem, f64)]) -> (Statement, Vec<PeriodColumn>) {
        let periods = vec![column(2023, 1), column(2022, 2)];
        let mut statement = Statement::new(periods.iter().map(|p| p.id.clone()).collect());
        for (period, item, value) in values {
            statement.insert(
                period,
                *item,
                StatementCell {
                    value: *value,
                    origin: ValueOrigin::Reported,
                    source_row: None,
                    logic: String::new(),
                },
            );
        }
        (statement, periods)
    }

    fn find(metrics: &[Metric], name: MetricName) -> &Metric {
        metrics.iter().find(|m| m.name == name).unwrap()
    }

    #[test]
    fn test_margins_and_growth() {
        let (statement, periods) = build(&[
            ("FY2023", Revenue, 1000.0),
            ("FY2023", GrossProfit, 600.0),
            ("FY2023", NetIncome, 100.0),
            ("FY2022", Revenue, 800.0),
            ("FY2022", NetIncome, -50.0),
        ]);
        let metrics = MetricsEngine::default().compute(&statement, &periods);

        assert_eq!(find(&metrics, MetricName::GrossMargin).value("FY2023"), Some(0.6));
        assert_eq!(find(&metrics, MetricName::NetMargin).value("FY2023"), Some(0.1));
        assert_eq!(
            find(&metrics, MetricName::YoYRevenueGrowth).value("FY2023"),
            Some(0.25)
        );
        // Growth off a loss divides by the signed prior value
        assert_eq!(
            find(&metrics, MetricName::YoYNetIncomeGrowth).value("FY2023"),
            Some(-3.0)
        );
        assert_eq!(find(&metrics, MetricName::YoYRevenueGrowth).value("FY2022"), None);
        assert_eq!(find(&metrics, MetricName::EbitdaMargin).value("FY2023"), None);
    }

    #[test]
    fn test_zero_revenue_is_undefined() {
        let (statement, periods) = build(&[("FY2023", Revenue, 0.0), ("FY2023", GrossProfit, 10.0)]);
        let metrics = MetricsEngine::default().compute(&statement, &periods);
        let margin = find(&metrics, MetricName::GrossMargin);
        assert_eq!(margin.value("FY2023"), None);
        assert!(margin.values.contains_key("FY2023"));
    }

    #[test]
    fn test_compute_is_idempotent() {
        let (statement, periods) = build(&[
            ("FY2023", Revenue, 1000.0),
            ("FY2023", OperatingIncome, 150.0),
            ("FY2022", Revenue, 900.0),
        ]);
        let engine = MetricsEngine::default();
        assert_eq!(
            engine.compute(&statement, &periods),
            engine.compute(&statement, &periods)
        );
    }

    #[test]
    fn test_helpers() {
        assert_eq!(ratio(Some(1.0), Some(0.0)), None);
        assert_eq!(ratio(None, Some(2.0)), None);
        assert_eq!(ratio(Some(f64::INFINITY), Some(2.0)), None);
        assert_eq!(growth(Some(110.0), Some(100.0)), Some(0.1));
        assert_eq!(growth(Some(110.0), Some(0.0)), None);
        assert_eq!(growth(Some(-50.0), Some(-100.0)), Some(-0.5));
    }

    #[test]
    fn test_formula_display() {
        assert_eq!(
            DEFAULT_METRICS[0].formula.to_string(),
            "GrossProfit / Revenue"
        );
        assert_eq!(
            DEFAULT_METRICS[4].formula.to_string(),
            "yoy_growth(Revenue)"
        );
    }
}
