use crate::assembler::{Anomaly, Statement};
use crate::config::AssemblySettings;
use crate::taxonomy::{CanonicalLineItem, SubtotalFormula};
use crate::{StatementCell, ValueOrigin};
use log::{debug, warn};

/// Checks reported subtotals against their components and fills the gaps.
pub struct SubtotalReconciler<'a> {
    settings: &'a AssemblySettings,
}

impl<'a> SubtotalReconciler<'a> {
    pub fn new(settings: &'a AssemblySettings) -> Self {
        Self { settings }
    }

    /// `max(rel × max(|a|, |b|), abs)`
    pub fn tolerance(&self, a: f64, b: f64) -> f64 {
        (self.settings.relative_tolerance * a.abs().max(b.abs()))
            .max(self.settings.absolute_tolerance)
    }

    /// Value of `formula` for `period`, or `None` if any component is missing.
    pub fn computed_value(
        &self,
        statement: &Statement,
        period: &str,
        formula: &SubtotalFormula,
    ) -> Option<f64> {
        components_value(statement, period, formula, true)
    }

    /// Walks the subtotal formulas in dependency order for every period. A reported
    /// subtotal is only checked against components the sheet reported itself; outside
    /// tolerance it yields one `SubtotalMismatch` and is kept as is. A missing subtotal
    /// is filled with the computed value when configured to.
    pub fn reconcile(&self, statement: &mut Statement) -> Vec<Anomaly> {
        let mut anomalies = Vec::new();
        let periods = statement.periods().to_vec();

        for formula in CanonicalLineItem::subtotal_formulas() {
            for period in &periods {
                let reported = statement
                    .cell(period, formula.item)
                    .map(|cell| (cell.value, cell.origin));

                match reported {
                    Some((_, ValueOrigin::Computed)) => {}
                    Some((reported, _)) => {
                        if let Some(computed) = components_value(statement, period, formula, false) {
                            anomalies.extend(self.compare(period, formula, reported, computed));
                        }
                    }
                    None if self.settings.fill_missing_subtotals => {
                        let Some(computed) = components_value(statement, period, formula, true) else {
                            continue;
                        };
                        debug!(
                            "Filling {} for {} with computed value {}",
                            formula.item, period, computed
                        );
                        statement.insert(
                            period,
                            formula.item,
                            StatementCell {
                                value: computed,
                                origin: ValueOrigin::Computed,
                                source_row: None,
                                logic: format!("Computed as {}", formula),
                            },
                        );
                    }
                    None => {}
                }
            }
        }

        anomalies
    }

    /// Read-only mismatch scan over reported values only.
    pub fn verify(&self, statement: &Statement) -> Vec<Anomaly> {
        let mut anomalies = Vec::new();
        for formula in CanonicalLineItem::subtotal_formulas() {
            for period in statement.periods() {
                let reported = match statement.cell(period, formula.item) {
                    Some(cell) if cell.origin != ValueOrigin::Computed => cell.value,
                    _ => continue,
                };
                if let Some(computed) = components_value(statement, period, formula, false) {
                    anomalies.extend(self.compare(period, formula, reported, computed));
                }
            }
        }
        anomalies
    }

    fn compare(
        &self,
        period: &str,
        formula: &SubtotalFormula,
        reported: f64,
        computed: f64,
    ) -> Option<Anomaly> {
        let difference = (reported - computed).abs();
        let tolerance = self.tolerance(reported, computed);
        if difference <= tolerance {
            return None;
        }

        warn!(
            "Subtotal mismatch for {} in {}: reported {}, computed {} ({})",
            formula.item, period, reported, computed, formula
        );
        Some(Anomaly::SubtotalMismatch {
            period: period.to_string(),
            item: formula.item,
            reported,
            computed,
            difference,
            tolerance,
        })
    }
}

/// Sums the formula terms; `None` when a component is missing, or was itself
/// computed and `allow_computed` is off.
fn components_value(
    statement: &Statement,
    period: &str,
    formula: &SubtotalFormula,
    allow_computed: bool,
) -> Option<f64> {
    formula.terms.iter().try_fold(0.0, |acc, (coefficient, component)| {
        let cell = statement.cell(period, *component)?;
        if cell.origin == ValueOrigin::Computed && !allow_computed {
            return None;
        }
        Some(acc + coefficient * cell.value)
    })
}

pub fn reconcile_subtotals(settings: &AssemblySettings, statement: &mut Statement) -> Vec<Anomaly> {
    SubtotalReconciler::new(settings).reconcile(statement)
}
